//! Persistent bot and schedule state.

pub mod bots;
pub mod schedules;

pub use bots::{BotRecord, BotStatus, BotStore};
pub use schedules::{ScheduleRecord, ScheduleStore};
