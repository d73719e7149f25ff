//! Botfleet: a lifecycle supervisor for a fleet of containerized bots.
//!
//! The supervisor starts and stops bots, detects crashes, retries restarts
//! with exponential backoff, runs scheduled periodic restarts, and notifies
//! an external webhook of state changes. Bot and schedule state live in a
//! local SQLite database; containers are driven through a narrow
//! [`runtime::RuntimeGateway`] interface.

pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod monitor;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod watcher;
pub mod webhook;

pub use error::{Error, Result};

/// Label set on every container this supervisor manages.
pub const MANAGED_LABEL: &str = "botfleet.managed";

/// Label carrying the owning bot's name.
pub const BOT_LABEL: &str = "botfleet.bot";

/// Container name prefix for supervisor-managed containers.
pub const CONTAINER_PREFIX: &str = "botfleet_";

/// Container name for a bot.
pub fn container_name(bot: &str) -> String {
    format!("{CONTAINER_PREFIX}{bot}")
}

/// Image tag for a bot.
pub fn image_tag(bot: &str) -> String {
    format!("botfleet/{bot}:latest")
}

/// Resolve the owning bot name from a managed container name.
pub fn bot_from_container(container: &str) -> Option<&str> {
    container
        .trim_start_matches('/')
        .strip_prefix(CONTAINER_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_round_trip() {
        assert_eq!(container_name("alpha"), "botfleet_alpha");
        assert_eq!(bot_from_container("botfleet_alpha"), Some("alpha"));
        // Docker list responses report names with a leading slash.
        assert_eq!(bot_from_container("/botfleet_alpha"), Some("alpha"));
        assert_eq!(bot_from_container("other_alpha"), None);
    }
}
