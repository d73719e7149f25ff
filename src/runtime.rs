//! Container runtime gateway.
//!
//! The supervisor consumes the container runtime through this narrow
//! interface; everything else in the crate is runtime-agnostic. The real
//! implementation lives in [`docker`], tests substitute mocks.

pub mod docker;

use crate::error::GatewayError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;

pub use docker::DockerGateway;

/// Coarse resource state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Running,
    Exited,
    Dead,
    Other,
}

impl ResourceState {
    /// Whether a resource in this state counts as a detected crash.
    pub fn is_defunct(self) -> bool {
        matches!(self, ResourceState::Exited | ResourceState::Dead)
    }
}

/// A runtime resource backing a bot.
#[derive(Debug, Clone)]
pub struct Resource {
    /// Container name, without any leading slash.
    pub name: String,
    pub state: ResourceState,
    /// Exit code when the resource has stopped; `None` while running or
    /// when the listing endpoint does not report one.
    pub exit_code: Option<i64>,
}

/// Point-in-time resource usage for one container.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceStats {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub memory_percent: f64,
}

/// Everything the gateway needs to build and run one bot container.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub bot: String,
    pub container: String,
    pub image: String,
    /// Build context directory (the bot directory).
    pub context_dir: PathBuf,
    /// Dockerfile name relative to the context directory.
    pub dockerfile: String,
    pub env: HashMap<String, String>,
    /// Apply an unless-stopped restart policy.
    pub auto_restart: bool,
}

/// Capability contract for the container runtime.
#[async_trait]
pub trait RuntimeGateway: Send + Sync {
    /// Build the bot image from its context directory.
    async fn build(&self, spec: &RunSpec) -> Result<(), GatewayError>;

    /// Create and start the bot container.
    async fn run(&self, spec: &RunSpec) -> Result<(), GatewayError>;

    /// Inspect a container by name. `NotFound` when it does not exist.
    async fn get(&self, container: &str) -> Result<Resource, GatewayError>;

    /// Stop a container, waiting up to `timeout_secs` before the kill.
    async fn stop(&self, container: &str, timeout_secs: i32) -> Result<(), GatewayError>;

    /// Remove a container.
    async fn remove(&self, container: &str, force: bool) -> Result<(), GatewayError>;

    /// List supervisor-managed containers, including stopped ones when
    /// `all` is set.
    async fn list_managed(&self, all: bool) -> Result<Vec<Resource>, GatewayError>;

    /// Fetch a resource-usage snapshot. Doubles as a responsiveness probe.
    async fn stats(&self, container: &str) -> Result<ResourceStats, GatewayError>;
}
