//! Top-level error types for botfleet.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration errors: reported to the caller immediately, never retried,
/// and never the result of a state mutation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("bot directory not found: {path}")]
    BotDirectoryMissing { path: String },

    #[error("config file not found: {path}")]
    ConfigFileMissing { path: String },

    #[error("environment file not found: {path}")]
    EnvFileMissing { path: String },

    #[error("dockerfile not found: {path}")]
    DockerfileMissing { path: String },

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid token for bot {bot}")]
    InvalidToken { bot: String },
}

/// Container runtime gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("resource not found: {name}")]
    NotFound { name: String },

    #[error("failed to connect to container runtime: {0}")]
    Connect(String),

    #[error("runtime operation {operation} failed for {target}: {message}")]
    Operation {
        operation: &'static str,
        target: String,
        message: String,
    },

    #[error("image build failed for {target}: {message}")]
    Build { target: String, message: String },
}

/// Lifecycle supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("bot {bot} is already running")]
    AlreadyRunning { bot: String },

    #[error("bot {bot} not found")]
    BotNotFound { bot: String },

    #[error("restart already in progress for bot {bot}")]
    RestartInFlight { bot: String },

    #[error("bot {bot} could not be recovered after {attempts} attempts")]
    RetriesExhausted { bot: String, attempts: u32 },
}

/// Interval scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid interval string: {raw}")]
    InvalidInterval { raw: String },

    #[error("no schedule found for bot {bot}")]
    NotFound { bot: String },
}
