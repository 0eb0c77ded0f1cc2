pub mod config;
pub mod error;
pub mod query;
pub mod session;
pub mod template;

use thiserror::Error;

pub use error::{CancelReason, DriverError, Phase};
pub use query::{OneShotExecutor, Row};
pub use session::{CursorPool, Direction, PgConnector, PoolConfig, QueryContext};
pub use template::{render, Params};

#[derive(Error, Debug)]
pub enum PgReportError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database unreachable: {0}")]
    Connectivity(#[source] DriverError),

    #[error("Failed to declare cursor for session {session_id}: {source}")]
    CursorDeclare {
        session_id: String,
        #[source]
        source: DriverError,
    },

    #[error("No active session: {0}")]
    SessionNotFound(String),

    #[error("Query failed during {phase}: {source}")]
    QueryExecution {
        phase: Phase,
        #[source]
        source: DriverError,
    },

    #[error("{phase} cancelled: {reason}")]
    Cancelled { phase: Phase, reason: CancelReason },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

pub type Result<T> = std::result::Result<T, PgReportError>;

impl PgReportError {
    /// Get the PostgreSQL error code for this error
    pub fn sqlstate(&self) -> &str {
        match self {
            PgReportError::Configuration(_) => "F0000", // config_file_error
            PgReportError::Connectivity(e) => e.code().unwrap_or("08006"), // connection_failure
            PgReportError::CursorDeclare { source, .. } => source.code().unwrap_or("XX000"),
            PgReportError::SessionNotFound(_) => "34000", // invalid_cursor_name
            PgReportError::QueryExecution { source, .. } => source.code().unwrap_or("XX000"),
            PgReportError::Cancelled { .. } => "57014", // query_canceled
            PgReportError::InvalidParameter(_) => "22023", // invalid_parameter_value
        }
    }

    /// Whether the error came from a cancelled or timed out call
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PgReportError::Cancelled { .. })
    }
}
