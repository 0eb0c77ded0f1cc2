use std::fmt;
use thiserror::Error;

/// Stage of a pool operation, carried by errors to identify where it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Acquire,
    Connect,
    Ping,
    Begin,
    Declare,
    Move,
    Fetch,
    Query,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Acquire => "connection acquire",
            Phase::Connect => "connect",
            Phase::Ping => "ping",
            Phase::Begin => "begin",
            Phase::Declare => "cursor declare",
            Phase::Move => "cursor move",
            Phase::Fetch => "fetch",
            Phase::Query => "query",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    DeadlineExceeded,
    Cancelled,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::DeadlineExceeded => f.write_str("deadline exceeded"),
            CancelReason::Cancelled => f.write_str("cancelled by caller"),
        }
    }
}

/// Error reported by the database driver.
///
/// Keeps the SQLSTATE code when the server sent one so callers can tell a
/// syntax error in a rendered template apart from a dropped connection.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DriverError {
    code: Option<String>,
    message: String,
    #[source]
    source: Option<tokio_postgres::Error>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        DriverError {
            code: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        DriverError {
            code: Some(code.into()),
            message: message.into(),
            source: None,
        }
    }

    /// SQLSTATE code, if the server reported one
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<tokio_postgres::Error> for DriverError {
    fn from(err: tokio_postgres::Error) -> Self {
        let code = err.code().map(|c| c.code().to_string());
        let message = match err.as_db_error() {
            Some(db) => match db.detail() {
                Some(detail) => format!("{}: {}", db.message(), detail),
                None => db.message().to_string(),
            },
            None => err.to_string(),
        };
        DriverError {
            code,
            message,
            source: Some(err),
        }
    }
}
