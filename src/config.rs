use crate::{PgReportError, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "pgreport")]
#[command(about = "pgreport - paged PostgreSQL report queries over server-side cursors", long_about = None)]
pub struct Config {
    // Database connection
    #[arg(long, env = "PGREPORT_DATABASE_URL", help = "Connection string (key=value or postgres:// URL); overrides the individual connection options")]
    pub database_url: Option<String>,

    #[arg(long, default_value = "localhost", env = "PGREPORT_DB_HOST")]
    pub db_host: String,

    #[arg(long, default_value = "5432", env = "PGREPORT_DB_PORT")]
    pub db_port: u16,

    #[arg(long, default_value = "postgres", env = "PGREPORT_DB_USER")]
    pub db_user: String,

    #[arg(long, default_value = "", env = "PGREPORT_DB_PASSWORD", hide_env_values = true)]
    pub db_password: String,

    #[arg(long, default_value = "postgres", env = "PGREPORT_DB_NAME")]
    pub db_name: String,

    #[arg(long, env = "PGREPORT_DB_SCHEMA", help = "Schema placed on the search_path of every connection")]
    pub db_schema: Option<String>,

    #[arg(long, default_value = "info", env = "PGREPORT_LOG_LEVEL")]
    pub log_level: String,

    // Cursor pool configuration
    #[arg(long, default_value = "10", env = "PGREPORT_MAX_CONNECTIONS", help = "Maximum number of open database connections")]
    pub max_connections: usize,

    #[arg(long, default_value = "30", env = "PGREPORT_IDLE_TIMEOUT", help = "Seconds a session may sit unused before its cursor is closed")]
    pub idle_timeout: u64,

    #[arg(long, default_value = "0", env = "PGREPORT_ABSOLUTE_TIMEOUT", help = "Maximum session lifetime in seconds regardless of activity (0 disables)")]
    pub absolute_timeout: u64,

    #[arg(long, default_value = "10", env = "PGREPORT_REAP_INTERVAL", help = "Interval for idle session sweeps in seconds")]
    pub reap_interval: u64,

    #[arg(long, default_value = "10", env = "PGREPORT_PAGE_SIZE", help = "Default number of rows per page")]
    pub page_size: usize,

    #[arg(long, default_value = "10,25,50,100", value_delimiter = ',', env = "PGREPORT_AVAILABLE_PAGE_SIZES", help = "Selectable page sizes, in cycling order")]
    pub available_page_sizes: Vec<usize>,

    #[arg(long, default_value = "5", env = "PGREPORT_PING_TIMEOUT", help = "Seconds the startup health check may take")]
    pub ping_timeout: u64,

    #[arg(long, default_value = "10", env = "PGREPORT_QUERY_TIMEOUT", help = "Seconds each page request may take")]
    pub query_timeout: u64,

    // Report to page through
    #[arg(short, long, env = "PGREPORT_TEMPLATE", help = "SQL template file to run")]
    pub template: Option<PathBuf>,

    #[arg(short = 'P', long = "param", value_parser = parse_param, help = "Template parameter as name=value; a bare name is set to true")]
    pub params: Vec<(String, Value)>,

    #[arg(long, help = "Session id to page under (generated when absent)")]
    pub session: Option<String>,

    #[arg(long, help = "Run a single bounded query instead of opening a cursor")]
    pub one_shot: bool,

    #[arg(long, help = "Print the rendered SQL and exit without connecting")]
    pub render_only: bool,
}

fn parse_param(raw: &str) -> std::result::Result<(String, Value), String> {
    let (name, value) = match raw.split_once('=') {
        Some((name, value)) => (name.trim(), Value::String(value.to_string())),
        None => (raw.trim(), Value::Bool(true)),
    };
    if name.is_empty() {
        return Err(format!("parameter has no name: {raw:?}"));
    }
    Ok((name.to_string(), value))
}

impl Config {
    /// Get a configuration instance with all values resolved from CLI args and environment variables
    pub fn load() -> Self {
        Config::parse()
    }

    /// Build the PostgreSQL connection settings
    pub fn pg_config(&self) -> Result<tokio_postgres::Config> {
        let mut pg = match &self.database_url {
            Some(url) => url
                .parse::<tokio_postgres::Config>()
                .map_err(|e| PgReportError::Configuration(format!("invalid database url: {e}")))?,
            None => {
                if self.db_host.trim().is_empty() {
                    return Err(PgReportError::Configuration("database host is empty".to_string()));
                }
                if self.db_name.trim().is_empty() {
                    return Err(PgReportError::Configuration("database name is empty".to_string()));
                }
                let mut pg = tokio_postgres::Config::new();
                pg.host(&self.db_host)
                    .port(self.db_port)
                    .user(&self.db_user)
                    .dbname(&self.db_name);
                if !self.db_password.is_empty() {
                    pg.password(&self.db_password);
                }
                pg
            }
        };

        if let Some(schema) = &self.db_schema {
            if schema.is_empty() || !schema.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(PgReportError::Configuration(format!("invalid schema name: {schema:?}")));
            }
            pg.options(&format!("-c search_path={schema}"));
        }
        pg.application_name("pgreport");
        Ok(pg)
    }

    pub fn pool_config(&self) -> Result<PoolConfig> {
        let config = PoolConfig {
            max_connections: self.max_connections,
            idle_timeout: Duration::from_secs(self.idle_timeout),
            absolute_timeout: (self.absolute_timeout > 0).then(|| Duration::from_secs(self.absolute_timeout)),
            reap_interval: Duration::from_secs(self.reap_interval),
            page_size: self.page_size,
            available_page_sizes: self.available_page_sizes.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Get the startup ping timeout as Duration
    pub fn ping_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.ping_timeout)
    }

    /// Get the per-request timeout as Duration
    pub fn query_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.query_timeout)
    }

    /// Template parameters given on the command line
    pub fn template_params(&self) -> crate::template::Params {
        self.params.iter().cloned().collect()
    }
}

/// Cursor pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub idle_timeout: Duration,
    /// Sessions older than this are evicted even when active
    pub absolute_timeout: Option<Duration>,
    pub reap_interval: Duration,
    pub page_size: usize,
    pub available_page_sizes: Vec<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_connections: 10,
            idle_timeout: Duration::from_secs(30),
            absolute_timeout: None,
            reap_interval: Duration::from_secs(10),
            page_size: 10,
            available_page_sizes: vec![10, 25, 50, 100],
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(PgReportError::Configuration("max_connections must be at least 1".to_string()));
        }
        if self.page_size == 0 {
            return Err(PgReportError::Configuration("page_size must be at least 1".to_string()));
        }
        if self.available_page_sizes.contains(&0) {
            return Err(PgReportError::Configuration("available_page_sizes may not contain 0".to_string()));
        }
        if self.idle_timeout.is_zero() {
            return Err(PgReportError::Configuration("idle_timeout must be positive".to_string()));
        }
        if self.reap_interval.is_zero() {
            return Err(PgReportError::Configuration("reap_interval must be positive".to_string()));
        }
        Ok(())
    }

    /// The selectable page size after `current`, wrapping around. Falls back
    /// to the default page size when `current` is not selectable.
    pub fn next_page_size(&self, current: usize) -> usize {
        match self.available_page_sizes.iter().position(|&size| size == current) {
            Some(i) => self.available_page_sizes[(i + 1) % self.available_page_sizes.len()],
            None => self.page_size,
        }
    }
}
