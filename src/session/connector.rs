use crate::error::DriverError;
use crate::query::row::{materialize, Row};
use async_trait::async_trait;
use tokio_postgres::NoTls;
use tracing::{debug, warn};

/// A single database connection owned by one cursor session or one-shot query
#[async_trait]
pub trait CursorConnection: Send + 'static {
    /// Run statements that return no rows (BEGIN, DECLARE, MOVE, ROLLBACK)
    async fn execute(&mut self, sql: &str) -> Result<(), DriverError>;

    /// Run a statement and materialize every row it returns
    async fn query(&mut self, sql: &str) -> Result<Vec<Row>, DriverError>;

    fn is_closed(&self) -> bool;
}

/// Opens connections to the report database
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: CursorConnection;

    async fn connect(&self) -> Result<Self::Connection, DriverError>;
}

/// Connector for a PostgreSQL server reached through tokio-postgres
#[derive(Clone)]
pub struct PgConnector {
    config: tokio_postgres::Config,
}

impl PgConnector {
    pub fn new(config: tokio_postgres::Config) -> Self {
        PgConnector { config }
    }

    pub fn config(&self) -> &tokio_postgres::Config {
        &self.config
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection, DriverError> {
        let (client, connection) = self.config.connect(NoTls).await?;

        // The connection future drives the socket; it resolves once the client is dropped
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("PostgreSQL connection error: {}", e);
            }
        });

        debug!("Opened PostgreSQL connection");
        Ok(PgConnection { client })
    }
}

pub struct PgConnection {
    client: tokio_postgres::Client,
}

#[async_trait]
impl CursorConnection for PgConnection {
    async fn execute(&mut self, sql: &str) -> Result<(), DriverError> {
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<Vec<Row>, DriverError> {
        let rows = self.client.query(sql, &[]).await?;
        Ok(rows.iter().map(materialize).collect())
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}
