use crate::backend::{Backend, Connector};
use crate::connection::ConnectTarget;
use crate::DbError;
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPoolOptions, PgSslMode};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;

/// Opens PostgreSQL connection pools.
#[derive(Debug, Clone)]
pub struct PgConnector {
    max_connections: u32,
    acquire_timeout: Duration,
}

impl Default for PgConnector {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl PgConnector {
    pub fn new(max_connections: u32, acquire_timeout: Duration) -> Self {
        Self {
            max_connections,
            acquire_timeout,
        }
    }

    /// Translates a target into driver options: no TLS, sessions in UTC.
    pub fn connect_options(target: &ConnectTarget) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .username(&target.user)
            .password(target.password())
            .ssl_mode(PgSslMode::Disable)
            .options([("TimeZone", "UTC")]);
        match &target.database {
            Some(database) => options.database(database),
            None => options,
        }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Backend = PgPool;

    async fn connect(&self, target: &ConnectTarget) -> Result<PgPool, DbError> {
        // `connect_with` opens the first connection eagerly, so an unreachable
        // server fails here rather than on first use.
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect_with(Self::connect_options(target))
            .await
            .map_err(|e| DbError::ConnectionError(e.to_string()))
    }
}

#[async_trait]
impl Backend for PgPool {
    type Session = PgConnection;
    type Pooled = PoolConnection<Postgres>;
    type Tx = Transaction<'static, Postgres>;

    async fn acquire(&self) -> Result<PoolConnection<Postgres>, DbError> {
        Ok(sqlx::Pool::acquire(self).await?)
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, DbError> {
        sqlx::Pool::begin(self)
            .await
            .map_err(|e| DbError::BeginFailed(e.to_string()))
    }

    async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), DbError> {
        tx.commit()
            .await
            .map_err(|e| DbError::CommitFailed(e.to_string()))
    }

    async fn rollback(tx: Transaction<'static, Postgres>) -> Result<(), DbError> {
        tx.rollback()
            .await
            .map_err(|e| DbError::RollbackFailed(e.to_string()))
    }

    async fn execute(session: &mut PgConnection, statement: &str) -> Result<u64, DbError> {
        let result = sqlx::Executor::execute(session, sqlx::raw_sql(statement))
            .await
            .map_err(|e| DbError::StatementFailed(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn close(&self) {
        sqlx::Pool::close(self).await;
    }
}
