use crate::connection::ConnectTarget;
use crate::DbError;
use async_trait::async_trait;
use std::ops::DerefMut;

/// Opens a connection handle for a [`ConnectTarget`].
///
/// The bootstrapper only ever talks to the datastore through this trait, which
/// lets the retry and provisioning logic run against PostgreSQL in production
/// and against the in-process [`MemoryConnector`](crate::memory::MemoryConnector)
/// in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    type Backend: Backend;

    /// Attempts a single connection. Retrying is the caller's concern.
    async fn connect(&self, target: &ConnectTarget) -> Result<Self::Backend, DbError>;
}

/// A live connection handle to the datastore.
///
/// Implementations are expected to be cheap to clone and safe to share across
/// concurrent requests; each call to [`Backend::begin`] must yield an
/// independent transaction.
#[async_trait]
pub trait Backend: Clone + Send + Sync + 'static {
    /// The driver session queries are issued against.
    type Session: Send;
    /// A session checked out of the pool, outside any transaction.
    type Pooled: DerefMut<Target = Self::Session> + Send;
    /// An open transaction. Dropping it without committing must discard its work.
    type Tx: DerefMut<Target = Self::Session> + Send + 'static;

    async fn acquire(&self) -> Result<Self::Pooled, DbError>;

    async fn begin(&self) -> Result<Self::Tx, DbError>;

    async fn commit(tx: Self::Tx) -> Result<(), DbError>;

    async fn rollback(tx: Self::Tx) -> Result<(), DbError>;

    /// Executes a raw statement and returns the number of affected rows.
    async fn execute(session: &mut Self::Session, statement: &str) -> Result<u64, DbError>;

    /// Closes every connection held by this handle.
    async fn close(&self);
}
