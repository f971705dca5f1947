use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Failed to load configuration for database connection: {0}")]
    ConnectionConfigError(#[from] configuration::ConfigError),

    #[error("Invalid database name {0:?}")]
    InvalidDatabaseName(String),

    #[error("Datastore at {target} unreachable after {attempts} attempts: {source}")]
    Unreachable {
        target: String,
        attempts: u32,
        #[source]
        source: Box<DbError>,
    },

    #[error("Failed to connect to the database: {0}")]
    ConnectionError(String),

    #[error("Failed to begin transaction: {0}")]
    BeginFailed(String),

    #[error("Failed to commit transaction: {0}")]
    CommitFailed(String),

    #[error("Failed to rollback transaction: {0}")]
    RollbackFailed(String),

    #[error("Statement failed: {0}")]
    StatementFailed(String),

    #[error("The request context was cancelled")]
    Cancelled,

    #[error("The transaction bound to this context has already finished")]
    TransactionFinished,

    #[error("Database driver error: {0}")]
    Driver(#[from] sqlx::Error),
}
