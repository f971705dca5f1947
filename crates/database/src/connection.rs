use crate::backend::{Backend, Connector};
use crate::error::DbError;
use crate::postgres::PgConnector;
use crate::transaction::Database;
use configuration::DatabaseSettings;
use sqlx::PgPool;
use std::fmt;
use std::time::Duration;

/// Where a connection should point: the datastore server itself, or one named
/// database on it.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    password: String,
    pub database: Option<String>,
}

impl ConnectTarget {
    /// A target addressing the server, not any specific database.
    pub fn server(settings: &DatabaseSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            user: settings.user.clone(),
            password: settings.password.clone(),
            database: None,
        }
    }

    /// The same server, addressing the named database.
    pub fn with_database(&self, name: &str) -> Self {
        Self {
            database: Some(name.to_string()),
            ..self.clone()
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

// The password never makes it into logs or error messages.
impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)?;
        match &self.database {
            Some(database) => write!(f, "/{}", database),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

/// Fixed-interval retry policy used while the datastore is still booting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of connection attempts, including the first one.
    pub attempts: u32,
    /// Wait between two consecutive attempts.
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(10),
        }
    }
}

impl From<&DatabaseSettings> for RetryPolicy {
    fn from(settings: &DatabaseSettings) -> Self {
        Self {
            attempts: settings.connect_attempts,
            interval: Duration::from_secs(settings.retry_interval_secs),
        }
    }
}

/// Opens a connection to `target`, retrying on failure according to `policy`.
///
/// Every failed attempt except the last is followed by a wait of
/// `policy.interval`. Once the attempts are exhausted the last driver error is
/// returned inside [`DbError::Unreachable`].
pub async fn connect_with_retry<C: Connector>(
    connector: &C,
    target: &ConnectTarget,
    policy: RetryPolicy,
) -> Result<C::Backend, DbError> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match connector.connect(target).await {
            Ok(backend) => {
                tracing::info!(%target, attempt, "Connected to the datastore.");
                return Ok(backend);
            }
            Err(e) if attempt >= attempts => {
                tracing::error!(%target, attempts, error = %e, "Giving up on the datastore.");
                return Err(DbError::Unreachable {
                    target: target.to_string(),
                    attempts,
                    source: Box::new(e),
                });
            }
            Err(e) => {
                tracing::warn!(
                    %target,
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "Datastore not reachable yet, retrying in {:?}.",
                    policy.interval
                );
                tokio::time::sleep(policy.interval).await;
                attempt += 1;
            }
        }
    }
}

/// Makes sure `database_name` exists on the configured server and returns the
/// canonical handle bound to it.
///
/// Both the server-level connection used for provisioning and the final
/// connection are retried with the policy from `settings`. Exhausting either
/// one is reported as [`DbError::Unreachable`]; deciding whether that is fatal
/// is left to the caller.
pub async fn provision_and_connect<C: Connector>(
    connector: &C,
    settings: &DatabaseSettings,
    database_name: &str,
) -> Result<Database<C::Backend>, DbError> {
    validate_database_name(database_name)?;
    let policy = RetryPolicy::from(settings);
    let server = ConnectTarget::server(settings);

    let admin = connect_with_retry(connector, &server, policy).await?;
    provision(&admin, database_name).await;
    admin.close().await;

    let target = server.with_database(database_name);
    let backend = connect_with_retry(connector, &target, policy).await?;
    tracing::info!(database = database_name, "Database connection established.");
    Ok(Database::new(backend))
}

/// Establishes the PostgreSQL handle for `database_name`.
///
/// This function reads the connection settings from the environment (and the
/// `.env` file, if any), provisions the database and returns the canonical
/// handle. It is meant to be called once at process start.
pub async fn connect(database_name: &str) -> Result<Database<PgPool>, DbError> {
    let settings = configuration::load_settings()?;
    provision_and_connect(&PgConnector::default(), &settings, database_name).await
}

/// Best-effort `CREATE DATABASE`. An existing database makes the statement
/// fail, which is expected and ignored.
async fn provision<B: Backend>(admin: &B, database_name: &str) {
    let statement = format!("CREATE DATABASE {}", quote_identifier(database_name));
    let result = async {
        let mut session = admin.acquire().await?;
        B::execute(&mut *session, &statement).await
    }
    .await;

    match result {
        Ok(_) => tracing::info!(database = database_name, "Created database."),
        Err(e) => tracing::warn!(
            database = database_name,
            error = %e,
            "CREATE DATABASE did not succeed, assuming the database already exists."
        ),
    }
}

fn validate_database_name(name: &str) -> Result<(), DbError> {
    if name.trim().is_empty() || name.contains('\0') {
        return Err(DbError::InvalidDatabaseName(name.to_string()));
    }
    Ok(())
}

/// Quotes `name` as an SQL identifier.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryServer;
    use tokio::time::Instant;

    fn settings(attempts: u32, interval_secs: u64) -> DatabaseSettings {
        DatabaseSettings {
            host: "db".to_string(),
            port: 5432,
            user: "staff".to_string(),
            password: "s3cret".to_string(),
            connect_attempts: attempts,
            retry_interval_secs: interval_secs,
        }
    }

    #[test]
    fn target_addresses_server_then_database() {
        let server = ConnectTarget::server(&settings(10, 10));
        assert_eq!(server.database, None);
        assert_eq!(server.to_string(), "staff@db:5432");
        assert_eq!(server.password(), "s3cret");

        let database = server.with_database("staff_api");
        assert_eq!(database.database.as_deref(), Some("staff_api"));
        assert_eq!((database.host.as_str(), database.port), ("db", 5432));
        assert_eq!(database.password(), "s3cret");
    }

    #[test]
    fn target_display_and_debug_hide_password() {
        let target = ConnectTarget::server(&settings(10, 10)).with_database("staff_api");
        assert_eq!(target.to_string(), "staff@db:5432/staff_api");
        assert!(!format!("{:?}", target).contains("s3cret"));
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_identifier("staff_api"), "\"staff_api\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let server = MemoryServer::new();
        server.fail_next_connects(3);
        let policy = RetryPolicy {
            attempts: 10,
            interval: Duration::from_secs(10),
        };
        let target = ConnectTarget::server(&settings(10, 10));

        let started = Instant::now();
        connect_with_retry(&server.connector(), &target, policy)
            .await
            .expect("datastore becomes reachable");

        assert_eq!(server.connect_attempts(), 4);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_configured_attempts() {
        let server = MemoryServer::new();
        server.set_unreachable();
        let target = ConnectTarget::server(&settings(4, 2));
        let started = Instant::now();
        let err = connect_with_retry(&server.connector(), &target, RetryPolicy {
            attempts: 4,
            interval: Duration::from_secs(2),
        })
        .await
        .err()
        .expect("datastore never becomes reachable");

        assert!(matches!(err, DbError::Unreachable { attempts: 4, .. }));
        assert_eq!(server.connect_attempts(), 4);
        // Three waits; none after the final attempt.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6));
        assert!(elapsed < Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn provisions_missing_database() {
        let server = MemoryServer::new();
        server.fail_next_connects(2);

        let started = Instant::now();
        let db = provision_and_connect(&server.connector(), &settings(5, 1), "staff_api")
            .await
            .expect("provisioning succeeds");

        assert!(server.has_database("staff_api"));
        assert_eq!(db.backend().database(), Some("staff_api"));
        // Two failures, the admin connection and the final connection.
        assert_eq!(server.connect_attempts(), 4);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn final_connection_exhausts_its_own_attempts() {
        let server = MemoryServer::new();
        server.fail_next_database_connects(u32::MAX);

        let started = Instant::now();
        let result = provision_and_connect(&server.connector(), &settings(3, 1), "staff_api").await;

        assert!(matches!(result, Err(DbError::Unreachable { attempts: 3, .. })));
        // Provisioning went through before the final phase gave up.
        assert!(server.has_database("staff_api"));
        assert_eq!(server.database_connect_attempts(), 3);
        assert_eq!(server.connect_attempts(), 4);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn existing_database_does_not_abort_provisioning() {
        let server = MemoryServer::new();
        assert!(server.create_database("staff_api"));

        let result = provision_and_connect(&server.connector(), &settings(1, 1), "staff_api").await;

        assert!(result.is_ok());
        assert!(server.has_database("staff_api"));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_server_is_reported_not_fatal() {
        let server = MemoryServer::new();
        server.set_unreachable();

        let result = provision_and_connect(&server.connector(), &settings(3, 1), "staff_api").await;

        assert!(matches!(result, Err(DbError::Unreachable { attempts: 3, .. })));
        assert!(!server.has_database("staff_api"));
    }

    #[tokio::test]
    async fn rejects_blank_database_name() {
        let server = MemoryServer::new();
        let result = provision_and_connect(&server.connector(), &settings(1, 1), "  ").await;
        assert!(matches!(result, Err(DbError::InvalidDatabaseName(_))));
        assert_eq!(server.connect_attempts(), 0);
    }
}
