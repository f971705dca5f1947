//! In-process datastore.
//!
//! `MemoryServer` behaves like a small database server: it hosts named
//! databases, each holding a string key/value table, accepts `CREATE DATABASE`
//! and supports transactions whose writes stay invisible to everyone else
//! until they commit. Connect failures can be scripted to model a server that
//! is still starting up, either for every target or only for targets that
//! address a database. Commit and rollback failures can be scripted too, and
//! the server keeps counters of transaction outcomes so callers can observe
//! what the transactional handle did.

use crate::backend::{Backend, Connector};
use crate::connection::ConnectTarget;
use crate::DbError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

type Table = Arc<Mutex<BTreeMap<String, String>>>;

const FAIL_FOREVER: u32 = u32::MAX;
const CREATE_DATABASE: &str = "CREATE DATABASE ";

#[derive(Default)]
struct ServerState {
    databases: Mutex<HashMap<String, Table>>,
    failures_remaining: AtomicU32,
    database_failures_remaining: AtomicU32,
    connect_attempts: AtomicU32,
    database_connect_attempts: AtomicU32,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
    begun: AtomicU32,
    committed: AtomicU32,
    rolled_back: AtomicU32,
}

/// Counters of transaction outcomes observed by a [`MemoryServer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStats {
    pub begun: u32,
    pub committed: u32,
    pub rolled_back: u32,
}

#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<ServerState>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            server: self.clone(),
        }
    }

    /// Creates `name` if it does not exist yet. Returns `false` if it did.
    pub fn create_database(&self, name: &str) -> bool {
        let mut databases = self.state.databases.lock();
        if databases.contains_key(name) {
            return false;
        }
        databases.insert(name.to_string(), Table::default());
        true
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.state.databases.lock().contains_key(name)
    }

    /// Reads the committed value of `key` in `database`.
    pub fn read(&self, database: &str, key: &str) -> Option<String> {
        let table = self.table(database)?;
        let value = table.lock().get(key).cloned();
        value
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.state
            .failures_remaining
            .store(count.min(FAIL_FOREVER - 1), Ordering::SeqCst);
    }

    /// Makes every future connection attempt fail.
    pub fn set_unreachable(&self) {
        self.state
            .failures_remaining
            .store(FAIL_FOREVER, Ordering::SeqCst);
    }

    /// Makes the next `count` attempts that address a database fail, while
    /// server-level connections keep succeeding.
    pub fn fail_next_database_connects(&self, count: u32) {
        self.state
            .database_failures_remaining
            .store(count.min(FAIL_FOREVER - 1), Ordering::SeqCst);
    }

    /// Makes the next commit fail. The transaction's writes are discarded.
    pub fn fail_next_commit(&self) {
        self.state.fail_commit.store(true, Ordering::SeqCst);
    }

    /// Makes the next rollback fail.
    pub fn fail_next_rollback(&self) {
        self.state.fail_rollback.store(true, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Connection attempts whose target addressed a database.
    pub fn database_connect_attempts(&self) -> u32 {
        self.state.database_connect_attempts.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TxStats {
        TxStats {
            begun: self.state.begun.load(Ordering::SeqCst),
            committed: self.state.committed.load(Ordering::SeqCst),
            rolled_back: self.state.rolled_back.load(Ordering::SeqCst),
        }
    }

    fn table(&self, database: &str) -> Option<Table> {
        self.state.databases.lock().get(database).cloned()
    }

    fn refuse_connection(&self, target: &ConnectTarget) -> bool {
        if take_failure(&self.state.failures_remaining) {
            return true;
        }
        target.database.is_some() && take_failure(&self.state.database_failures_remaining)
    }
}

fn take_failure(remaining: &AtomicU32) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| match remaining {
            0 => None,
            FAIL_FOREVER => Some(FAIL_FOREVER),
            n => Some(n - 1),
        })
        .is_ok()
}

#[derive(Clone)]
pub struct MemoryConnector {
    server: MemoryServer,
}

#[async_trait]
impl Connector for MemoryConnector {
    type Backend = MemoryPool;

    async fn connect(&self, target: &ConnectTarget) -> Result<MemoryPool, DbError> {
        self.server
            .state
            .connect_attempts
            .fetch_add(1, Ordering::SeqCst);
        if target.database.is_some() {
            self.server
                .state
                .database_connect_attempts
                .fetch_add(1, Ordering::SeqCst);
        }
        if self.server.refuse_connection(target) {
            return Err(DbError::ConnectionError(format!(
                "connection to {} refused",
                target
            )));
        }
        if let Some(database) = &target.database {
            if !self.server.has_database(database) {
                return Err(DbError::ConnectionError(format!(
                    "database {:?} does not exist",
                    database
                )));
            }
        }
        Ok(MemoryPool {
            server: self.server.clone(),
            database: target.database.clone(),
        })
    }
}

/// Connection handle to a [`MemoryServer`], optionally bound to one database.
#[derive(Clone)]
pub struct MemoryPool {
    server: MemoryServer,
    database: Option<String>,
}

impl MemoryPool {
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    fn session(&self, staged: Option<BTreeMap<String, String>>) -> MemorySession {
        MemorySession {
            server: self.server.clone(),
            table: self.database.as_deref().and_then(|db| self.server.table(db)),
            staged,
        }
    }
}

/// A session on a [`MemoryPool`]. Outside a transaction writes are applied
/// immediately; inside one they are staged until commit.
pub struct MemorySession {
    server: MemoryServer,
    table: Option<Table>,
    staged: Option<BTreeMap<String, String>>,
}

impl MemorySession {
    pub fn get(&self, key: &str) -> Result<Option<String>, DbError> {
        if let Some(value) = self.staged.as_ref().and_then(|staged| staged.get(key)) {
            return Ok(Some(value.clone()));
        }
        let table = self.table()?;
        let value = table.lock().get(key).cloned();
        Ok(value)
    }

    pub fn put(&mut self, key: &str, value: &str) -> Result<(), DbError> {
        let table = Arc::clone(self.table()?);
        match self.staged.as_mut() {
            Some(staged) => {
                staged.insert(key.to_string(), value.to_string());
            }
            None => {
                table.lock().insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    fn table(&self) -> Result<&Table, DbError> {
        self.table
            .as_ref()
            .ok_or_else(|| DbError::StatementFailed("no database selected".to_string()))
    }

    fn run(&mut self, statement: &str) -> Result<u64, DbError> {
        let statement = statement.trim().trim_end_matches(';');
        let upper = statement.to_ascii_uppercase();
        if upper.starts_with(CREATE_DATABASE) {
            let name = unquote(statement[CREATE_DATABASE.len()..].trim());
            if self.staged.is_some() {
                return Err(DbError::StatementFailed(
                    "CREATE DATABASE cannot run inside a transaction block".to_string(),
                ));
            }
            if !self.server.create_database(&name) {
                return Err(DbError::StatementFailed(format!(
                    "database {:?} already exists",
                    name
                )));
            }
            return Ok(0);
        }
        if upper == "SELECT 1" {
            return Ok(1);
        }
        Err(DbError::StatementFailed(format!(
            "unsupported statement: {}",
            statement
        )))
    }
}

fn unquote(identifier: &str) -> String {
    match identifier
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        Some(inner) => inner.replace("\"\"", "\""),
        None => identifier.to_string(),
    }
}

/// An open transaction on a [`MemoryPool`]. Dropping it unfinished counts as
/// a rollback.
pub struct MemoryTx {
    session: MemorySession,
    finished: bool,
}

impl MemoryTx {
    fn finish(&mut self, commit: bool) -> Result<(), DbError> {
        self.finished = true;
        let staged = self.session.staged.take().unwrap_or_default();
        let counters = &self.session.server.state;
        let scripted = if commit {
            &counters.fail_commit
        } else {
            &counters.fail_rollback
        };
        if scripted.swap(false, Ordering::SeqCst) {
            // The server ends the transaction either way.
            counters.rolled_back.fetch_add(1, Ordering::SeqCst);
            return Err(DbError::StatementFailed(
                "connection lost while finishing the transaction".to_string(),
            ));
        }
        if commit {
            if !staged.is_empty() {
                self.session.table()?.lock().extend(staged);
            }
            counters.committed.fetch_add(1, Ordering::SeqCst);
        } else {
            counters.rolled_back.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Deref for MemoryTx {
    type Target = MemorySession;

    fn deref(&self) -> &MemorySession {
        &self.session
    }
}

impl DerefMut for MemoryTx {
    fn deref_mut(&mut self) -> &mut MemorySession {
        &mut self.session
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.finished {
            self.session
                .server
                .state
                .rolled_back
                .fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Backend for MemoryPool {
    type Session = MemorySession;
    type Pooled = Box<MemorySession>;
    type Tx = MemoryTx;

    async fn acquire(&self) -> Result<Box<MemorySession>, DbError> {
        Ok(Box::new(self.session(None)))
    }

    async fn begin(&self) -> Result<MemoryTx, DbError> {
        if self.database.is_none() {
            return Err(DbError::BeginFailed("no database selected".to_string()));
        }
        self.server.state.begun.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryTx {
            session: self.session(Some(BTreeMap::new())),
            finished: false,
        })
    }

    async fn commit(mut tx: MemoryTx) -> Result<(), DbError> {
        tx.finish(true)
            .map_err(|e| DbError::CommitFailed(e.to_string()))
    }

    async fn rollback(mut tx: MemoryTx) -> Result<(), DbError> {
        tx.finish(false)
            .map_err(|e| DbError::RollbackFailed(e.to_string()))
    }

    async fn execute(session: &mut MemorySession, statement: &str) -> Result<u64, DbError> {
        session.run(statement)
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool(server: &MemoryServer, database: &str) -> MemoryPool {
        server.create_database(database);
        let target = ConnectTarget::server(&configuration::DatabaseSettings::default())
            .with_database(database);
        server.connector().connect(&target).await.expect("connect")
    }

    #[tokio::test]
    async fn create_database_fails_on_duplicate() {
        let server = MemoryServer::new();
        let admin = server
            .connector()
            .connect(&ConnectTarget::server(&configuration::DatabaseSettings::default()))
            .await
            .expect("connect");
        let mut session = admin.acquire().await.expect("acquire");

        MemoryPool::execute(&mut session, "CREATE DATABASE \"app\"")
            .await
            .expect("first create");
        let second = MemoryPool::execute(&mut session, "create database app;").await;

        assert!(server.has_database("app"));
        assert!(matches!(second, Err(DbError::StatementFailed(_))));
    }

    #[tokio::test]
    async fn unknown_database_is_refused() {
        let server = MemoryServer::new();
        let target = ConnectTarget::server(&configuration::DatabaseSettings::default())
            .with_database("missing");
        assert!(server.connector().connect(&target).await.is_err());
    }

    #[tokio::test]
    async fn staged_writes_apply_on_commit_only() {
        let server = MemoryServer::new();
        let pool = pool(&server, "app").await;

        let mut tx = pool.begin().await.expect("begin");
        tx.put("a", "1").expect("put");
        assert_eq!(tx.get("a").expect("get").as_deref(), Some("1"));
        assert_eq!(server.read("app", "a"), None);
        MemoryPool::commit(tx).await.expect("commit");
        assert_eq!(server.read("app", "a").as_deref(), Some("1"));

        let mut tx = pool.begin().await.expect("begin");
        tx.put("b", "2").expect("put");
        drop(tx);
        assert_eq!(server.read("app", "b"), None);

        assert_eq!(
            server.stats(),
            TxStats {
                begun: 2,
                committed: 1,
                rolled_back: 1
            }
        );
    }

    #[tokio::test]
    async fn database_failures_spare_server_connections() {
        let server = MemoryServer::new();
        server.create_database("app");
        server.fail_next_database_connects(1);
        let admin = ConnectTarget::server(&configuration::DatabaseSettings::default());
        let app = admin.with_database("app");

        assert!(server.connector().connect(&admin).await.is_ok());
        assert!(server.connector().connect(&app).await.is_err());
        assert!(server.connector().connect(&app).await.is_ok());
        assert_eq!(server.connect_attempts(), 3);
        assert_eq!(server.database_connect_attempts(), 2);
    }

    #[tokio::test]
    async fn scripted_commit_failure_discards_writes() {
        let server = MemoryServer::new();
        let pool = pool(&server, "app").await;
        server.fail_next_commit();

        let mut tx = pool.begin().await.expect("begin");
        tx.put("a", "1").expect("put");
        let result = MemoryPool::commit(tx).await;

        assert!(matches!(result, Err(DbError::CommitFailed(_))));
        assert_eq!(server.read("app", "a"), None);
        assert_eq!(server.stats().committed, 0);

        let mut tx = pool.begin().await.expect("begin");
        tx.put("a", "2").expect("put");
        MemoryPool::commit(tx).await.expect("only the next commit fails");
        assert_eq!(server.read("app", "a").as_deref(), Some("2"));
    }
}
