use crate::backend::Backend;
use crate::context::Context;
use crate::DbError;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use uuid::Uuid;

type TxSlot<B> = Arc<Mutex<Option<<B as Backend>::Tx>>>;

/// The context entry marking an open transaction. Private, so nothing outside
/// this module can place one in a context.
struct ActiveTx<B: Backend> {
    owner: Uuid,
    slot: TxSlot<B>,
}

/// The canonical database handle of a process.
///
/// It is built once by [`provision_and_connect`](crate::provision_and_connect)
/// and handed to every collaborator that needs data access. Clones share the
/// same underlying connection pool and identity.
#[derive(Clone)]
pub struct Database<B: Backend> {
    backend: B,
    id: Uuid,
}

impl<B: Backend> Database<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            id: Uuid::new_v4(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Runs `work` inside a new transaction.
    ///
    /// `work` receives a context derived from `ctx` that carries the
    /// transaction, so any [`Database::conn`] call made with it joins the
    /// transaction. The transaction commits if `work` returns `Ok` and rolls
    /// back otherwise; the error returned by `work` is handed back unchanged.
    ///
    /// Fails with [`DbError::Cancelled`] without beginning anything if `ctx` is
    /// already cancelled. If `ctx` is cancelled while `work` runs, `work` is
    /// dropped and the transaction rolled back. A panic inside `work` rolls the
    /// transaction back before the panic resumes.
    ///
    /// Every call begins its own transaction on the pool, including calls
    /// made from inside another transaction's `work`.
    pub async fn transaction<T, E, F, Fut>(&self, ctx: &Context, work: F) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        if ctx.is_cancelled() {
            return Err(DbError::Cancelled.into());
        }

        let tx = self.backend.begin().await?;
        tracing::debug!(db = %self.id, "Transaction began.");

        let slot: TxSlot<B> = Arc::new(Mutex::new(Some(tx)));
        let scoped = ctx.with_value(ActiveTx::<B> {
            owner: self.id,
            slot: Arc::clone(&slot),
        });

        let outcome = tokio::select! {
            biased;
            result = AssertUnwindSafe(work(scoped)).catch_unwind() => Some(result),
            _ = ctx.done() => None,
        };

        let Some(tx) = slot.lock().await.take() else {
            return Err(DbError::TransactionFinished.into());
        };

        match outcome {
            Some(Ok(Ok(value))) => {
                B::commit(tx).await?;
                tracing::debug!(db = %self.id, "Transaction committed.");
                Ok(value)
            }
            Some(Ok(Err(err))) => {
                self.rollback_after_failure(tx).await;
                Err(err)
            }
            Some(Err(panic)) => {
                self.rollback_after_failure(tx).await;
                std::panic::resume_unwind(panic)
            }
            None => {
                B::rollback(tx).await?;
                tracing::debug!(db = %self.id, "Transaction rolled back after cancellation.");
                Err(DbError::Cancelled.into())
            }
        }
    }

    /// The failure that caused the rollback wins; a failing rollback is only logged.
    async fn rollback_after_failure(&self, tx: B::Tx) {
        match B::rollback(tx).await {
            Ok(()) => tracing::debug!(db = %self.id, "Transaction rolled back."),
            Err(e) => tracing::error!(db = %self.id, error = %e, "Failed to roll back transaction."),
        }
    }

    /// Resolves the handle queries should go through for `ctx`: the
    /// transaction `ctx` carries if it was opened by this database, the plain
    /// connection otherwise.
    pub fn conn(&self, ctx: &Context) -> Conn<'_, B> {
        ctx.values::<ActiveTx<B>>()
            .find(|active| active.owner == self.id)
            .map(|active| Conn::Transaction(Arc::clone(&active.slot)))
            .unwrap_or(Conn::Plain(&self.backend))
    }

    pub async fn close(&self) {
        self.backend.close().await;
    }
}

impl<B: Backend> fmt::Debug for Database<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").field("id", &self.id).finish()
    }
}

/// A handle resolved by [`Database::conn`].
pub enum Conn<'a, B: Backend> {
    Plain(&'a B),
    Transaction(TxSlot<B>),
}

impl<B: Backend> Conn<'_, B> {
    pub fn in_transaction(&self) -> bool {
        matches!(self, Conn::Transaction(_))
    }

    /// Checks out a session to run queries on.
    ///
    /// Inside a transaction the session is the transaction itself and is held
    /// exclusively until the guard is dropped, so drop it before acquiring
    /// again from the same context. Waiting on a held session is logged.
    pub async fn acquire(&self) -> Result<ConnGuard<B>, DbError> {
        match self {
            Conn::Plain(backend) => Ok(ConnGuard::Pooled(backend.acquire().await?)),
            Conn::Transaction(slot) => {
                let guard = match Arc::clone(slot).try_lock_owned() {
                    Ok(guard) => guard,
                    Err(_) => {
                        tracing::warn!(
                            "Transaction session is held by another guard; waiting for it to be released."
                        );
                        Arc::clone(slot).lock_owned().await
                    }
                };
                OwnedMutexGuard::try_map(guard, |tx| tx.as_mut())
                    .map(ConnGuard::Transaction)
                    .map_err(|_| DbError::TransactionFinished)
            }
        }
    }

    /// Executes a raw statement on the resolved handle.
    pub async fn execute(&self, statement: &str) -> Result<u64, DbError> {
        let mut session = self.acquire().await?;
        B::execute(&mut *session, statement).await
    }
}

/// A session checked out through [`Conn::acquire`].
pub enum ConnGuard<B: Backend> {
    Pooled(B::Pooled),
    Transaction(OwnedMappedMutexGuard<Option<B::Tx>, B::Tx>),
}

impl<B: Backend> Deref for ConnGuard<B> {
    type Target = B::Session;

    fn deref(&self) -> &B::Session {
        match self {
            ConnGuard::Pooled(session) => &**session,
            ConnGuard::Transaction(tx) => &***tx,
        }
    }
}

impl<B: Backend> DerefMut for ConnGuard<B> {
    fn deref_mut(&mut self) -> &mut B::Session {
        match self {
            ConnGuard::Pooled(session) => &mut **session,
            ConnGuard::Transaction(tx) => &mut ***tx,
        }
    }
}
