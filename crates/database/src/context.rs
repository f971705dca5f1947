//! Request-scoped context carrier.
//!
//! A [`Context`] is an immutable chain of typed values plus a cancellation
//! signal and an optional deadline. Deriving a context never changes the one
//! it was derived from, so a value is only visible to calls that received the
//! derived context (or a descendant of it).
//!
//! Values are keyed by their Rust type. A lookup for `T` can only ever yield a
//! `T`, so a value stored by unrelated code can never be mistaken for another.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

struct Entry {
    value: Box<dyn Any + Send + Sync>,
    parent: Option<Arc<Entry>>,
}

#[derive(Clone, Default)]
pub struct Context {
    head: Option<Arc<Entry>>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// An empty context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Returns a child context carrying `value` on top of everything `self` carries.
    pub fn with_value<T: Any + Send + Sync>(&self, value: T) -> Self {
        Self {
            head: Some(Arc::new(Entry {
                value: Box::new(value),
                parent: self.head.clone(),
            })),
            ..self.clone()
        }
    }

    /// The most recently attached value of type `T`.
    pub fn value<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values::<T>().next()
    }

    /// Every value of type `T`, innermost first.
    pub fn values<T: Any + Send + Sync>(&self) -> impl Iterator<Item = &T> + '_ {
        std::iter::successors(self.head.as_deref(), |entry| entry.parent.as_deref())
            .filter_map(|entry| entry.value.downcast_ref::<T>())
    }

    /// Returns a child context together with the token that cancels it.
    ///
    /// Cancelling the parent cancels the child; cancelling the child leaves the
    /// parent untouched.
    pub fn with_cancellation(&self) -> (Self, CancellationToken) {
        let token = self.cancel.child_token();
        let ctx = Self {
            cancel: token.clone(),
            ..self.clone()
        };
        (ctx, token)
    }

    /// Returns a child context that expires at `deadline`, or earlier if the
    /// parent already has a sooner deadline.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current <= deadline => current,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| d <= Instant::now())
    }

    /// Resolves once the context is cancelled or its deadline passes. Never
    /// resolves for a background context.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let depth =
            std::iter::successors(self.head.as_deref(), |entry| entry.parent.as_deref()).count();
        f.debug_struct("Context")
            .field("values", &depth)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct RequestId(u32);

    #[test]
    fn derived_values_do_not_leak_into_parent() {
        let root = Context::background();
        let child = root.with_value(RequestId(7));

        assert_eq!(child.value::<RequestId>(), Some(&RequestId(7)));
        assert_eq!(root.value::<RequestId>(), None);
    }

    #[test]
    fn innermost_value_shadows_outer() {
        let ctx = Context::background()
            .with_value(RequestId(1))
            .with_value("unrelated")
            .with_value(RequestId(2));

        assert_eq!(ctx.value::<RequestId>(), Some(&RequestId(2)));
        let all: Vec<_> = ctx.values::<RequestId>().collect();
        assert_eq!(all, vec![&RequestId(2), &RequestId(1)]);
        assert_eq!(ctx.value::<&str>(), Some(&"unrelated"));
        assert_eq!(ctx.value::<u64>(), None);
    }

    #[test]
    fn cancellation_flows_from_parent_to_child_only() {
        let (parent, parent_token) = Context::background().with_cancellation();
        let (child, child_token) = parent.with_cancellation();

        child_token.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let (other_child, _) = parent.with_cancellation();
        parent_token.cancel();
        assert!(parent.is_cancelled());
        assert!(other_child.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires() {
        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        assert!(!ctx.is_cancelled());

        ctx.done().await;
        assert!(ctx.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn sooner_parent_deadline_wins() {
        let parent = Context::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
