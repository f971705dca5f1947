//! # Database Crate
//!
//! Connection bootstrapping and transaction propagation for the service's
//! data-access code.
//!
//! ## Architectural Principles
//!
//! - **Bootstrap once:** `provision_and_connect` waits for a datastore that may
//!   still be starting, creates the target database if needed and returns the
//!   process's canonical `Database` handle. Callers own that handle and pass it
//!   to whoever needs data access; there is no global.
//! - **Ambient transactions:** `Database::transaction` threads a `Context`
//!   carrying the open transaction into the unit of work. Nested data-access
//!   code calls `Database::conn(ctx)` and transparently joins it.
//! - **Pluggable driver:** the core only relies on the `Connector` and
//!   `Backend` traits. PostgreSQL (via `sqlx`) is the production backend; the
//!   `memory` backend runs in-process.
//!
//! ## Public API
//!
//! - `connect`: provisions and connects to PostgreSQL using settings from the environment.
//! - `provision_and_connect` / `connect_with_retry`: the bootstrapper, for any `Connector`.
//! - `Database`, `Conn`, `ConnGuard`: the transactional handle.
//! - `Context`: the request-scoped carrier.
//! - `DbError`: the specific error types that can be returned from this crate.

// Declare the modules that constitute this crate.
pub mod backend;
pub mod connection;
pub mod context;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod transaction;

// Re-export the key components to create a clean, public-facing API.
pub use backend::{Backend, Connector};
pub use connection::{connect, connect_with_retry, provision_and_connect, ConnectTarget, RetryPolicy};
pub use context::Context;
pub use error::DbError;
pub use postgres::PgConnector;
pub use transaction::{Conn, ConnGuard, Database};
