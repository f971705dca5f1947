use clap::{Parser, Subcommand};
use configuration::DatabaseSettings;
use database::memory::MemoryServer;
use database::{provision_and_connect, Backend, Context, Database, DbError};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// The process-startup entry point: brings the datastore up once and hands the
/// resulting handle to the command being run.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command-line arguments
    let cli = Cli::parse();

    // Execute the appropriate command
    match cli.command {
        Commands::Provision(args) => handle_provision(args).await?,
        Commands::Check(args) => handle_check(args).await?,
    }

    Ok(())
}

// ==============================================================================
// CLI Structure
// ==============================================================================

/// Provisions the service database and verifies that transactions work.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for the datastore, create the database if missing and connect to it.
    Provision(DbArgs),
    /// Provision, then run `SELECT 1` inside a transaction.
    Check(CheckArgs),
}

#[derive(Parser)]
struct DbArgs {
    /// Name of the database the service binds to (e.g., "staff_api").
    #[arg(long)]
    database: String,

    /// Run against the in-process memory datastore instead of PostgreSQL.
    #[arg(long)]
    memory: bool,
}

#[derive(Parser)]
struct CheckArgs {
    #[command(flatten)]
    db: DbArgs,

    /// Give up on the check transaction after this many seconds. The clock
    /// starts once the database is connected.
    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,
}

// ==============================================================================
// Command Logic
// ==============================================================================

async fn handle_provision(args: DbArgs) -> anyhow::Result<()> {
    if args.memory {
        let server = MemoryServer::new();
        let db =
            provision_and_connect(&server.connector(), &DatabaseSettings::default(), &args.database)
                .await?;
        tracing::info!(db = %db.id(), database = %args.database, "Memory database ready.");
        return Ok(());
    }

    let db = database::connect(&args.database).await?;
    tracing::info!(db = %db.id(), database = %args.database, "Database ready.");
    db.close().await;
    Ok(())
}

async fn handle_check(args: CheckArgs) -> anyhow::Result<()> {
    if args.db.memory {
        let server = MemoryServer::new();
        let db = provision_and_connect(
            &server.connector(),
            &DatabaseSettings::default(),
            &args.db.database,
        )
        .await?;
        verify_transaction(&db, args.timeout_secs).await?;
        return Ok(());
    }

    let db = database::connect(&args.db.database).await?;
    let result = verify_transaction(&db, args.timeout_secs).await;
    db.close().await;
    result?;
    Ok(())
}

/// Runs `SELECT 1` through the ambient transaction, giving up after
/// `timeout_secs`.
async fn verify_transaction<B: Backend>(db: &Database<B>, timeout_secs: u64) -> Result<(), DbError> {
    let ctx = Context::background().with_timeout(Duration::from_secs(timeout_secs));
    let rows = db
        .transaction(&ctx, |ctx| async move {
            let conn = db.conn(&ctx);
            debug_assert!(conn.in_transaction());
            conn.execute("SELECT 1").await
        })
        .await?;
    tracing::info!(db = %db.id(), rows, "Check transaction committed.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn slow_startup_does_not_eat_the_check_timeout() {
        let server = MemoryServer::new();
        server.fail_next_connects(2);
        let settings = DatabaseSettings {
            retry_interval_secs: 10,
            ..DatabaseSettings::default()
        };

        let started = tokio::time::Instant::now();
        let db = provision_and_connect(&server.connector(), &settings, "staff_api")
            .await
            .expect("datastore comes up");
        assert!(started.elapsed() >= Duration::from_secs(20));

        verify_transaction(&db, 5).await.expect("check runs on a fresh clock");
        assert_eq!(server.stats().committed, 1);
    }

    #[tokio::test]
    async fn expired_check_is_cancelled() {
        let server = MemoryServer::new();
        let db = provision_and_connect(&server.connector(), &DatabaseSettings::default(), "staff_api")
            .await
            .expect("connect");

        let result = verify_transaction(&db, 0).await;

        assert!(matches!(result, Err(DbError::Cancelled)));
        assert_eq!(server.stats().begun, 0);
    }
}
