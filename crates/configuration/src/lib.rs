use config::builder::DefaultState;
use config::ConfigBuilder;

// Declare the modules that make up this crate.
pub mod error;
pub mod settings;

// Re-export the core types to provide a clean public API.
pub use error::ConfigError;
pub use settings::DatabaseSettings;

/// Loads the datastore settings from the environment.
///
/// A `.env` file in the working directory is read first if present; variables
/// already set in the process environment take precedence over it. Missing
/// `DB_HOST`, `DB_PORT`, `DB_USER` or `DB_PASSWORD` is an error.
pub fn load_settings() -> Result<DatabaseSettings, ConfigError> {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!(path = %path.display(), "Loaded .env file."),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!(error = %e, "Ignoring unreadable .env file."),
    }

    let builder = config::Config::builder().add_source(
        config::Environment::with_prefix("DB")
            .prefix_separator("_")
            .try_parsing(true),
    );
    DatabaseSettings::from_source(builder)
}

impl DatabaseSettings {
    /// Deserializes and validates settings from an arbitrary `config` builder.
    pub fn from_source(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let settings = builder.build()?.try_deserialize::<DatabaseSettings>()?;
        settings.validate()?;
        Ok(settings)
    }
}
