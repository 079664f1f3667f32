extern crate tracing_futures;

#[macro_use]
extern crate serde;
#[macro_use]
extern crate lazy_static;

use std::sync::Arc;

use error::BackendError;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::config::Config;
use crate::engine::{Engine, EngineOptions};
use crate::error::ConfigurationError;
use crate::schema::SchemaRegistry;
use crate::store::MongoStore;

pub mod cascade;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod index;
pub mod orchestrator;
pub mod pipeline;
pub mod problem;
pub mod report;
pub mod role;
pub mod schema;
pub mod store;
pub mod txn;
pub mod util;
pub mod validator;

/// Installs the global tracing subscriber. `log` records of dependencies
/// are forwarded to it.
pub fn init_logging(log_level: Option<Level>) {
    if let Some(l) = log_level {
        let subscriber = FmtSubscriber::builder().with_max_level(l).finish();

        if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Unable to set global logger: {}", err);
        };
        if let Err(err) = tracing_log::LogTracer::init() {
            eprintln!("Unable to forward log records: {}", err);
        }
    }
}

/// Reads `.env` and the settings file. A missing settings file is
/// replaced by defaults, which are written back.
pub fn load_config() -> Result<Config, BackendError> {
    tracing::info!("Reading .env file...");
    if dotenv::dotenv().is_err() {
        tracing::warn!("Unable to load .env file.");
    }

    tracing::info!("Loading configuration...");
    match Config::load() {
        Ok(c) => {
            tracing::info!("Configuration loaded.");
            Ok(c)
        }
        Err(ConfigurationError::NotFound(_)) => {
            let c = Config::default();
            if c.save().is_err() {
                tracing::warn!("Unable to save generated configuration.");
            }
            Ok(c)
        }
        Err(other) => {
            tracing::error!("Configuration error: {}", other);
            Err(other.into())
        }
    }
}

/// Opens the MongoDB connection and builds the engine for the configured
/// layout. Pair with [`Engine::shutdown`].
pub async fn connect(c: &Config) -> Result<Engine<MongoStore>, BackendError> {
    tracing::info!("Building {} schema registry...", c.layout);
    let registry = SchemaRegistry::for_layout(c.layout)?;

    tracing::info!("Connecting to MongoDB: {}", c.mongodb_uri);
    let store = match MongoStore::connect(c.mongodb_uri.as_str(), c.mongodb_db.as_str()).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Unable to connect to MongoDB.");
            return Err(e.into());
        }
    };
    tracing::info!("Using MongoDB database: {}", c.mongodb_db);

    Ok(Engine::new(store, Arc::new(registry)).with_options(EngineOptions::from(c)))
}
