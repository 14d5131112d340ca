mod config;
mod db;
mod document;
mod ingest;
mod models;
mod mqtt_connection;
mod parser;
mod rest_server;
mod sink;
mod supervisor;

use crate::config::Config;
use crate::db::DatabaseService;
use crate::ingest::IngestPipeline;
use crate::rest_server::run_rest_server;
use crate::supervisor::Supervisor;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Load configuration first: LOG_FILE decides where the subscriber writes.
    let config = match Config::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            eprintln!("Error loading configuration: {e:?}");
            std::process::exit(1);
        }
    };

    init_logging(config.log_file.as_deref());

    let db_service = match DatabaseService::new(&config.database_path) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to create database service: {:?}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = db_service.initialize_db() {
        error!("Database initialization failed: {:?}", e);
        std::process::exit(1);
    }
    info!("Database initialized successfully.");

    // A fresh registry gets one default subscription so ingestion starts
    // immediately.
    let default_broker = format!(
        "{}:{}",
        config.default_broker_url, config.default_broker_port
    );
    let default_pattern = format!("{}#", config.default_topic_prefix);
    if let Err(e) = db_service.seed_default_subscription(&default_broker, &default_pattern) {
        error!("Failed to seed default subscription: {:?}", e);
        std::process::exit(1);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pipeline = IngestPipeline::new(db_service.clone());
    let supervisor = Supervisor::new(
        db_service.clone(),
        pipeline,
        Duration::from_secs(config.refresh_interval_secs),
        Duration::from_secs(config.registry_retry_secs),
        shutdown_rx,
    );
    let supervisor_task = tokio::spawn(supervisor.run());

    let rest_db = db_service.clone();
    let rest_task = tokio::spawn(async move {
        run_rest_server(rest_db).await;
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    }
    info!("Shutdown signal received, stopping services...");

    let _ = shutdown_tx.send(true);
    let _ = supervisor_task.await;
    rest_task.abort();

    info!("All services shut down successfully.");
}

fn init_logging(log_file: Option<&str>) {
    match log_file.map(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
    }) {
        Some(Ok(file)) => {
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::INFO)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        Some(Err(e)) => {
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::INFO)
                .init();
            error!("Could not open log file, falling back to stdout: {e}");
        }
        None => {
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::INFO)
                .init();
        }
    }
}
