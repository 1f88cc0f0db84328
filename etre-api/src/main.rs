//! Etre server entry point.
//!
//! Boot order: config, datasource, CDC store and change-stream server,
//! schema reconciliation, auth, then the axum HTTP server until ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use etre_core::{Error, Result};
use tracing_subscriber::EnvFilter;

use etre_api::auth::{AllowAll, Manager};
use etre_api::cdc::{
    store::RetryPolicy, CdcStore, CdcWriter, ChangeStreamServer, NoopCdcWriter, ServerConfig,
    StreamerFactory,
};
use etre_api::db::{EntityBackend, EventBackend, MemoryBackend};
use etre_api::metrics::Metrics;
use etre_api::schema::SchemaManager;
use etre_api::state::AppState;
use etre_api::store::Store;
use etre_api::{create_router, Config};

/// Etre: a service for labeled entities with a CDC stream.
#[derive(Parser)]
#[command(name = "etre", version, about)]
struct Cli {
    /// Path to the YAML config file
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(&cli.config)?;
    tracing::info!(config = %config.redacted(), "etre starting");

    // The bundled in-process driver. Production deployments plug a
    // replicated document store behind the same backend traits.
    let backend = Arc::new(MemoryBackend::new());
    EntityBackend::ping(backend.as_ref())
        .await
        .map_err(|e| Error::internal(format!("cannot reach datasource: {}", e)))?;

    let metrics = Arc::new(Metrics::new(config.query_latency_sla()?));

    // CDC store and change-stream server.
    let mut streamer_factory = None;
    let cdc_writer: Arc<dyn CdcWriter> = if config.cdc.disabled {
        tracing::info!("CDC and change feeds are disabled");
        Arc::new(NoopCdcWriter)
    } else {
        let event_backend: Arc<dyn EventBackend> = backend.clone();
        event_backend
            .ping()
            .await
            .map_err(|e| Error::internal(format!("cannot reach CDC datasource: {}", e)))?;

        let cdc_store = Arc::new(CdcStore::new(
            event_backend,
            config.cdc.fallback_file.clone(),
            RetryPolicy {
                retry_count: config.cdc.write_retry_count,
                retry_wait: config.write_retry_wait(),
            },
            Arc::clone(&metrics),
        ));

        let server = Arc::new(ChangeStreamServer::new(
            Arc::clone(&cdc_store),
            ServerConfig {
                max_clients: config.cdc.change_stream.max_clients,
                buffer_size: config.cdc.change_stream.buffer_size,
            },
        ));
        let run_server = Arc::clone(&server);
        tokio::spawn(async move {
            loop {
                match run_server.run().await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "change stream server failed, restarting");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        });

        streamer_factory = Some(StreamerFactory {
            store: Arc::clone(&cdc_store),
            server: Arc::clone(&server),
        });
        cdc_store
    };

    // Reconcile entity schemas before serving traffic.
    SchemaManager::new(backend.clone())
        .reconcile_with_retry(&config.schemas)
        .await
        .map_err(|e| Error::internal(format!("schema reconciliation failed: {}", e)))?;

    let auth = Arc::new(Manager::new(
        config.security.acl.clone(),
        Arc::new(AllowAll),
    ));

    let store = Arc::new(Store::new(
        backend,
        cdc_writer,
        config.entity.types.clone(),
    ));

    let state = AppState {
        store,
        auth,
        metrics,
        schemas: Arc::new(config.schemas.clone()),
        streamer_factory: streamer_factory.clone(),
    };
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.addr)
        .await
        .map_err(|e| Error::internal(format!("cannot bind {}: {}", config.server.addr, e)))?;
    tracing::info!(addr = %config.server.addr, "etre listening");

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| Error::internal(format!("server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    if let Some(factory) = &streamer_factory {
        factory.server.stop();
    }
    Ok(())
}
