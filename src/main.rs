//! mediacms -- media-backed resource lifecycle engine.
//!
//! Startup wires the configured blob store and the SQLite metadata store
//! into an [`AppContext`](mediacms::AppContext) and serves the ops router.
//! On SIGTERM/SIGINT the listener stops, then pending background cleanups
//! get a bounded window to finish; anything left is logged as orphaned.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use mediacms::config::Config;
use mediacms::metadata::store::MetadataStore;
use mediacms::storage::backend::StorageBackend;
use mediacms::storage::signing::UrlSigner;

/// Command-line arguments for the mediacms process.
#[derive(Parser, Debug)]
#[command(
    name = "mediacms",
    version,
    about = "Media-backed resource lifecycle engine"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "mediacms.example.yaml")]
    config: String,

    /// Override the ops bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = mediacms::config::load_config(&cli.config)?;
    init_logging(&config);
    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        mediacms::metrics::init_metrics();
        mediacms::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let metadata_path = &config.metadata.sqlite.path;
    let metadata: Arc<dyn MetadataStore> = Arc::new(
        mediacms::metadata::sqlite::SqliteMetadataStore::new(metadata_path)?,
    );
    info!("SQLite metadata store initialized at {}", metadata_path);

    let (storage, media_signer) = build_storage(&config).await?;

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let mut ctx = mediacms::AppContext::new(config, storage, metadata);
    if let Some(signer) = media_signer {
        ctx = ctx.with_media_signer(signer);
    }
    let ctx = Arc::new(ctx);
    let app = mediacms::server::app(Arc::clone(&ctx));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("mediacms ops server listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let pending = ctx.lifecycle.pending_cleanups();
    if pending > 0 {
        info!("Waiting up to {:?} for {} background cleanups", shutdown_timeout, pending);
        if tokio::time::timeout(shutdown_timeout, ctx.lifecycle.settle())
            .await
            .is_err()
        {
            warn!(
                "{} background cleanups still running at exit; their blobs may be orphaned",
                ctx.lifecycle.pending_cleanups()
            );
        }
    }

    info!("mediacms shut down");
    Ok(())
}

/// `RUST_LOG` wins; otherwise `logging.level`.  `logging.format` selects
/// text or JSON lines.
fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// The configured blob store, plus the signer for local download links.
async fn build_storage(
    config: &Config,
) -> anyhow::Result<(Arc<dyn StorageBackend>, Option<UrlSigner>)> {
    let storage: Arc<dyn StorageBackend> = match config.storage.backend.as_str() {
        "s3" => {
            let s3_config = config.storage.s3.as_ref().ok_or_else(|| {
                anyhow::anyhow!("storage.backend is 's3' but storage.s3 config section is missing")
            })?;
            Arc::new(mediacms::storage::s3::S3Backend::new(s3_config).await?)
        }
        "memory" => {
            warn!("Memory storage backend selected; blobs are lost on exit");
            Arc::new(mediacms::storage::memory::MemoryBackend::default())
        }
        "local" => {
            let local = &config.storage.local;
            let signer = UrlSigner::new(&local.public_base_url, &local.signing_secret)?;
            let backend =
                mediacms::storage::local::LocalBackend::new(&local.root_dir, signer.clone())?;
            info!(
                "Local storage backend initialized at {}, downloads served under {}",
                local.root_dir,
                local.mount_path()
            );
            return Ok((Arc::new(backend), Some(signer)));
        }
        other => anyhow::bail!("unknown storage.backend '{other}' (expected local, memory or s3)"),
    };
    Ok((storage, None))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
