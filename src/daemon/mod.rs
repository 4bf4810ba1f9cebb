// Service bootstrap: config resolution, logging, adapter wiring and the
// HTTP server lifecycle.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing_appender::non_blocking::WorkerGuard;

use crate::mesh::MeshOptions;
use crate::models::printer::get_profile;
use crate::models::ServiceConfig;
use crate::pipeline::{BroadcastObserver, PipelineEvent, PipelineOrchestrator, PollingWaiter};
use crate::providers::landmarks::HttpLandmarkDetector;
use crate::providers::meshy::MeshyClient;
use crate::providers::replicate::ReplicateClient;
use crate::server::{self, AppState};
use crate::service::JobService;
use crate::stages::cartoon::{CartoonStyle, CartoonizeAdapter};
use crate::stages::face::FaceCheckAdapter;
use crate::stages::generate::Generate3dAdapter;
use crate::stages::optimize::OptimizeMeshAdapter;
use crate::stages::StageSet;
use crate::storage::{ArtifactStore, InMemoryJobStore, JobStore};

const APP_DIR: &str = "avatar-forge";

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

fn read_config(path: &Path) -> Result<ServiceConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: ServiceConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    tracing::info!("Loaded config from: {}", path.display());
    Ok(config)
}

/// Load the ServiceConfig using this resolution order:
///   1. --config CLI flag (passed as config_path)
///   2. FORGE_CONFIG_DIR environment variable
///   3. Platform config dir (dirs::config_dir()/avatar-forge/config.json)
///   4. Fall back to {data_dir}/config.json
///   5. If no config file exists, use ServiceConfig::default()
///
/// Environment overrides are applied on top of whichever source wins.
pub fn load_config(config_path: Option<&Path>) -> Result<ServiceConfig> {
    let mut config = load_config_file(config_path)?;
    config.apply_env_overrides();
    Ok(config)
}

fn load_config_file(config_path: Option<&Path>) -> Result<ServiceConfig> {
    if let Some(path) = config_path {
        if path.exists() {
            return read_config(path);
        }
        return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
    }

    if let Ok(config_dir) = std::env::var("FORGE_CONFIG_DIR") {
        let path = PathBuf::from(&config_dir).join("config.json");
        if path.exists() {
            return read_config(&path);
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join(APP_DIR).join("config.json");
        if path.exists() {
            return read_config(&path);
        }
    }

    let path = resolve_data_dir(None).join("config.json");
    if path.exists() {
        return read_config(&path);
    }

    tracing::info!("No config file found, using defaults");
    Ok(ServiceConfig::default())
}

/// Resolve the data directory. If `override_dir` is Some, use it; otherwise
/// `FORGE_DATA_DIR`, then the platform data dir.
pub fn resolve_data_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }

    if let Ok(d) = std::env::var("FORGE_DATA_DIR") {
        return PathBuf::from(d);
    }

    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Create the data directory, its log directory and the artifact layout.
pub async fn create_data_dirs(data_dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(data_dir.join("logs"))
        .await
        .context("Failed to create logs directory")?;
    ArtifactStore::new(data_dir).ensure_dirs().await?;
    tracing::info!("Data directories ensured at: {}", data_dir.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Log to stderr and to `<data_dir>/logs/service.log`. The returned guard
/// flushes the file writer and must be held for the life of the process.
/// `verbose` forces debug output regardless of `RUST_LOG`.
pub fn init_tracing(data_dir: &Path, verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())
    };
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let logs_dir = data_dir.join("logs");
    if let Err(e) = std::fs::create_dir_all(&logs_dir) {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .try_init();
        tracing::warn!(
            "Could not create log directory {}: {}. Logging to stderr only.",
            logs_dir.display(),
            e
        );
        return None;
    }

    let appender = tracing_appender::rolling::never(&logs_dir, "service.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .is_ok()
    {
        tracing::info!(
            "Logging to stderr and {}",
            logs_dir.join("service.log").display()
        );
    }
    Some(guard)
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

/// Build the four production adapters. Missing API credentials are a
/// startup error.
pub fn build_stages(config: &ServiceConfig, artifacts: &ArtifactStore) -> Result<StageSet> {
    let profile = get_profile(&config.printer_profile)?;

    let token = config
        .cartoon
        .api_token
        .clone()
        .filter(|t| !t.is_empty())
        .context("No cartoonization API token configured (set REPLICATE_API_TOKEN)")?;
    let api_key = config
        .generation
        .api_key
        .clone()
        .filter(|k| !k.is_empty())
        .context("No 3D generation API key configured (set MESHY_API_KEY)")?;

    let detector = HttpLandmarkDetector::new(
        config.face.api_url.clone(),
        secs(config.face.request_timeout_secs),
    )?;
    let face = FaceCheckAdapter::new(Arc::new(detector));

    let replicate = ReplicateClient::new(
        config.cartoon.api_url.clone(),
        token,
        config.cartoon.model_version.clone(),
        secs(config.cartoon.request_timeout_secs),
    )?;
    let cartoon = CartoonizeAdapter::new(
        replicate,
        PollingWaiter::new(
            secs(config.cartoon.timeout_secs),
            secs(config.cartoon.poll_interval_secs),
        )?,
        CartoonStyle::from_tag(&config.cartoon_style),
        config.cartoon.max_input_dimension,
        secs(config.cartoon.download_timeout_secs),
        artifacts.clone(),
    );

    let meshy = MeshyClient::new(
        config.generation.api_url.clone(),
        api_key,
        secs(config.generation.request_timeout_secs),
    )?;
    let generate = Generate3dAdapter::new(
        meshy,
        PollingWaiter::new(
            secs(config.generation.timeout_secs),
            secs(config.generation.poll_interval_secs),
        )?,
        secs(config.generation.download_timeout_secs),
        artifacts.clone(),
    );

    let optimize = OptimizeMeshAdapter::new(
        profile,
        MeshOptions {
            target_height: config.target_height_mm,
            max_faces: config.mesh.max_faces,
            repair: config.mesh.repair,
            simplify: config.mesh.simplify,
        },
        artifacts.clone(),
    );

    Ok(StageSet::new(
        Arc::new(face),
        Arc::new(cartoon),
        Arc::new(generate),
        Arc::new(optimize),
    )?)
}

/// Assemble the job service around a stage set, publishing pipeline events
/// on `event_tx`.
pub fn build_service(
    config: &ServiceConfig,
    artifacts: ArtifactStore,
    stages: StageSet,
    event_tx: broadcast::Sender<PipelineEvent>,
) -> JobService {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let orchestrator = PipelineOrchestrator::new(
        Arc::clone(&store),
        stages,
        Arc::new(BroadcastObserver::new(event_tx)),
    );
    JobService::new(
        store,
        orchestrator,
        artifacts,
        config.max_upload_size_mb,
        config.image.clone(),
    )
}

/// Log every pipeline lifecycle event until the channel closes.
pub fn spawn_event_logger(
    mut rx: broadcast::Receiver<PipelineEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(PipelineEvent::StageStarted {
                    job_id,
                    stage,
                    progress,
                    ..
                }) => {
                    tracing::debug!("Job {} entered {} ({}%)", job_id, stage, progress);
                }
                Ok(PipelineEvent::StageCompleted {
                    job_id,
                    stage,
                    duration_secs,
                    ..
                }) => {
                    tracing::debug!("Job {} finished {} in {:.1}s", job_id, stage, duration_secs);
                }
                Ok(PipelineEvent::StageFailed {
                    job_id,
                    stage,
                    ref error,
                    ..
                }) => {
                    tracing::warn!("Job {} stage {} failed: {}", job_id, stage, error);
                }
                Ok(PipelineEvent::JobCompleted {
                    job_id,
                    total_duration_secs,
                    ..
                }) => {
                    tracing::info!(
                        "Avatar {} ready for printing ({:.1}s)",
                        job_id,
                        total_duration_secs
                    );
                }
                Ok(PipelineEvent::JobFailed { job_id, ref error, .. }) => {
                    tracing::warn!("Avatar {} failed: {}", job_id, error);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event logger lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Service bootstrap
// ---------------------------------------------------------------------------

/// Run the HTTP service until Ctrl+C (or SIGTERM on Unix), then drain
/// in-flight jobs within the configured grace period.
pub async fn start_service(
    config_path: Option<&Path>,
    data_dir_override: Option<&Path>,
    host_override: Option<&str>,
    port_override: Option<u16>,
    verbose: bool,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(h) = host_override {
        config.host = h.to_string();
    }
    if let Some(p) = port_override {
        config.port = p;
    }

    let data_dir = if let Some(d) = data_dir_override {
        d.to_path_buf()
    } else if let Some(ref d) = config.data_dir {
        d.clone()
    } else {
        resolve_data_dir(None)
    };
    config.data_dir = Some(data_dir.clone());

    let _log_guard = init_tracing(&data_dir, verbose);
    config.validate()?;
    create_data_dirs(&data_dir).await?;

    let artifacts = ArtifactStore::new(&data_dir);
    let stages = build_stages(&config, &artifacts)?;
    let (event_tx, _event_rx) = broadcast::channel::<PipelineEvent>(config.broadcast_capacity);
    let service = Arc::new(build_service(&config, artifacts, stages, event_tx.clone()));
    let logger_handle = spawn_event_logger(event_tx.subscribe());

    let config = Arc::new(config);
    let state = Arc::new(AppState {
        service: Arc::clone(&service),
        event_tx,
        config: Arc::clone(&config),
        start_time: Instant::now(),
    });

    let router = server::create_router(state);
    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;
    tracing::info!(
        "Avatar service listening on http://{} (printer: {}, height: {}mm)",
        bind_addr,
        config.printer_profile,
        config.target_height_mm
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    service
        .shutdown(Duration::from_secs(config.shutdown_grace_secs))
        .await;
    logger_handle.abort();
    tracing::info!("Service exited cleanly.");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C signal"),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                }
            }
            Err(e) => {
                tracing::warn!("Could not install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Received Ctrl+C signal");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl+C signal");
    }
}
