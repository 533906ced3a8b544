use std::sync::Arc;

use tokio::{net::TcpListener, sync::oneshot, task};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use textgen_service::{
    AppConfig, AppState, DeploymentInstance, build_router, load_backend, shutdown::shutdown_signal,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(AppConfig::from_env()?);
    let state = AppState::new(config.clone());
    let router = build_router(state.clone());

    let listener = TcpListener::bind(config.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "REST server ready, model loading in the background");

    let (load_failed_tx, load_failed_rx) = oneshot::channel();
    let loader = tokio::spawn(load_deployment(config, state, load_failed_tx));

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(load_failed_rx))
        .await?;

    // no-op if the load already finished; its outcome decides the exit code
    loader.abort();
    match loader.await {
        Ok(loaded) => loaded,
        Err(err) if err.is_cancelled() => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn load_deployment(
    config: Arc<AppConfig>,
    state: AppState,
    load_failed: oneshot::Sender<()>,
) -> anyhow::Result<()> {
    tracing::info!(
        model = %config.model_id,
        backend = %config.backend,
        device = %config.device,
        "loading model artifacts"
    );

    let loader_config = config.clone();
    let loaded = task::spawn_blocking(move || load_backend(&loader_config))
        .await
        .map_err(anyhow::Error::from)
        .and_then(|loaded| loaded.map_err(anyhow::Error::from));

    match loaded {
        Ok(backend) => {
            let deployment = DeploymentInstance::new(backend.into(), config.deployment.clone());
            tracing::info!(
                backend = %deployment.descriptor().id,
                ceiling = deployment.ceiling(),
                "model loaded, accepting generation requests"
            );
            state.install(Arc::new(deployment));
            Ok(())
        }
        Err(err) => {
            tracing::error!(error = %err, "model failed to load");
            let _ = load_failed.send(());
            Err(err)
        }
    }
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
