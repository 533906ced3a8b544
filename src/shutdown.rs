use tokio::sync::oneshot;

/// Resolves on SIGINT, SIGTERM, or when `load_failed` fires. Passed to
/// `axum::serve(..).with_graceful_shutdown()`.
pub async fn shutdown_signal(load_failed: oneshot::Receiver<()>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    // a dropped sender means the load finished without failing
    let load_failed = async {
        if load_failed.await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
        () = load_failed => tracing::info!("model failed to load, shutting down"),
    }
}
