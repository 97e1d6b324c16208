use anyhow::Context;
use axum::Router;
use pmoconfig::Config;
use pmohlsrelay::{create_router, HlsRelay, RelayState};
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ========== PHASE 1 : Configuration & logs ==========
    let config = Config::load_config("")?;

    // RUST_LOG prend le pas sur host.logger.min_level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.get_log_min_level().to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    // ========== PHASE 2 : Relais ==========
    let relay = Arc::new(HlsRelay::from_config(&config)?);
    let tracker = relay.start_tracker();

    let app = create_router(RelayState::new(relay.clone()));

    // ========== PHASE 3 : Démarrage du serveur ==========
    let addr = format!("{}:{}", config.get_bind_address(), config.get_http_port());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {}", addr))?;

    info!(
        "📻 Relaying {} as \"{}\"",
        relay.settings().stream_url,
        relay.settings().station_name
    );
    info!("🌐 Listening on http://{}", addr);
    info!("   HLS:      http://{}/playlist.m3u8", addr);
    info!("   Icecast:  http://{}/icecast", addr);
    info!("Press Ctrl+C to stop...");

    serve_until(listener, app, async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C reçu, arrêt"),
            Err(e) => {
                warn!("Impossible d'écouter Ctrl+C: {}", e);
                std::future::pending::<()>().await
            }
        }
    })
    .await?;

    tracker.stop().await;
    Ok(())
}

/// Sert `app` jusqu'à ce que `shutdown` se termine
///
/// Les flux /icecast ne se terminent jamais d'eux-mêmes : on n'attend pas
/// la fin des connexions ouvertes, elles sont abandonnées à l'arrêt.
async fn serve_until<F>(listener: TcpListener, app: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    tokio::select! {
        result = axum::serve(listener, app).into_future() => result?,
        _ = shutdown => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_shutdown_with_open_stream() {
        let app = Router::new().route(
            "/forever",
            get(|| async {
                Body::from_stream(futures::stream::pending::<Result<Bytes, std::io::Error>>())
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(serve_until(listener, app, async move {
            let _ = stopped.await;
        }));

        let response = reqwest::get(format!("http://{}/forever", addr))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server kept waiting for the open stream")
            .unwrap()
            .unwrap();
        drop(response);
    }
}
