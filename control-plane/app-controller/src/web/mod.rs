use std::net::SocketAddr;

use axum::{Router, routing::get};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

pub fn router() -> Router {
    // Expose both /health (preferred) and /healthz (legacy) for compatibility
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/healthz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
}

pub async fn run_http_server(
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP listening on {}", addr);
    axum::serve(listener, router())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_endpoints_answer_ok() {
        let shutdown = CancellationToken::new();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, router())
                .with_graceful_shutdown(token.cancelled_owned())
                .await
        });

        for path in ["/health", "/healthz"] {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
            tokio::io::AsyncWriteExt::write_all(&mut stream, req.as_bytes())
                .await
                .unwrap();
            let mut body = String::new();
            tokio::io::AsyncReadExt::read_to_string(&mut stream, &mut body)
                .await
                .unwrap();
            assert!(body.starts_with("HTTP/1.1 200"), "{path}: {body}");
            assert!(body.ends_with("ok"), "{path}: {body}");
        }

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
