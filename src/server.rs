//! HTTP server for the sidecar API.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::admission::Admission;
use crate::api;
use crate::error::Result;

pub struct HttpServer {
    addr: SocketAddr,
    router: Router,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, admission: Arc<Admission>) -> Self {
        Self {
            addr,
            router: api::router(admission),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %listener.local_addr()?, "Starting HTTP server");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, BreakerRegistry};
    use crate::ratelimit::RateLimiterFactory;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_serves_until_shutdown() {
        let admission = Arc::new(Admission::new(
            Arc::new(RateLimiterFactory::new(None)),
            Arc::new(BreakerRegistry::new(BreakerConfig::default()).unwrap()),
        ));

        // Find a free port, then hand it to the server.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let server = HttpServer::new(addr, admission);
        assert_eq!(server.addr(), addr);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_with_shutdown(async {
            let _ = rx.await;
        }));

        let mut stream = None;
        for _ in 0..50 {
            match tokio::net::TcpStream::connect(addr).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
            }
        }
        let mut stream = stream.expect("server did not start");
        stream
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("ok"));

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
