//! Engine connections over Unix sockets and TCP
//!
//! Every request opens its own HTTP/1.1 connection. The connection task runs
//! with upgrades enabled so hijacked streams keep working after a `101`.

use crate::config::EngineEndpoint;
use crate::error::{Result, StackError};
use hyper::body::{Body, Incoming};
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::oneshot;
use tracing::debug;

/// A connected engine stream
pub enum EngineStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl EngineStream {
    pub async fn connect(endpoint: &EngineEndpoint) -> Result<Self> {
        let stream = match endpoint {
            EngineEndpoint::Unix(path) => UnixStream::connect(path).await.map(EngineStream::Unix),
            EngineEndpoint::Tcp(addr) => TcpStream::connect(addr).await.map(EngineStream::Tcp),
        };
        stream.map_err(|e| {
            StackError::Http(format!(
                "Cannot connect to the Docker daemon at {}. Is the docker daemon running? ({})",
                endpoint, e
            ))
        })
    }
}

impl AsyncRead for EngineStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            EngineStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            EngineStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for EngineStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            EngineStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            EngineStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            EngineStream::Unix(s) => Pin::new(s).poll_flush(cx),
            EngineStream::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            EngineStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            EngineStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Send one request on a fresh connection
pub async fn send_request<B>(endpoint: &EngineEndpoint, request: Request<B>) -> Result<Response<Incoming>>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let io = TokioIo::new(EngineStream::connect(endpoint).await?);
    let (mut sender, conn) = http1::handshake(io).await?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            let msg = e.to_string().to_lowercase();
            if !msg.contains("canceled") && !msg.contains("incomplete") {
                debug!("engine connection ended: {}", e);
            }
        }
    });

    Ok(sender.send_request(request).await?)
}

/// Send one request whose connection is half-closed when `disconnect` fires
///
/// Used for long-running streams: the engine stops producing once it sees
/// the write side of its client go away.
pub async fn send_cancellable<B>(
    endpoint: &EngineEndpoint,
    request: Request<B>,
    disconnect: oneshot::Receiver<()>,
) -> Result<Response<Incoming>>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let io = TokioIo::new(EngineStream::connect(endpoint).await?);
    let (mut sender, mut conn) = http1::handshake(io).await?;

    tokio::spawn(async move {
        let disconnected = tokio::select! {
            result = std::future::poll_fn(|cx| conn.poll_without_shutdown(cx)) => {
                if let Err(e) = result {
                    debug!("engine connection ended: {}", e);
                }
                false
            }
            Ok(()) = disconnect => true,
        };
        if disconnected {
            let mut stream = conn.into_parts().io.into_inner();
            match stream.shutdown().await {
                Ok(()) => debug!("client went away, closed engine write side"),
                Err(e) => debug!("failed to close engine stream: {}", e),
            }
        }
    });

    Ok(sender.send_request(request).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Empty};
    use hyper::body::Bytes;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_request_over_unix_socket() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("engine.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(head.starts_with("GET /_ping HTTP/1.1"));
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK")
                .await
                .unwrap();
        });

        let request = Request::builder()
            .uri("/_ping")
            .header(hyper::header::HOST, "docker")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = send_request(&EngineEndpoint::Unix(socket), request)
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_disconnect_half_closes_engine_stream() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("engine.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let (closed_tx, closed_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n")
                .await
                .unwrap();
            // Read returns 0 once the proxy shuts down its write side
            let n = stream.read(&mut buf).await.unwrap();
            closed_tx.send(n).unwrap();
        });

        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let request = Request::builder()
            .uri("/events")
            .header(hyper::header::HOST, "docker")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = send_cancellable(&EngineEndpoint::Unix(socket), request, disconnect_rx)
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        disconnect_tx.send(()).unwrap();
        assert_eq!(closed_rx.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_names_endpoint() {
        let dir = TempDir::new().unwrap();
        let endpoint = EngineEndpoint::Unix(dir.path().join("missing.sock"));
        let err = match EngineStream::connect(&endpoint).await {
            Err(e) => e,
            Ok(_) => panic!("connected to a missing socket"),
        };
        assert!(err.to_string().contains("Cannot connect to the Docker daemon"));
    }
}
