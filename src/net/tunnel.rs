use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{BridgeError, ConnectStage, Result};
use crate::http::ResponseHead;

fn tunnel_error(message: impl std::fmt::Display) -> BridgeError {
    BridgeError::connection(ConnectStage::Tunnel, message)
}

/// Build the `CONNECT` request sent to the proxy
pub fn connect_request(host: &str, port: u16, authorization: Option<&str>) -> String {
    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
        host = host,
        port = port
    );
    if let Some(auth) = authorization {
        request.push_str("Proxy-Authorization: ");
        request.push_str(auth);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request
}

/// Ask an HTTP proxy to open a raw tunnel to `host:port` over `stream`.
///
/// The proxy's response headers are read and discarded; anything but `200`
/// fails the tunnel. On success the stream carries bytes straight to the target.
pub async fn open_tunnel<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    authorization: Option<&str>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = connect_request(host, port, authorization);
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| tunnel_error(format!("failed to send CONNECT: {}", e)))?;
    stream.flush().await.map_err(tunnel_error)?;

    let mut buf = BytesMut::with_capacity(1024);
    let (head, used) = loop {
        if let Some(parsed) = ResponseHead::parse(&buf).map_err(tunnel_error)? {
            break parsed;
        }
        let n = stream
            .read_buf(&mut buf)
            .await
            .map_err(|e| tunnel_error(format!("failed to read CONNECT response: {}", e)))?;
        if n == 0 {
            return Err(tunnel_error("proxy closed the connection during CONNECT"));
        }
    };

    debug!(status = head.status, reason = %head.reason, "proxy CONNECT response");

    if head.status != 200 {
        return Err(tunnel_error(format!(
            "proxy response failed: {} {}",
            head.status, head.reason
        )));
    }

    if buf.len() > used {
        return Err(tunnel_error(
            "proxy sent unexpected bytes after CONNECT response",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_connect_request_with_auth() {
        let req = connect_request("chat.example.com", 443, Some("Basic YWxpY2U6c2VjcmV0"));
        assert_eq!(
            req,
            "CONNECT chat.example.com:443 HTTP/1.1\r\nHost: chat.example.com:443\r\nProxy-Authorization: Basic YWxpY2U6c2VjcmV0\r\n\r\n"
        );
    }

    #[test]
    fn test_connect_request_without_auth() {
        let req = connect_request("chat.example.com", 443, None);
        assert!(!req.contains("Proxy-Authorization"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_tunnel_established() {
        let (mut client, mut proxy) = duplex(4096);

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = proxy.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            proxy
                .write_all(b"HTTP/1.1 200 Connection established\r\nProxy-Agent: test\r\n\r\n")
                .await
                .unwrap();
            request
        });

        open_tunnel(&mut client, "chat.example.com", 443, None)
            .await
            .unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("CONNECT chat.example.com:443 HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_tunnel_rejected() {
        let (mut client, mut proxy) = duplex(4096);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = proxy.read(&mut buf).await;
            let _ = proxy
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await;
        });

        let err = open_tunnel(&mut client, "chat.example.com", 443, None)
            .await
            .unwrap_err();
        match err {
            BridgeError::Connection { stage, message } => {
                assert_eq!(stage, ConnectStage::Tunnel);
                assert!(message.contains("407"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_proxy_hangs_up() {
        let (mut client, mut proxy) = duplex(4096);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = proxy.read(&mut buf).await;
            drop(proxy);
        });

        let err = open_tunnel(&mut client, "chat.example.com", 443, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Connection {
                stage: ConnectStage::Tunnel,
                ..
            }
        ));
    }
}
