//! Network transport provider.
//!
//! The connector only needs one capability from the network layer: open a
//! byte stream to `host:port`. The provider is shared by every session and
//! must be safe to call concurrently.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{MuxError, Result};

/// A bidirectional byte stream the SSH client can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Type-erased stream returned by a [`Transport`].
pub type BoxedStream = Box<dyn ByteStream>;

/// Opens byte-stream connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connects to `host:port`.
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream>;
}

/// Plain TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(host = %host, port, "TCP connection established");
        Ok(Box::new(stream))
    }
}

/// Splits `host`, `host:port`, `[v6]` or `[v6]:port`.
///
/// A bare IPv6 address without brackets is taken as a host with the
/// default port.
pub fn split_host_port(target: &str, default_port: u16) -> Result<(String, u16)> {
    let invalid = || MuxError::Configuration(format!("invalid host: {target:?}"));

    if target.is_empty() {
        return Err(invalid());
    }

    if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        return match tail {
            "" => Ok((host.to_string(), default_port)),
            _ => {
                let port = tail.strip_prefix(':').ok_or_else(invalid)?;
                Ok((host.to_string(), parse_port(target, port)?))
            }
        };
    }

    match target.split_once(':') {
        Some((host, port)) if !port.contains(':') => {
            if host.is_empty() {
                return Err(invalid());
            }
            Ok((host.to_string(), parse_port(target, port)?))
        }
        _ => Ok((target.to_string(), default_port)),
    }
}

fn parse_port(target: &str, port: &str) -> Result<u16> {
    match port.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(MuxError::Configuration(format!(
            "invalid port in {target:?}: {port:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_split_plain_host() {
        assert_eq!(split_host_port("web1", 22).unwrap(), ("web1".to_string(), 22));
    }

    #[test]
    fn test_split_host_with_port() {
        assert_eq!(
            split_host_port("web1.example.com:2222", 22).unwrap(),
            ("web1.example.com".to_string(), 2222)
        );
    }

    #[test]
    fn test_split_bracketed_ipv6() {
        assert_eq!(split_host_port("[::1]", 22).unwrap(), ("::1".to_string(), 22));
        assert_eq!(
            split_host_port("[fe80::1]:2200", 22).unwrap(),
            ("fe80::1".to_string(), 2200)
        );
    }

    #[test]
    fn test_split_bare_ipv6() {
        assert_eq!(
            split_host_port("fe80::1", 22).unwrap(),
            ("fe80::1".to_string(), 22)
        );
    }

    #[test]
    fn test_split_invalid() {
        for bad in ["", ":22", "web1:", "web1:0", "web1:99999", "web1:ssh", "[::1", "[]:22", "[::1]22"] {
            assert!(
                matches!(split_host_port(bad, 22), Err(MuxError::Configuration(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_tcp_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"SSH-2.0-test\r\n").await.unwrap();
        });

        let mut stream = TcpTransport.dial("127.0.0.1", port).await.unwrap();
        let mut buf = [0u8; 14];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SSH-2.0-test\r\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(TcpTransport.dial("127.0.0.1", port).await.is_err());
    }
}
