//! Host port availability checks.
//!
//! Every check binds the port transiently and releases it immediately; the
//! answer is advisory because another process may grab the port afterwards.

use std::time::Duration;

use anyhow::Result;
use tokio::net::{TcpListener, UdpSocket};
use tracing::debug;

use pkg_types::error::PortConflict;
use pkg_types::port::Protocol;

async fn try_bind(addr: &str, port: u16, protocol: Protocol) -> std::io::Result<u16> {
    match protocol {
        Protocol::Tcp => {
            let listener = TcpListener::bind((addr, port)).await?;
            Ok(listener.local_addr()?.port())
        }
        Protocol::Udp => {
            let socket = UdpSocket::bind((addr, port)).await?;
            Ok(socket.local_addr()?.port())
        }
    }
}

/// Whether `addr:port` can currently be bound. A bind that does not finish
/// within `timeout` counts as unavailable.
pub async fn is_port_available(addr: &str, port: u16, protocol: Protocol, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, try_bind(addr, port, protocol)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("[ports] {}:{}/{} unavailable: {}", addr, port, protocol, e);
            false
        }
        Err(_) => {
            debug!("[ports] {}:{}/{} probe timed out", addr, port, protocol);
            false
        }
    }
}

/// Like [`is_port_available`] but reports a typed conflict.
pub async fn check_port_available(
    addr: &str,
    port: u16,
    protocol: Protocol,
    timeout: Duration,
) -> Result<(), PortConflict> {
    if is_port_available(addr, port, protocol, timeout).await {
        Ok(())
    } else {
        Err(PortConflict {
            address: addr.to_string(),
            port,
            protocol,
        })
    }
}

/// First bindable port in `[lo, hi]`.
pub async fn first_available_in_range(
    addr: &str,
    lo: u16,
    hi: u16,
    protocol: Protocol,
    timeout: Duration,
) -> Option<u16> {
    for port in lo..=hi {
        if is_port_available(addr, port, protocol, timeout).await {
            return Some(port);
        }
    }
    None
}

/// Let the OS pick a free port on `addr`.
pub async fn ephemeral_port(addr: &str, protocol: Protocol) -> Result<u16> {
    Ok(try_bind(addr, 0, protocol).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn test_bound_port_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available("127.0.0.1", port, Protocol::Tcp, T).await);

        let err = check_port_available("127.0.0.1", port, Protocol::Tcp, T)
            .await
            .unwrap_err();
        assert_eq!(err.port, port);

        drop(listener);
        assert!(is_port_available("127.0.0.1", port, Protocol::Tcp, T).await);
    }

    #[tokio::test]
    async fn test_first_available_skips_taken() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = listener.local_addr().unwrap().port();
        if taken == u16::MAX {
            return;
        }
        let found = first_available_in_range("127.0.0.1", taken, taken + 1, Protocol::Tcp, T).await;
        assert_ne!(found, Some(taken));
    }

    #[tokio::test]
    async fn test_ephemeral_port_nonzero() {
        let port = ephemeral_port("127.0.0.1", Protocol::Udp).await.unwrap();
        assert_ne!(port, 0);
    }
}
