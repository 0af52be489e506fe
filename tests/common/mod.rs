//! Shared helpers for integration tests: port polling and scratch
//! directories. The actual HTTP surface is exercised in-process via
//! `tower::ServiceExt::oneshot` against the router, so there's no mock
//! server here — just the generic bits every test file needs.

use anyhow::Result;
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Wait for a port to become available (listening)
pub async fn wait_for_port(port: u16, timeout: Duration) -> Result<()> {
    let start = Instant::now();

    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).is_ok() {
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }

    anyhow::bail!("Timeout waiting for port {} to be available", port)
}

/// Wait for a port to become unavailable (no longer listening)
pub async fn wait_for_port_closed(port: u16, timeout: Duration) -> Result<()> {
    let start = Instant::now();

    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port)).is_err() {
            return Ok(());
        }
        sleep(Duration::from_millis(100)).await;
    }

    anyhow::bail!("Timeout waiting for port {} to close", port)
}

/// Check if a port is currently listening
pub fn is_port_listening(port: u16) -> bool {
    TcpStream::connect(format!("127.0.0.1:{}", port)).is_ok()
}

/// Create a temporary test directory that auto-cleans
pub fn temp_test_dir() -> tempfile::TempDir {
    tempfile::TempDir::new().expect("Failed to create temp directory")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_port_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(is_port_listening(port));
        drop(listener);
        std::thread::sleep(Duration::from_millis(100));
    }

    #[test]
    fn test_temp_test_dir() {
        let dir = temp_test_dir();
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_wait_for_port_timeout() {
        let result = wait_for_port(65534, Duration::from_millis(100)).await;
        assert!(result.is_err());
    }
}
