//! Connection limits and request validation for the HTTP/websocket surface.
//!
//! MobileShell is meant to sit behind a fronting reverse proxy and be
//! reached from a phone browser over the open internet, so unlike a
//! strictly-local tool there is no loopback-only enforcement here: the
//! access boundary is the shared password in [`crate::auth`], not source
//! IP. What this module does provide is connection-count limiting per IP
//! and the input validation the websocket handlers need.

use axum::http::HeaderMap;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Connection tracking for rate limiting and connection limits
/// Uses DashMap for lock-free concurrent access (avoids double Arc issue)
#[derive(Clone)]
pub struct ConnectionTracker {
    /// Concurrent map of IP addresses to connection counts
    connections: Arc<DashMap<IpAddr, usize>>,
    /// Maximum connections per IP
    max_connections_per_ip: usize,
}

impl ConnectionTracker {
    /// Create a new connection tracker
    pub fn new(max_connections_per_ip: usize) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            max_connections_per_ip,
        }
    }

    /// Try to acquire a connection slot for the given IP
    /// Returns true if allowed, false if limit exceeded
    pub async fn try_acquire(&self, ip: IpAddr) -> bool {
        // Check and increment atomically
        let mut entry = self.connections.entry(ip).or_insert(0);

        if *entry >= self.max_connections_per_ip {
            warn!(
                ip = %ip,
                current_connections = *entry,
                max_allowed = self.max_connections_per_ip,
                "Connection limit exceeded for IP"
            );
            false
        } else {
            *entry += 1;
            debug!(
                ip = %ip,
                current_connections = *entry,
                "Connection acquired"
            );
            true
        }
    }

    /// Release a connection slot for the given IP
    pub async fn release(&self, ip: IpAddr) {
        if let Some(mut entry) = self.connections.get_mut(&ip) {
            if *entry > 0 {
                *entry -= 1;
                debug!(
                    ip = %ip,
                    remaining_connections = *entry,
                    "Connection released"
                );
            }
            // Remove entry if count reaches zero to prevent unbounded growth
            if *entry == 0 {
                drop(entry);
                self.connections.remove(&ip);
            }
        }
    }

    /// Get current connection count for an IP
    pub async fn get_count(&self, ip: IpAddr) -> usize {
        self.connections.get(&ip).map(|r| *r).unwrap_or(0)
    }
}

/// A websocket upgrade is rejected when it carries an `Origin` header that
/// doesn't match the request's own `Host` — the standard cross-site
/// websocket hijacking defense. An absent `Origin` is accepted: plenty of
/// legitimate non-browser clients (curl, other backends) never send one.
pub fn check_same_origin(headers: &HeaderMap) -> Result<(), String> {
    let Some(origin) = headers.get(axum::http::header::ORIGIN) else {
        return Ok(());
    };
    let Some(host) = headers.get(axum::http::header::HOST) else {
        return Err("Origin header present with no Host header to compare against".to_string());
    };
    let origin = origin.to_str().map_err(|_| "Origin header is not valid UTF-8".to_string())?;
    let host = host.to_str().map_err(|_| "Host header is not valid UTF-8".to_string())?;

    if origin == format!("http://{host}") || origin == format!("https://{host}") {
        Ok(())
    } else {
        warn!(origin, host, "cross-origin websocket upgrade rejected");
        Err(format!("Origin {origin} does not match Host {host}"))
    }
}

/// Validate WebSocket message size
///
/// # Arguments
/// * `data` - The message data to validate
/// * `max_size` - Maximum allowed message size in bytes
///
/// # Returns
/// * `Ok(())` if the message is within size limits
/// * `Err(String)` with error message if size is exceeded
pub fn validate_message_size(data: &[u8], max_size: usize) -> Result<(), String> {
    if data.len() > max_size {
        debug!(
            message_size = data.len(),
            max_size = max_size,
            "Message size limit exceeded"
        );
        Err(format!(
            "Message size {} exceeds maximum allowed size {}",
            data.len(),
            max_size
        ))
    } else {
        Ok(())
    }
}

/// Validate terminal resize dimensions
///
/// # Arguments
/// * `cols` - Number of columns
/// * `rows` - Number of rows
///
/// # Returns
/// * `Ok(())` if dimensions are valid
/// * `Err(String)` with error message if dimensions are invalid
pub fn validate_terminal_dimensions(cols: u16, rows: u16) -> Result<(), String> {
    const MIN_DIMENSION: u16 = 1;
    const MAX_DIMENSION: u16 = 1000;

    if cols < MIN_DIMENSION || cols > MAX_DIMENSION {
        return Err(format!(
            "Invalid columns {}: must be between {} and {}",
            cols, MIN_DIMENSION, MAX_DIMENSION
        ));
    }

    if rows < MIN_DIMENSION || rows > MAX_DIMENSION {
        return Err(format!(
            "Invalid rows {}: must be between {} and {}",
            rows, MIN_DIMENSION, MAX_DIMENSION
        ));
    }

    Ok(())
}

/// Validate UTF-8 encoding of message text
///
/// # Arguments
/// * `data` - The data to validate as UTF-8
///
/// # Returns
/// * `Ok(())` if data is valid UTF-8
/// * `Err(String)` with error message if encoding is invalid
pub fn validate_utf8(data: &[u8]) -> Result<(), String> {
    std::str::from_utf8(data)
        .map(|_| ())
        .map_err(|e| {
            debug!("Invalid UTF-8 encoding: {}", e);
            "Invalid UTF-8 encoding".to_string()
        })
}
