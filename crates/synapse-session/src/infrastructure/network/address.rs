//! `host:port` handling for bind and target addresses.
//!
//! Addresses stay strings until they reach tokio, which resolves host names
//! itself.  This module only checks the syntax early so a typo is reported
//! as an error instead of becoming an endless retry loop.
//!
//! Accepted forms: `192.168.1.10:24800`, `desk.local:24800`, `[::1]:24800`.

use std::net::Ipv6Addr;

use thiserror::Error;

/// Bind address used when the caller passes an empty string.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:24800";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,

    #[error("missing port in {0:?} (expected host:port)")]
    MissingPort(String),

    #[error("missing host in {0:?}")]
    MissingHost(String),

    #[error("invalid port in {0:?}")]
    InvalidPort(String),

    #[error("invalid IPv6 literal in {0:?} (use [addr]:port)")]
    InvalidIpv6(String),
}

/// Returns the address the server should bind, substituting
/// [`DEFAULT_BIND_ADDRESS`] for an empty input.
///
/// Port 0 is allowed and lets the OS pick a free port.
///
/// # Errors
///
/// Returns [`AddressError`] if a non-empty input is not `host:port`.
pub fn bind_address(input: &str) -> Result<String, AddressError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(DEFAULT_BIND_ADDRESS.to_string());
    }
    split_host_port(trimmed)?;
    Ok(trimmed.to_string())
}

/// Validates the address a client connects to.
///
/// # Errors
///
/// Returns [`AddressError`] if the input is empty, not `host:port`, or uses
/// port 0.
pub fn target_address(input: &str) -> Result<String, AddressError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AddressError::Empty);
    }
    let (_, port) = split_host_port(trimmed)?;
    if port == 0 {
        return Err(AddressError::InvalidPort(trimmed.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Splits `host:port`, unwrapping a bracketed IPv6 host.
fn split_host_port(s: &str) -> Result<(&str, u16), AddressError> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| AddressError::MissingPort(s.to_string()))?;

    let host = if let Some(inner) = host.strip_prefix('[') {
        let inner = inner
            .strip_suffix(']')
            .ok_or_else(|| AddressError::InvalidIpv6(s.to_string()))?;
        inner
            .parse::<Ipv6Addr>()
            .map_err(|_| AddressError::InvalidIpv6(s.to_string()))?;
        inner
    } else if host.contains(':') || host.contains(']') {
        return Err(AddressError::InvalidIpv6(s.to_string()));
    } else {
        host
    };

    if host.is_empty() {
        return Err(AddressError::MissingHost(s.to_string()));
    }
    if port.is_empty() {
        return Err(AddressError::MissingPort(s.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| AddressError::InvalidPort(s.to_string()))?;
    Ok((host, port))
}
