//! Utility functions for Beacon
//!
//! Path helpers for the hierarchical coordination namespace, plus local
//! address detection for member metadata defaults.

use if_addrs::IfAddr;

use crate::error::{DiscoveryError, Result};

/// Number of digits in an ensemble-assigned sequence suffix.
const SEQUENCE_DIGITS: usize = 10;

/// Normalize a namespace path: must be absolute, no empty segments,
/// trailing slashes stripped. `/` normalizes to itself.
pub fn normalize_path(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(DiscoveryError::IllegalArgument(
            "path must not be empty".to_string(),
        ));
    }
    if !path.starts_with('/') {
        return Err(DiscoveryError::IllegalArgument(format!(
            "path must be absolute: {path}"
        )));
    }
    if path == "/" {
        return Ok("/".to_string());
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.split('/').skip(1).any(str::is_empty) {
        return Err(DiscoveryError::IllegalArgument(format!(
            "path contains an empty segment: {path}"
        )));
    }
    Ok(trimmed.to_string())
}

/// Parent of an absolute path, or `None` for the root.
pub fn parent_path(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    let idx = path.rfind('/')?;
    if idx == 0 {
        Some("/".to_string())
    } else {
        Some(path[..idx].to_string())
    }
}

/// Final segment of a path.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Join a child name onto a parent path.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Extract the ensemble-assigned sequence number from a sequential node
/// name, e.g. `candidate-0000000042` -> `42`.
pub fn sequence_of(name: &str) -> Option<u64> {
    if name.len() < SEQUENCE_DIGITS {
        return None;
    }
    let suffix = &name[name.len() - SEQUENCE_DIGITS..];
    if suffix.bytes().all(|b| b.is_ascii_digit()) {
        suffix.parse().ok()
    } else {
        None
    }
}

/// Get the local IP address
///
/// Returns the first non-loopback IPv4 address found,
/// or "127.0.0.1" as fallback.
pub fn local_ip() -> String {
    if_addrs::get_if_addrs()
        .ok()
        .and_then(|addrs| {
            addrs
                .into_iter()
                .find(|iface| !iface.is_loopback() && matches!(iface.addr, IfAddr::V4(_)))
                .and_then(|iface| match iface.addr {
                    IfAddr::V4(addr) => Some(addr.ip.to_string()),
                    _ => None,
                })
        })
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/a/b").unwrap(), "/a/b");
        assert_eq!(normalize_path("/a/b/").unwrap(), "/a/b");
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert!(normalize_path("").is_err());
        assert!(normalize_path("a/b").is_err());
        assert!(normalize_path("/a//b").is_err());
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent_path("/a/b").as_deref(), Some("/a"));
        assert_eq!(parent_path("/a").as_deref(), Some("/"));
        assert_eq!(parent_path("/"), None);
        assert_eq!(node_name("/a/b/candidate-0000000001"), "candidate-0000000001");
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a/b", "c"), "/a/b/c");
    }

    #[test]
    fn test_sequence_of() {
        assert_eq!(sequence_of("candidate-0000000042"), Some(42));
        assert_eq!(sequence_of("member-0000000000"), Some(0));
        assert_eq!(sequence_of("candidate-"), None);
        assert_eq!(sequence_of("candidate-00000000ab"), None);
    }

    #[test]
    fn test_local_ip() {
        assert!(!local_ip().is_empty());
    }
}
