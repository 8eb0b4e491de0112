//! Origin string to directory leaf name mapping
//!
//! Directory names cannot contain path separators or other reserved
//! characters, so origins are sanitized by replacing each reserved
//! character with `+` (`https://example.com` becomes
//! `https+++example.com`). The mapping is not reversible in general;
//! [`parse_origin_leaf`] reconstructs the common shapes and is only used
//! when an origin's metadata record is lost.

use quotastore_common::{Error, Result, split_origin_suffix};

const RESERVED: &[char] = &['/', ':', '\\', '*', '?', '"', '<', '>', '|'];

/// Map an origin string to its on-disk directory leaf name.
#[must_use]
pub fn sanitize_origin(origin: &str) -> String {
    origin
        .chars()
        .map(|c| {
            if RESERVED.contains(&c) || c.is_control() {
                '+'
            } else {
                c
            }
        })
        .collect()
}

/// Whether a directory leaf name still matches the current sanitization
/// of the origin it claims to hold. Drift means the directory was
/// created by an older sanitization algorithm and must be re-derived.
#[must_use]
pub fn is_leaf_name_current(origin: &str, leaf: &str) -> bool {
    sanitize_origin(origin) == leaf
}

/// Best-effort inverse of [`sanitize_origin`] for the common
/// `scheme+++host[+port][^suffix]` shapes. Used to reconstruct lost
/// metadata from a directory name.
pub fn parse_origin_leaf(leaf: &str) -> Result<String> {
    let (no_suffix, suffix) = split_origin_suffix(leaf);

    let (scheme, host_part) = no_suffix
        .split_once("+++")
        .ok_or_else(|| Error::InvalidOrigin(leaf.to_string()))?;

    if scheme.is_empty() || host_part.is_empty() {
        return Err(Error::InvalidOrigin(leaf.to_string()));
    }

    // A trailing "+<digits>" is a sanitized port separator.
    let host = match host_part.rsplit_once('+') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            format!("{host}:{port}")
        }
        _ => host_part.to_string(),
    };

    Ok(format!("{scheme}://{host}{suffix}"))
}
