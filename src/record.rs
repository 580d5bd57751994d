//! Service record data model and wire parsing
//!
//! Defines the cached description of one logical service (its instance list
//! and TTL metadata) and the JSON wire formats consumed from both the pull
//! and push channels.
//!
//! # Wire Format
//!
//! ```json
//! {
//!   "dom": "my-service",
//!   "cacheMillis": 10000,
//!   "hosts": [
//!     {"ip": "10.0.0.1", "port": 8080, "weight": 1.0, "valid": true}
//!   ],
//!   "clusters": "",
//!   "env": ""
//! }
//! ```
//!
//! Unknown fields (checksum, lastRefTime, per-instance metadata) are
//! tolerated and ignored. A secondary compatibility shape exists for the
//! all-known-names endpoint: either a flat array of names or a
//! mapping-of-group-to-names; the flat shape is tried first.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::RecordError;

/// Separator between service name and client-affinity key in cache keys
pub const CACHE_KEY_SEPARATOR: &str = "@@";

/// Default server-advised TTL when the wire payload omits it
pub const DEFAULT_CACHE_MILLIS: i64 = 5000;

/// One network endpoint of a service
///
/// Immutable once constructed; equality is structural.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Endpoint IP address
    pub ip: String,

    /// Endpoint port
    pub port: u16,

    /// Selection weight (>= 0); fractional weights round up during expansion
    #[serde(default)]
    pub weight: f64,

    /// Health flag from the registry
    #[serde(default)]
    pub valid: bool,

    /// Informational metadata
    #[serde(default, rename = "appUseType")]
    pub app_use_type: String,

    /// Informational metadata
    #[serde(default)]
    pub site: String,
}

/// Cached description of one logical service
///
/// Owned exclusively by the registry store; callers receive copies.
/// Mutated in place by pull refresh or push; never explicitly deleted, only
/// superseded by newer versions under the same cache key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Logical service name
    #[serde(rename = "dom", default)]
    pub name: String,

    /// Cluster tag, informational
    #[serde(default)]
    pub clusters: String,

    /// Server-advised TTL in milliseconds
    #[serde(rename = "cacheMillis", default = "default_cache_millis")]
    pub cache_millis: i64,

    /// Wall-clock millis of the last successful fetch (local bookkeeping,
    /// not part of the wire format)
    #[serde(skip)]
    pub last_ref_millis: i64,

    /// Environment tag, informational
    #[serde(default)]
    pub env: String,

    /// Ordered instance list
    #[serde(rename = "hosts", default)]
    pub instances: Vec<Instance>,
}

const fn default_cache_millis() -> i64 {
    DEFAULT_CACHE_MILLIS
}

impl ServiceRecord {
    /// Create an empty placeholder record for `name`
    ///
    /// Inserted on first lookup miss to prevent duplicate concurrent
    /// fetches; carries the default TTL and the current time so repeated
    /// failures do not hot-loop faster than the TTL.
    #[must_use]
    pub fn placeholder(name: &str, now_millis: i64) -> Self {
        Self {
            name: name.to_string(),
            cache_millis: DEFAULT_CACHE_MILLIS,
            last_ref_millis: now_millis,
            ..Self::default()
        }
    }

    /// Whether the record is due for a refresh at `now_millis`
    #[must_use]
    pub const fn is_stale(&self, now_millis: i64) -> bool {
        now_millis - self.last_ref_millis > self.cache_millis
    }
}

/// Parse a response body into a `ServiceRecord`
///
/// Distinguishes two failure modes that callers must treat differently:
///
/// - [`RecordError::Parse`]: malformed JSON, the attempt is discarded
/// - [`RecordError::EmptyInstances`]: well-formed but zero instances; the
///   parsed name still travels in the error for bookkeeping
///
/// # Errors
///
/// Returns `RecordError` as described above.
pub fn parse_record(body: &str) -> Result<ServiceRecord, RecordError> {
    let record: ServiceRecord = serde_json::from_str(body).map_err(|e| {
        warn!("failed to parse service record: {e}");
        RecordError::Parse {
            reason: e.to_string(),
        }
    })?;

    if record.instances.is_empty() {
        warn!("empty instance list for service {}, ignoring", record.name);
        return Err(RecordError::EmptyInstances { name: record.name });
    }

    info!(
        "service {} updated, {} instances",
        record.name,
        record.instances.len()
    );

    Ok(record)
}

/// Build the cache key for a service name and client-affinity key
///
/// Used uniformly by the registry store, the on-disk persistence file name,
/// and the rotation-index store. The affinity key may be empty.
#[must_use]
pub fn cache_key(service: &str, client_key: &str) -> String {
    format!("{service}{CACHE_KEY_SEPARATOR}{client_key}")
}

/// Split a cache key back into (service name, client-affinity key)
#[must_use]
pub fn split_cache_key(key: &str) -> (&str, &str) {
    key.split_once(CACHE_KEY_SEPARATOR)
        .unwrap_or((key, ""))
}

/// Flat shape of the all-known-names payload
#[derive(Debug, Deserialize)]
struct KnownNamesFlat {
    #[serde(default)]
    doms: Vec<String>,
    #[serde(rename = "cacheMillis", default)]
    cache_millis: i64,
}

/// Mapping shape of the all-known-names payload (newer registries group
/// names by namespace)
#[derive(Debug, Deserialize)]
struct KnownNamesGrouped {
    #[serde(default)]
    doms: std::collections::HashMap<String, Vec<String>>,
    #[serde(rename = "cacheMillis", default)]
    cache_millis: i64,
}

/// Parsed all-known-names payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownNames {
    /// All service names the registry knows about
    pub names: Vec<String>,

    /// Server-advised refresh interval in milliseconds
    pub cache_millis: i64,
}

/// Parse the all-known-names payload, trying the flat shape first and
/// falling back to the grouped mapping shape
///
/// # Errors
///
/// Returns [`RecordError::Parse`] if neither shape matches.
pub fn parse_known_names(body: &str) -> Result<KnownNames, RecordError> {
    if let Ok(flat) = serde_json::from_str::<KnownNamesFlat>(body) {
        return Ok(KnownNames {
            names: flat.doms,
            cache_millis: flat.cache_millis,
        });
    }

    let grouped: KnownNamesGrouped = serde_json::from_str(body).map_err(|e| {
        warn!("failed to parse known-names payload: {e}");
        RecordError::Parse {
            reason: e.to_string(),
        }
    })?;

    let mut names = Vec::new();
    for group in grouped.doms.values() {
        names.extend(group.iter().cloned());
    }

    Ok(KnownNames {
        names,
        cache_millis: grouped.cache_millis,
    })
}
