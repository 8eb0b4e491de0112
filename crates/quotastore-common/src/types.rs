//! Core type definitions for Quotastore
//!
//! This module defines the fundamental types used throughout the system:
//! persistence types, storage client types, origin metadata and the
//! scope/pattern types used by directory locks and clear operations.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Persistence type of a storage repository.
///
/// `Persistent` origins are trusted unconditionally: they are never
/// quota-tracked and never evicted. The other three form the best-effort
/// pool that group and global limits apply to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PersistenceType {
    Persistent,
    Temporary,
    Default,
    Private,
}

/// All persistence types, in repository-id order.
pub const ALL_PERSISTENCE_TYPES: [PersistenceType; 4] = [
    PersistenceType::Persistent,
    PersistenceType::Temporary,
    PersistenceType::Default,
    PersistenceType::Private,
];

/// The quota-tracked persistence types.
pub const BEST_EFFORT_PERSISTENCE_TYPES: [PersistenceType; 3] = [
    PersistenceType::Temporary,
    PersistenceType::Default,
    PersistenceType::Private,
];

impl PersistenceType {
    /// Name of the repository directory under `<root>/storage/`.
    #[must_use]
    pub const fn directory_name(self) -> &'static str {
        match self {
            Self::Persistent => "permanent",
            Self::Temporary => "temporary",
            Self::Default => "default",
            Self::Private => "private",
        }
    }

    /// Parse a repository directory name.
    #[must_use]
    pub fn from_directory_name(name: &str) -> Option<Self> {
        ALL_PERSISTENCE_TYPES
            .into_iter()
            .find(|t| t.directory_name() == name)
    }

    /// Stable numeric id used as the `repository` table key.
    #[must_use]
    pub const fn repository_id(self) -> u8 {
        match self {
            Self::Persistent => 0,
            Self::Temporary => 1,
            Self::Default => 2,
            Self::Private => 3,
        }
    }

    /// Inverse of [`Self::repository_id`].
    #[must_use]
    pub const fn from_repository_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Persistent),
            1 => Some(Self::Temporary),
            2 => Some(Self::Default),
            3 => Some(Self::Private),
            _ => None,
        }
    }

    /// Whether origins of this type participate in quota tracking.
    #[must_use]
    pub const fn is_best_effort(self) -> bool {
        !matches!(self, Self::Persistent)
    }
}

impl fmt::Display for PersistenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.directory_name())
    }
}

/// A storage client subsystem that owns data inside origin directories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClientType {
    /// Key-value store (indexed records).
    KeyValue,
    /// Response/asset cache.
    Cache,
    /// Local storage (small string pairs).
    LocalStorage,
}

/// Number of client types; the length of [`ClientUsageArray`].
pub const CLIENT_TYPE_COUNT: usize = 3;

/// All client types, in [`ClientType::index`] order.
pub const ALL_CLIENT_TYPES: [ClientType; CLIENT_TYPE_COUNT] = [
    ClientType::KeyValue,
    ClientType::Cache,
    ClientType::LocalStorage,
];

impl ClientType {
    /// Position in [`ClientUsageArray`].
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::KeyValue => 0,
            Self::Cache => 1,
            Self::LocalStorage => 2,
        }
    }

    /// Name of the client directory under an origin directory.
    #[must_use]
    pub const fn directory_name(self) -> &'static str {
        match self {
            Self::KeyValue => "kv",
            Self::Cache => "cache",
            Self::LocalStorage => "ls",
        }
    }

    /// Parse a client directory name.
    #[must_use]
    pub fn from_directory_name(name: &str) -> Option<Self> {
        ALL_CLIENT_TYPES
            .into_iter()
            .find(|t| t.directory_name() == name)
    }

    /// One-letter prefix used by the textual [`ClientUsageArray`] encoding.
    #[must_use]
    pub const fn prefix(self) -> char {
        match self {
            Self::KeyValue => 'K',
            Self::Cache => 'C',
            Self::LocalStorage => 'L',
        }
    }

    /// Inverse of [`Self::prefix`].
    #[must_use]
    pub const fn from_prefix(prefix: char) -> Option<Self> {
        match prefix {
            'K' => Some(Self::KeyValue),
            'C' => Some(Self::Cache),
            'L' => Some(Self::LocalStorage),
            _ => None,
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.directory_name())
    }
}

/// Identifies one storage boundary, derived from a security principal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginMetadata {
    /// Origin attributes suffix, e.g. `^userContextId=2`. Empty if none.
    pub suffix: String,
    /// Quota group the origin belongs to (base domain plus suffix).
    pub group: String,
    /// Full origin string including the suffix.
    pub origin: String,
    /// Origin string used for the on-disk directory. Differs from
    /// `origin` only for private-browsing origins.
    pub storage_origin: String,
    /// Repository the origin lives in.
    pub persistence_type: PersistenceType,
    /// Whether the origin belongs to a private-browsing session.
    pub is_private: bool,
}

impl OriginMetadata {
    /// Build metadata for an origin string of the form
    /// `scheme://host[:port][^suffix]`.
    ///
    /// The group is derived from the host with a best-effort base-domain
    /// heuristic (last two dot-separated labels); embedders with a real
    /// public-suffix source can construct the struct directly instead.
    #[must_use]
    pub fn new(origin: impl Into<String>, persistence_type: PersistenceType) -> Self {
        let origin = origin.into();
        let (origin_no_suffix, suffix) = split_origin_suffix(&origin);
        let group = format!("{}{suffix}", base_domain(origin_no_suffix));
        let is_private = persistence_type == PersistenceType::Private;
        Self {
            suffix: suffix.to_string(),
            group,
            storage_origin: origin.clone(),
            origin,
            persistence_type,
            is_private,
        }
    }

    /// The origin string without its attributes suffix.
    #[must_use]
    pub fn origin_no_suffix(&self) -> &str {
        split_origin_suffix(&self.origin).0
    }
}

/// [`OriginMetadata`] plus the mutable per-origin state kept on disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullOriginMetadata {
    pub metadata: OriginMetadata,
    /// Whether the origin is pinned and exempt from eviction.
    pub persisted: bool,
    /// Last access time in microseconds since the Unix epoch.
    pub last_access_time: i64,
}

/// Per-client byte counts for one origin. `None` means not yet measured.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientUsageArray(pub [Option<u64>; CLIENT_TYPE_COUNT]);

impl ClientUsageArray {
    /// Usage recorded for one client.
    #[must_use]
    pub const fn get(&self, client: ClientType) -> Option<u64> {
        self.0[client.index()]
    }

    /// Replace the usage recorded for one client.
    pub const fn set(&mut self, client: ClientType, usage: Option<u64>) {
        self.0[client.index()] = usage;
    }

    /// Sum of all measured client usages.
    ///
    /// Accounting arithmetic is checked; an overflow here means the
    /// tracked state is already unreliable.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.iter().flatten().try_fold(0u64, |acc, usage| {
            acc.checked_add(*usage)
        }).unwrap_or_else(|| {
            crate::error::fatal_invariant("client usage sum overflow")
        })
    }

    /// Encode as text, e.g. `K123;C456`. Absent entries are omitted.
    #[must_use]
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for client in ALL_CLIENT_TYPES {
            if let Some(usage) = self.get(client) {
                if !out.is_empty() {
                    out.push(';');
                }
                out.push(client.prefix());
                out.push_str(&usage.to_string());
            }
        }
        out
    }

    /// Parse the textual encoding produced by [`Self::serialize`].
    pub fn deserialize(text: &str) -> Result<Self, ClientUsageParseError> {
        let mut array = Self::default();
        if text.is_empty() {
            return Ok(array);
        }
        for part in text.split(';') {
            let mut chars = part.chars();
            let prefix = chars.next().ok_or(ClientUsageParseError::Empty)?;
            let client = ClientType::from_prefix(prefix)
                .ok_or(ClientUsageParseError::UnknownPrefix(prefix))?;
            let usage: u64 = chars
                .as_str()
                .parse()
                .map_err(|_| ClientUsageParseError::BadNumber(part.to_string()))?;
            if array.get(client).is_some() {
                return Err(ClientUsageParseError::Duplicate(prefix));
            }
            array.set(client, Some(usage));
        }
        Ok(array)
    }
}

/// Errors that can occur when parsing a textual client usage array.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientUsageParseError {
    #[error("empty client usage entry")]
    Empty,
    #[error("unknown client prefix: {0}")]
    UnknownPrefix(char),
    #[error("duplicate client prefix: {0}")]
    Duplicate(char),
    #[error("malformed client usage entry: {0}")]
    BadNumber(String),
}

/// A set of `key=value` constraints matched against origin attribute
/// suffixes, used by pattern-scoped clear operations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginAttributesPattern {
    required: HashMap<String, String>,
}

impl OriginAttributesPattern {
    /// Parse a pattern string of the form `key=value&key2=value2`.
    /// An empty string matches every origin.
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        let mut required = HashMap::new();
        for pair in pattern.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                required.insert(key.to_string(), value.to_string());
            }
        }
        Self { required }
    }

    /// Whether an origin's suffix (`^key=value&...` or empty) satisfies
    /// every constraint in this pattern.
    #[must_use]
    pub fn matches_suffix(&self, suffix: &str) -> bool {
        let attrs: HashMap<&str, &str> = suffix
            .strip_prefix('^')
            .unwrap_or(suffix)
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        self.required
            .iter()
            .all(|(key, value)| attrs.get(key.as_str()) == Some(&value.as_str()))
    }

    /// Whether this pattern constrains anything at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
    }
}

/// The origin dimension of a directory lock or clear operation.
#[derive(Clone, Debug)]
pub enum OriginScope {
    /// Exactly one origin (including its suffix).
    Origin(String),
    /// Every origin whose suffix-stripped form equals the given prefix.
    Prefix(String),
    /// Every origin whose suffix matches the pattern.
    Pattern(OriginAttributesPattern),
    /// Every origin.
    Null,
}

impl OriginScope {
    /// Whether a concrete origin string falls inside this scope.
    #[must_use]
    pub fn matches_origin(&self, origin: &str) -> bool {
        let (no_suffix, suffix) = split_origin_suffix(origin);
        match self {
            Self::Origin(o) => o == origin,
            Self::Prefix(prefix) => no_suffix == prefix,
            Self::Pattern(pattern) => pattern.matches_suffix(suffix),
            Self::Null => true,
        }
    }

    /// Conservative scope intersection used for lock conflict detection:
    /// may report an overlap that cannot occur, never the reverse.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => true,
            (Self::Origin(origin), _) => other.matches_origin(origin),
            (_, Self::Origin(origin)) => self.matches_origin(origin),
            (Self::Prefix(a), Self::Prefix(b)) => a == b,
            // Pattern/prefix combinations cannot be decided without
            // enumerating origins; treat them as overlapping.
            (Self::Pattern(_), _) | (_, Self::Pattern(_)) => true,
        }
    }
}

/// Split an origin string into its suffix-free part and the suffix
/// (with the leading `^`, or empty).
#[must_use]
pub fn split_origin_suffix(origin: &str) -> (&str, &str) {
    origin
        .find('^')
        .map_or((origin, ""), |pos| origin.split_at(pos))
}

/// Best-effort base domain: the last two dot-separated labels of the
/// host part, with scheme and port preserved away.
fn base_domain(origin_no_suffix: &str) -> String {
    let host = origin_no_suffix
        .split_once("://")
        .map_or(origin_no_suffix, |(_, rest)| rest);
    let host = host.split(':').next().unwrap_or(host);
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        host.to_string()
    } else {
        labels[labels.len() - 2..].join(".")
    }
}

/// Current time in microseconds since the Unix epoch.
#[must_use]
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_type_roundtrip() {
        for t in ALL_PERSISTENCE_TYPES {
            assert_eq!(PersistenceType::from_directory_name(t.directory_name()), Some(t));
            assert_eq!(PersistenceType::from_repository_id(t.repository_id()), Some(t));
        }
        assert!(PersistenceType::from_directory_name("to-be-removed").is_none());
    }

    #[test]
    fn test_best_effort_excludes_persistent() {
        assert!(!PersistenceType::Persistent.is_best_effort());
        for t in BEST_EFFORT_PERSISTENCE_TYPES {
            assert!(t.is_best_effort());
        }
    }

    #[test]
    fn test_client_usage_array_roundtrip() {
        let mut usages = ClientUsageArray::default();
        usages.set(ClientType::KeyValue, Some(123));
        usages.set(ClientType::LocalStorage, Some(0));

        let text = usages.serialize();
        assert_eq!(text, "K123;L0");
        assert_eq!(ClientUsageArray::deserialize(&text).unwrap(), usages);
        assert_eq!(usages.total(), 123);
    }

    #[test]
    fn test_client_usage_array_empty() {
        let usages = ClientUsageArray::default();
        assert_eq!(usages.serialize(), "");
        assert_eq!(ClientUsageArray::deserialize("").unwrap(), usages);
        assert_eq!(usages.total(), 0);
    }

    #[test]
    fn test_client_usage_array_rejects_garbage() {
        assert!(ClientUsageArray::deserialize("X12").is_err());
        assert!(ClientUsageArray::deserialize("K12;K13").is_err());
        assert!(ClientUsageArray::deserialize("Kabc").is_err());
    }

    #[test]
    fn test_origin_metadata_group() {
        let meta = OriginMetadata::new("https://sub.example.com", PersistenceType::Default);
        assert_eq!(meta.group, "example.com");
        assert_eq!(meta.suffix, "");

        let meta = OriginMetadata::new(
            "https://example.com^userContextId=2",
            PersistenceType::Temporary,
        );
        assert_eq!(meta.group, "example.com^userContextId=2");
        assert_eq!(meta.suffix, "^userContextId=2");
        assert_eq!(meta.origin_no_suffix(), "https://example.com");
    }

    #[test]
    fn test_attributes_pattern() {
        let pattern = OriginAttributesPattern::parse("userContextId=2");
        assert!(pattern.matches_suffix("^userContextId=2"));
        assert!(pattern.matches_suffix("^privateBrowsingId=1&userContextId=2"));
        assert!(!pattern.matches_suffix("^userContextId=3"));
        assert!(!pattern.matches_suffix(""));

        let empty = OriginAttributesPattern::parse("");
        assert!(empty.matches_suffix(""));
        assert!(empty.matches_suffix("^userContextId=2"));
    }

    #[test]
    fn test_origin_scope_matches() {
        let origin = "https://example.com^userContextId=2";

        assert!(OriginScope::Null.matches_origin(origin));
        assert!(OriginScope::Origin(origin.to_string()).matches_origin(origin));
        assert!(!OriginScope::Origin("https://example.com".to_string()).matches_origin(origin));
        assert!(OriginScope::Prefix("https://example.com".to_string()).matches_origin(origin));
        assert!(
            OriginScope::Pattern(OriginAttributesPattern::parse("userContextId=2"))
                .matches_origin(origin)
        );
    }

    #[test]
    fn test_origin_scope_overlaps() {
        let a = OriginScope::Origin("https://a.example.com".to_string());
        let b = OriginScope::Prefix("https://a.example.com".to_string());
        let c = OriginScope::Origin("https://b.example.com".to_string());

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(OriginScope::Null.overlaps(&c));
        assert!(b.overlaps(&OriginScope::Pattern(OriginAttributesPattern::parse(""))));
    }
}
