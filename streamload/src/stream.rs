//! Stream identity and the configured catalog.
//!
//! A [`Stream`] names a logical data channel by `name` and optional
//! `namespace`. It is the key for every per-stream structure in the engine,
//! so it is cheap to clone, hashable and totally ordered (namespace first,
//! then name) for deterministic tie-breaks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A logical stream, identified by namespace and name.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stream {
    namespace: Option<String>,
    name: String,
}

impl Stream {
    /// Creates a stream without a namespace.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Creates a stream within a namespace.
    pub fn with_namespace(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Creates a stream from an optional namespace, as found on the wire.
    pub fn from_parts(namespace: Option<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()),
            name: name.into(),
        }
    }

    /// Returns the stream name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the namespace, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}.{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Error parsing a `namespace.name` stream descriptor.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid stream descriptor '{0}' - expected 'name' or 'namespace.name'")]
pub struct StreamParseError(String);

impl FromStr for Stream {
    type Err = StreamParseError;

    /// Parses `name` or `namespace.name`. The first dot separates the parts.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once('.') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => {
                Ok(Stream::with_namespace(ns, name))
            }
            None if !s.is_empty() => Ok(Stream::new(s)),
            _ => Err(StreamParseError(s.to_string())),
        }
    }
}

/// The set of streams a run is configured to write.
///
/// Streams keep their configured order; duplicates are dropped.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    streams: Vec<Stream>,
}

impl Catalog {
    /// Creates a catalog from a list of streams.
    pub fn new(streams: impl IntoIterator<Item = Stream>) -> Self {
        let mut unique: Vec<Stream> = Vec::new();
        for stream in streams {
            if !unique.contains(&stream) {
                unique.push(stream);
            }
        }
        Self { streams: unique }
    }

    /// Returns the configured streams in order.
    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    /// Returns true if the stream is part of the catalog.
    pub fn contains(&self, stream: &Stream) -> bool {
        self.streams.contains(stream)
    }

    /// Number of configured streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Returns true if no streams are configured.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_and_without_namespace() {
        assert_eq!(Stream::new("users").to_string(), "users");
        assert_eq!(
            Stream::with_namespace("public", "users").to_string(),
            "public.users"
        );
    }

    #[test]
    fn test_parse_descriptor() {
        assert_eq!("users".parse::<Stream>().unwrap(), Stream::new("users"));
        assert_eq!(
            "public.users".parse::<Stream>().unwrap(),
            Stream::with_namespace("public", "users")
        );
        assert!("".parse::<Stream>().is_err());
        assert!(".users".parse::<Stream>().is_err());
    }

    #[test]
    fn test_from_parts_drops_empty_namespace() {
        assert_eq!(
            Stream::from_parts(Some(String::new()), "users"),
            Stream::new("users")
        );
    }

    #[test]
    fn test_ordering_is_namespace_then_name() {
        let mut streams = vec![
            Stream::with_namespace("b", "a"),
            Stream::with_namespace("a", "z"),
            Stream::new("m"),
        ];
        streams.sort();
        assert_eq!(streams[0], Stream::new("m"));
        assert_eq!(streams[1], Stream::with_namespace("a", "z"));
        assert_eq!(streams[2], Stream::with_namespace("b", "a"));
    }

    #[test]
    fn test_catalog_dedupes() {
        let catalog = Catalog::new(vec![Stream::new("a"), Stream::new("b"), Stream::new("a")]);
        assert_eq!(catalog.len(), 2);
        assert!(catalog.contains(&Stream::new("b")));
        assert!(!catalog.contains(&Stream::new("c")));
    }
}
