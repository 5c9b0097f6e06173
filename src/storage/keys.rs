//! Mapping between logical keys and the bucket address space.
//!
//! A logical key such as `"agents/agent1/config"` is split on the configured
//! separator. Every segment but the last names a nested bucket, the last one
//! is the leaf key inside the innermost bucket:
//!
//! ```text
//! "agents/agent1/config"  ->  buckets ["agents", "agent1"], leaf "config"
//! ```
//!
//! Splitting and joining with the same separator is lossless, so the mapping
//! is a bijection over valid keys.

use crate::error::{KvError, KvResult};

/// Splits logical keys into bucket paths and joins them back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyMapper {
    separator: String,
}

impl KeyMapper {
    /// Creates a mapper. An empty separator keeps every key in the root bucket.
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Returns `true` when keys are not split into buckets.
    pub fn is_flat(&self) -> bool {
        self.separator.is_empty()
    }

    /// Maps a logical key to its bucket path and leaf key.
    pub fn map_key<'k>(&self, key: &'k str) -> KvResult<(Vec<&'k str>, &'k str)> {
        if key.is_empty() {
            return Err(KvError::malformed(key, "key is empty"));
        }
        if key.contains('\0') {
            return Err(KvError::malformed(key, "key contains a NUL byte"));
        }
        if self.is_flat() {
            return Ok((Vec::new(), key));
        }
        if key.ends_with(self.separator.as_str()) {
            return Err(KvError::malformed(key, "key ends with the bucket separator"));
        }

        let mut segments: Vec<&str> = key.split(self.separator.as_str()).collect();
        let leaf = segments.pop().unwrap_or(key);
        Ok((segments, leaf))
    }

    /// Joins a bucket path and leaf key back into a logical key.
    pub fn join_key<S: AsRef<str>>(&self, buckets: &[S], leaf: &str) -> String {
        let mut key = self.bucket_prefix(buckets);
        key.push_str(leaf);
        key
    }

    /// Logical prefix shared by every key stored under `buckets`,
    /// including the trailing separator.
    pub fn bucket_prefix<S: AsRef<str>>(&self, buckets: &[S]) -> String {
        let mut prefix = String::new();
        for bucket in buckets {
            prefix.push_str(bucket.as_ref());
            prefix.push_str(&self.separator);
        }
        prefix
    }

    /// Splits a scan prefix into the buckets it fully names and the partial
    /// name that remains for the innermost bucket.
    ///
    /// Unlike keys, prefixes may be empty or end with the separator:
    /// `"a/b/"` names buckets `["a", "b"]` with an empty partial name.
    pub fn split_prefix<'p>(&self, prefix: &'p str) -> KvResult<(Vec<&'p str>, &'p str)> {
        if prefix.contains('\0') {
            return Err(KvError::malformed(prefix, "prefix contains a NUL byte"));
        }
        if self.is_flat() {
            return Ok((Vec::new(), prefix));
        }

        let mut segments: Vec<&str> = prefix.split(self.separator.as_str()).collect();
        let partial = segments.pop().unwrap_or(prefix);
        Ok((segments, partial))
    }

    /// Longest leading part of `partial` that every matching child name must
    /// start with.
    ///
    /// With a multi-character separator the tail of `partial` may be the start
    /// of a separator, in which case the child name ends before it.
    pub fn scan_name_prefix<'p>(&self, partial: &'p str) -> &'p str {
        for cut in (1..self.separator.len()).rev() {
            if !self.separator.is_char_boundary(cut) {
                continue;
            }
            let head = &self.separator[..cut];
            if let Some(stripped) = partial.strip_suffix(head) {
                return stripped;
            }
        }
        partial
    }
}

impl Default for KeyMapper {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_BUCKET_SEPARATOR)
    }
}
