//! Canonical naming of bundle entries
//!
//! The first segment of every bundle path is a top-level component. It is
//! renamed to `{owner}#{model}#{component}#{instance}`; every segment below it
//! is kept, so version folders (`1/`, `2/`) survive as-is.

use std::collections::HashMap;
use std::path::PathBuf;

use common::error::{Error, Result};
use common::types::{CanonicalName, InstanceKey};

/// Directory names never materialized, at any depth
const IGNORED_SEGMENTS: [&str; 5] = [".git", ".dvc", "__MACOSX", "__pycache__", ".DS_Store"];

/// Canonical name for a component; pure and deterministic
pub fn canonical_name(original: &str, owner_scope: &str, model_id: &str, instance_id: &str) -> String {
    format!("{}#{}#{}#{}", owner_scope, model_id, original, instance_id)
}

/// Returns true if a bundle path segment marks VCS, DVC or OS metadata
pub fn is_ignored_segment(segment: &str) -> bool {
    IGNORED_SEGMENTS.contains(&segment)
        || segment.starts_with(".git")
        || segment.ends_with(".dvc")
        || segment == ".dvcignore"
}

/// Original → canonical names assigned during one materialization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameMapping {
    /// Entries in assignment order
    entries: Vec<(String, String)>,
}

impl NameMapping {
    /// Canonical name assigned to `original`
    pub fn get(&self, original: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(old, _)| old == original)
            .map(|(_, new)| new.as_str())
    }

    /// Entries in assignment order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(old, new)| (old.as_str(), new.as_str()))
    }

    /// Entries ordered by descending original-name length, so that a name is
    /// never substituted inside a longer one that is pending substitution
    pub fn longest_first(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A bundle path after rewriting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenPath {
    /// Top-level component name as authored
    pub original: String,
    /// Canonical name of the top-level component
    pub canonical: String,
    /// Segments below the top-level component, unchanged
    pub rest: Vec<String>,
}

impl RewrittenPath {
    /// Destination path relative to the model store root
    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::from(&self.canonical);
        path.extend(&self.rest);
        path
    }

    /// Number of segments including the top-level component
    pub fn depth(&self) -> usize {
        1 + self.rest.len()
    }

    /// Last segment of the path
    pub fn file_name(&self) -> &str {
        self.rest.last().unwrap_or(&self.original)
    }
}

/// Rewrites bundle paths for one instance and records the mapping
#[derive(Debug)]
pub struct NameRewriter {
    /// Instance every name is scoped to
    key: InstanceKey,

    /// Names assigned so far
    mapping: NameMapping,

    /// Canonical → original, to detect reuse
    assigned: HashMap<String, String>,
}

impl NameRewriter {
    /// Creates a rewriter for `key`
    pub fn new(key: InstanceKey) -> Self {
        Self {
            key,
            mapping: NameMapping::default(),
            assigned: HashMap::new(),
        }
    }

    /// Instance the rewriter is scoped to
    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    /// Canonical name for a top-level component, recorded in the mapping
    pub fn rewrite(&mut self, original: &str) -> Result<String> {
        if let Some(existing) = self.mapping.get(original) {
            return Ok(existing.to_string());
        }

        // Validates the component name; names containing '#' cannot round-trip
        let canonical = CanonicalName::new(
            &self.key.owner_scope,
            &self.key.model_id,
            original,
            &self.key.instance_id,
        )?
        .to_string();

        if let Some(previous) = self.assigned.get(&canonical) {
            return Err(Error::Internal(format!(
                "canonical name {} already assigned to {}",
                canonical, previous
            )));
        }

        self.assigned.insert(canonical.clone(), original.to_string());
        self.mapping
            .entries
            .push((original.to_string(), canonical.clone()));

        Ok(canonical)
    }

    /// Rewrites a `/`-separated bundle path
    ///
    /// Returns `None` for the bundle root and for ignored metadata paths.
    /// Absolute paths and `..` segments are rejected.
    pub fn rewrite_path(&mut self, relative: &str) -> Result<Option<RewrittenPath>> {
        let Some(segments) = split_bundle_path(relative)? else {
            return Ok(None);
        };

        let (original, rest) = match segments.split_first() {
            Some((first, rest)) => (first.clone(), rest.to_vec()),
            None => return Ok(None),
        };

        let canonical = self.rewrite(&original)?;

        Ok(Some(RewrittenPath { original, canonical, rest }))
    }

    /// Mapping assigned so far
    pub fn mapping(&self) -> &NameMapping {
        &self.mapping
    }
}

/// Splits a bundle path into segments, trimming separators and `.` segments
fn split_bundle_path(relative: &str) -> Result<Option<Vec<String>>> {
    if relative.starts_with('/') {
        return Err(Error::InvalidPath(format!("bundle entry {} is absolute", relative)));
    }

    let segments: Vec<String> = relative
        .trim_end_matches('/')
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .map(str::to_string)
        .collect();

    if segments.iter().any(|s| s == "..") {
        return Err(Error::InvalidPath(format!(
            "bundle entry {} contains a parent-directory segment",
            relative
        )));
    }

    if segments.is_empty() || segments.iter().any(|s| is_ignored_segment(s)) {
        return Ok(None);
    }

    Ok(Some(segments))
}
