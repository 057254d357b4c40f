//! Ensemble detection
//!
//! The ensemble is the component that aggregates the others. A config that
//! declares `platform: "ensemble"` is one; failing that, the first config
//! declaring an `instance_group` together with a python backend is taken as
//! the aggregator.

use std::fs;
use std::path::{Path, PathBuf};
use regex::Regex;
use tracing::{debug, info, warn};

use common::error::{Error, Result};

use crate::naming::NameMapping;
use crate::patcher;

/// A config file written during materialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedConfig {
    /// Canonical name of the component owning the config
    pub component: String,
    /// Component directory in the model store
    pub component_dir: PathBuf,
    /// Path of the config file
    pub path: PathBuf,
}

/// How an ensemble was identified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsembleMatch {
    /// Declared `platform: "ensemble"`
    Platform,
    /// `instance_group` plus python backend
    PythonFallback,
}

/// The resolved ensemble
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEnsemble {
    /// Canonical name of the ensemble component
    pub component: String,
    /// Path of its config file
    pub config_path: PathBuf,
    /// How it was identified
    pub matched_by: EnsembleMatch,
}

/// Identifies the ensemble among collected configs
///
/// Patterns are compiled once per resolver; build one at startup and share it.
#[derive(Debug)]
pub struct EnsembleResolver {
    platform: Regex,
    instance_group: Regex,
    python_backend: Regex,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::Internal(format!("Invalid pattern {}: {}", pattern, e)))
}

impl EnsembleResolver {
    /// Creates a resolver
    pub fn new() -> Result<Self> {
        Ok(Self {
            platform: compile(r#"(?m)^\s*platform\s*:\s*["']ensemble["']"#)?,
            instance_group: compile(r"(?m)^\s*instance_group\b")?,
            python_backend: compile(r#"(?m)^\s*backend\s*:\s*["']python["']"#)?,
        })
    }

    /// Classifies one config's content
    pub fn classify(&self, content: &str) -> Option<EnsembleMatch> {
        if self.platform.is_match(content) {
            Some(EnsembleMatch::Platform)
        } else if self.instance_group.is_match(content) && self.python_backend.is_match(content) {
            Some(EnsembleMatch::PythonFallback)
        } else {
            None
        }
    }

    /// Picks the ensemble config without modifying anything
    pub fn detect<'a>(&self, configs: &'a [CollectedConfig]) -> Result<Option<(&'a CollectedConfig, EnsembleMatch)>> {
        let mut fallback = None;

        for config in configs {
            let content = fs::read_to_string(&config.path)?;
            match self.classify(&content) {
                Some(EnsembleMatch::Platform) => return Ok(Some((config, EnsembleMatch::Platform))),
                Some(EnsembleMatch::PythonFallback) if fallback.is_none() => {
                    fallback = Some((config, EnsembleMatch::PythonFallback));
                }
                _ => {}
            }
        }

        Ok(fallback)
    }

    /// Picks the ensemble and points its references at canonical names
    ///
    /// Every mapping entry is substituted into the fields of the ensemble
    /// config and, as quoted tokens, into the python scripts of the ensemble's
    /// first version folder.
    pub fn resolve(&self, configs: &[CollectedConfig], mapping: &NameMapping) -> Result<Option<ResolvedEnsemble>> {
        let Some((config, matched_by)) = self.detect(configs)? else {
            debug!("No ensemble among {} configs", configs.len());
            return Ok(None);
        };

        if matched_by == EnsembleMatch::PythonFallback {
            warn!(
                "No config declares platform \"ensemble\"; using python component {} as the ensemble",
                config.component
            );
        }

        patcher::patch_config_references(&config.path, mapping)?;

        if let Some(version_dir) = first_version_dir(&config.component_dir)? {
            for script in python_scripts(&version_dir)? {
                patcher::patch_references(&script, mapping)?;
            }
        }

        info!("Resolved ensemble {} ({:?})", config.component, matched_by);

        Ok(Some(ResolvedEnsemble {
            component: config.component.clone(),
            config_path: config.path.clone(),
            matched_by,
        }))
    }
}

/// Lowest integer-named subdirectory of a component directory
fn first_version_dir(component_dir: &Path) -> Result<Option<PathBuf>> {
    let mut versions = Vec::new();
    for entry in fs::read_dir(component_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(version) = entry.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) {
            versions.push((version, entry.path()));
        }
    }
    Ok(versions.into_iter().min_by_key(|(v, _)| *v).map(|(_, p)| p))
}

fn python_scripts(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut scripts = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("py") {
            scripts.push(path);
        }
    }
    scripts.sort();
    Ok(scripts)
}
