//! Bundle materialization
//!
//! Writes a bundle into the model store under canonical names. Every entry is
//! rewritten by [`NameRewriter`], validated by [`PathGuard`] and copied
//! verbatim; component configs get their `name` declaration patched on the
//! way. Once every entry is written the ensemble is resolved.
//!
//! Materialization never rolls back. A failed run leaves partial output that
//! the repository removes by prefix.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use bytesize::ByteSize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use common::error::{Error, Result};
use common::models::{Component, DeploymentState, InstanceUpdate, ENSEMBLE_PLATFORM};
use common::types::InstanceKey;

use crate::ensemble::{CollectedConfig, EnsembleResolver, ResolvedEnsemble};
use crate::naming::{NameMapping, NameRewriter, RewrittenPath};
use crate::path_guard::PathGuard;
use crate::patcher;

/// File name surfaced for metadata extraction
const README_FILE: &str = "README.md";

/// Version assumed for a component that declares a config but no version folder
const DEFAULT_VERSION: u64 = 1;

/// Outcome of a successful materialization
#[derive(Debug, Clone)]
pub struct MaterializedBundle {
    /// Destination path of the shallowest README.md
    pub readme_path: Option<PathBuf>,
    /// The resolved ensemble, if any
    pub ensemble: Option<ResolvedEnsemble>,
    /// Components in order of first appearance
    pub components: Vec<Component>,
    /// Names assigned during this run
    pub mapping: NameMapping,
    /// Number of files written
    pub files: usize,
    /// Number of bytes written
    pub bytes: u64,
}

impl MaterializedBundle {
    /// Settable instance fields carried by this bundle
    pub fn into_update(self) -> InstanceUpdate {
        InstanceUpdate {
            components: self.components,
            ensemble: self.ensemble.map(|e| e.component),
            readme_path: self.readme_path,
        }
    }
}

/// Per top-level entry bookkeeping
#[derive(Debug)]
struct TopLevel {
    original: String,
    canonical: String,
    version: Option<u64>,
    has_config: bool,
}

/// Materializes one bundle for one instance
///
/// Entries are fed one at a time through [`add_directory`](Self::add_directory)
/// and [`add_file`](Self::add_file), or in bulk from a directory or tar stream.
/// All operations block; run them off the async runtime.
pub struct BundleMaterializer {
    /// Confines every write to the model store
    guard: PathGuard,

    /// Assigns canonical names
    rewriter: NameRewriter,

    /// Picks the ensemble once all configs are written
    resolver: Arc<EnsembleResolver>,

    /// Top-level entries in order of first appearance
    top_level: Vec<TopLevel>,

    /// Original name → index into `top_level`
    index: HashMap<String, usize>,

    /// Configs written so far
    configs: Vec<CollectedConfig>,

    /// README candidate and its depth
    readme: Option<(usize, PathBuf)>,

    files: usize,
    bytes: u64,
}

impl BundleMaterializer {
    /// Creates a materializer writing below `dest_root`
    pub fn new(key: InstanceKey, dest_root: impl Into<PathBuf>, resolver: Arc<EnsembleResolver>) -> Self {
        Self {
            guard: PathGuard::new(dest_root),
            rewriter: NameRewriter::new(key),
            resolver,
            top_level: Vec::new(),
            index: HashMap::new(),
            configs: Vec::new(),
            readme: None,
            files: 0,
            bytes: 0,
        }
    }

    /// Instance being materialized
    pub fn key(&self) -> &InstanceKey {
        self.rewriter.key()
    }

    fn track(&mut self, path: &RewrittenPath, is_dir: bool) -> usize {
        let idx = match self.index.get(&path.original) {
            Some(idx) => *idx,
            None => {
                self.top_level.push(TopLevel {
                    original: path.original.clone(),
                    canonical: path.canonical.clone(),
                    version: None,
                    has_config: false,
                });
                self.index.insert(path.original.clone(), self.top_level.len() - 1);
                self.top_level.len() - 1
            }
        };

        // An integer segment directly below the component is a version folder
        let below_component = if is_dir { !path.rest.is_empty() } else { path.rest.len() >= 2 };
        let version = below_component
            .then(|| path.rest[0].parse::<u64>().ok())
            .flatten();
        if let Some(version) = version {
            let entry = &mut self.top_level[idx];
            if entry.version.is_none() {
                debug!("Component {} has version folder {}", entry.original, version);
                entry.version = Some(version);
            }
        }

        idx
    }

    /// Creates the canonical directory for a bundle directory entry
    pub fn add_directory(&mut self, relative: &str) -> Result<()> {
        let Some(path) = self.rewriter.rewrite_path(relative)? else {
            debug!("Skipping bundle directory {}", relative);
            return Ok(());
        };

        let dest = self.guard.validate(&path.relative_path())?;
        fs::create_dir_all(&dest)?;
        self.track(&path, true);

        Ok(())
    }

    /// Copies a bundle file to its canonical destination
    pub fn add_file<R: Read + ?Sized>(&mut self, relative: &str, reader: &mut R) -> Result<()> {
        let Some(path) = self.rewriter.rewrite_path(relative)? else {
            debug!("Skipping bundle file {}", relative);
            return Ok(());
        };

        let dest = self.guard.validate(&path.relative_path())?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = File::create(&dest)?;
        let written = io::copy(reader, &mut file)?;
        self.files += 1;
        self.bytes += written;

        let idx = self.track(&path, false);

        // Configs live inside a component directory
        if path.depth() >= 2 && patcher::is_config_file(&dest) {
            patcher::patch_name(&dest, &path.original, &path.canonical)?;
            self.top_level[idx].has_config = true;
            self.configs.push(CollectedConfig {
                component: path.canonical.clone(),
                component_dir: self.guard.root().join(&path.canonical),
                path: dest.clone(),
            });
        }

        if path.file_name().eq_ignore_ascii_case(README_FILE) {
            let depth = path.depth();
            if self.readme.as_ref().map_or(true, |(d, _)| depth < *d) {
                self.readme = Some((depth, dest));
            }
        }

        Ok(())
    }

    /// Resolves the ensemble and returns the bundle description
    pub fn finish(self) -> Result<MaterializedBundle> {
        let ensemble = self.resolver.resolve(&self.configs, self.rewriter.mapping())?;

        let components: Vec<Component> = self
            .top_level
            .into_iter()
            .filter(|t| t.version.is_some() || t.has_config)
            .map(|t| {
                let is_ensemble = ensemble.as_ref().map_or(false, |e| e.component == t.canonical);
                Component {
                    original_name: t.original,
                    canonical_name: t.canonical,
                    version_number: t.version.unwrap_or(DEFAULT_VERSION),
                    platform: is_ensemble.then(|| ENSEMBLE_PLATFORM.to_string()),
                    status: DeploymentState::Offline,
                }
            })
            .collect();

        info!(
            "Materialized {} for {}: {} components, {} files, {}",
            self.guard.root().display(),
            self.rewriter.key(),
            components.len(),
            self.files,
            ByteSize(self.bytes)
        );

        Ok(MaterializedBundle {
            readme_path: self.readme.map(|(_, p)| p),
            ensemble,
            components,
            mapping: self.rewriter.mapping().clone(),
            files: self.files,
            bytes: self.bytes,
        })
    }

    /// Materializes a directory tree, e.g. a repository clone
    ///
    /// Symlinks are not followed and not copied.
    pub fn materialize_dir(mut self, src: &Path) -> Result<MaterializedBundle> {
        info!("Materializing directory {} for {}", src.display(), self.key());

        let walker = WalkDir::new(src)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0 || !e.file_name().to_str().map_or(false, crate::naming::is_ignored_segment)
            });

        for entry in walker {
            let entry = entry.map_err(|e| Error::Io(io::Error::from(e)))?;
            if entry.depth() == 0 {
                continue;
            }

            let relative = bundle_path(entry.path().strip_prefix(src).map_err(|_| {
                Error::InvalidPath(format!("{} is outside {}", entry.path().display(), src.display()))
            })?)?;

            let file_type = entry.file_type();
            if file_type.is_dir() {
                self.add_directory(&relative)?;
            } else if file_type.is_file() {
                let mut file = File::open(entry.path())?;
                self.add_file(&relative, &mut file)?;
            } else {
                warn!("Skipping non-regular bundle entry {}", relative);
            }
        }

        self.finish()
    }

    /// Materializes an uncompressed tar stream
    ///
    /// Only regular files and directories are extracted.
    pub fn materialize_tar<R: Read>(mut self, reader: R) -> Result<MaterializedBundle> {
        info!("Materializing archive for {}", self.key());

        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_type = entry.header().entry_type();
            let relative = bundle_path(&entry.path()?)?;

            if entry_type.is_dir() {
                self.add_directory(&relative)?;
            } else if entry_type.is_file() {
                self.add_file(&relative, &mut entry)?;
            } else if entry_type.is_pax_global_extensions() || entry_type.is_pax_local_extensions() {
                continue;
            } else {
                warn!("Skipping archive entry {} of type {:?}", relative, entry_type);
            }
        }

        self.finish()
    }
}

/// Converts a relative filesystem path into a `/`-separated bundle path
fn bundle_path(path: &Path) -> Result<String> {
    let mut segments = Vec::new();
    for component in path.components() {
        let segment = component
            .as_os_str()
            .to_str()
            .ok_or_else(|| Error::InvalidPath(format!("{} is not valid UTF-8", path.display())))?;
        segments.push(segment);
    }
    Ok(segments.join("/"))
}
