//! Model bundle management for Model Hub
//!
//! This crate turns model bundles into canonically named component trees in
//! the shared model store, identifies the ensemble component, and keeps the
//! instance records the deployment controller works from.

pub mod ensemble;
pub mod materializer;
pub mod naming;
pub mod path_guard;
pub mod patcher;
pub mod repository;
pub mod source;
pub mod store;

// Re-export commonly used types
pub use ensemble::{EnsembleResolver, ResolvedEnsemble};
pub use materializer::{BundleMaterializer, MaterializedBundle};
pub use naming::{NameMapping, NameRewriter};
pub use path_guard::PathGuard;
pub use repository::{ModelRepository, ModelRequest};
pub use source::BundleSource;
pub use store::{FileInstanceStore, InstanceStore, MemoryInstanceStore};
