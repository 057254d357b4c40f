//! Common data models for Model Hub
//!
//! This module defines the data model shared by materialization, deployment
//! and operation tracking: components, model instances, deployment states and
//! long-running operations.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use crate::error::{Error, ErrorKind};
use crate::types::InstanceKey;

/// Platform value declared by an ensemble config
pub const ENSEMBLE_PLATFORM: &str = "ensemble";

/// Deployment state of a model instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentState {
    /// Materialized, not loaded in the inference server
    Offline,
    /// A load or unload call is in flight
    Transitioning,
    /// Loaded and serving
    Online,
    /// The last load or unload failed
    Error,
}

impl DeploymentState {
    /// Returns true for the states an instance can rest in
    pub fn is_stable(&self) -> bool {
        !matches!(self, DeploymentState::Transitioning)
    }
}

impl Default for DeploymentState {
    fn default() -> Self {
        DeploymentState::Offline
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentState::Offline => write!(f, "OFFLINE"),
            DeploymentState::Transitioning => write!(f, "TRANSITIONING"),
            DeploymentState::Online => write!(f, "ONLINE"),
            DeploymentState::Error => write!(f, "ERROR"),
        }
    }
}

/// One inference-engine loadable unit discovered in a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    /// Name as authored in the bundle
    pub original_name: String,
    /// Canonical name in the model store
    pub canonical_name: String,
    /// First integer version folder seen for this component
    pub version_number: u64,
    /// Platform, set to "ensemble" for the aggregating component
    pub platform: Option<String>,
    /// Mirrors the owning instance's deployment state
    pub status: DeploymentState,
}

impl Component {
    /// Returns true if this component is the ensemble
    pub fn is_ensemble(&self) -> bool {
        self.platform.as_deref() == Some(ENSEMBLE_PLATFORM)
    }
}

/// Persisted record of one (owner scope, model ID, instance ID) triple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInstance {
    /// Instance identity
    pub key: InstanceKey,
    /// Components materialized for this instance
    pub components: Vec<Component>,
    /// Canonical name of the ensemble component, if one was found
    pub ensemble: Option<String>,
    /// README surfaced by materialization
    pub readme_path: Option<PathBuf>,
    /// Deployment state
    pub state: DeploymentState,
    /// Message of the last failed transition
    pub last_error: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

/// Fields of a [`ModelInstance`] that an update request may set
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InstanceUpdate {
    pub components: Vec<Component>,
    pub ensemble: Option<String>,
    pub readme_path: Option<PathBuf>,
}

impl ModelInstance {
    /// Creates an OFFLINE instance record
    pub fn new(key: InstanceKey, update: InstanceUpdate) -> Self {
        let now = Utc::now();
        let mut instance = Self {
            key,
            components: Vec::new(),
            ensemble: None,
            readme_path: None,
            state: DeploymentState::Offline,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        instance.apply_update(update);
        instance
    }

    /// Copies exactly the settable fields; identity, state and creation time are kept
    pub fn apply_update(&mut self, update: InstanceUpdate) {
        self.components = update.components;
        self.ensemble = update.ensemble;
        self.readme_path = update.readme_path;
        for component in &mut self.components {
            component.status = self.state;
        }
        self.updated_at = Utc::now();
    }

    /// Sets the deployment state on the instance and all its components
    pub fn set_state(&mut self, state: DeploymentState) {
        self.state = state;
        for component in &mut self.components {
            component.status = state;
        }
        if state != DeploymentState::Error {
            self.last_error = None;
        }
        self.updated_at = Utc::now();
    }

    /// Component the inference server is asked to load: the ensemble, or the
    /// only component of a single-component bundle
    pub fn deployment_target(&self) -> Option<&str> {
        match (&self.ensemble, self.components.as_slice()) {
            (Some(ensemble), _) => Some(ensemble.as_str()),
            (None, [only]) => Some(only.canonical_name.as_str()),
            _ => None,
        }
    }
}

/// Kind of a long-running operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Deploy,
    Undeploy,
}

impl OperationKind {
    /// Wire name of the kind
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Deploy => "deploy",
            OperationKind::Undeploy => "undeploy",
        }
    }

    /// Looks a kind up by wire name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "create" => Some(OperationKind::Create),
            "deploy" => Some(OperationKind::Deploy),
            "undeploy" => Some(OperationKind::Undeploy),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result payload of a completed operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationResult {
    /// A model instance was materialized (and possibly deployed)
    Create { instance: ModelInstance },
    /// A deploy finished
    Deploy { instance: InstanceKey, state: DeploymentState },
    /// An undeploy finished
    Undeploy { instance: InstanceKey, state: DeploymentState },
}

/// Error attached to a finished operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: BTreeMap<String, String>,
}

impl From<&Error> for OperationError {
    fn from(err: &Error) -> Self {
        let (message, details) = match err {
            Error::Status { message, details, .. } => (message.clone(), details.clone()),
            other => (other.to_string(), BTreeMap::new()),
        };
        Self {
            kind: err.kind(),
            message,
            details,
        }
    }
}

impl From<Error> for OperationError {
    fn from(err: Error) -> Self {
        OperationError::from(&err)
    }
}

/// Client-visible view of a long-running operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Resource name, `operations/{execution id}`
    pub name: String,
    /// Kind, when it can be recovered from the execution id
    pub kind: Option<OperationKind>,
    /// Whether the operation reached a terminal state
    pub done: bool,
    /// Result when completed successfully
    pub result: Option<OperationResult>,
    /// Error when completed unsuccessfully
    pub error: Option<OperationError>,
}
