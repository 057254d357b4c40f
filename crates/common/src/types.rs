//! Common types for Model Hub
//!
//! Canonical component names and instance keys. A canonical name is the
//! identifier under which a component lives in the shared model store and is
//! known to the inference server:
//! `{owner_scope}#{model_id}#{component}#{instance_id}`.

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Separator between the four parts of a canonical name
pub const NAME_SEPARATOR: char = '#';

/// Checks a single name part: non-empty, no separator, no path syntax
pub fn validate_name_part(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidArgument(format!("{} cannot be empty", field)));
    }
    if value == "." || value == ".." {
        return Err(Error::InvalidArgument(format!("{} cannot be '{}'", field, value)));
    }
    if let Some(c) = value.chars().find(|c| matches!(c, '#' | '/' | '\\')) {
        return Err(Error::InvalidArgument(format!(
            "{} '{}' contains reserved character '{}'",
            field, value, c
        )));
    }
    Ok(())
}

/// Globally unique name of a component in the model store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalName {
    /// Owner scope (user or organization)
    pub owner_scope: String,
    /// Model ID
    pub model_id: String,
    /// Component name as authored in the bundle
    pub component: String,
    /// Instance or version ID
    pub instance_id: String,
}

impl CanonicalName {
    /// Creates a canonical name after validating every part
    pub fn new(owner_scope: &str, model_id: &str, component: &str, instance_id: &str) -> Result<Self> {
        validate_name_part("owner scope", owner_scope)?;
        validate_name_part("model ID", model_id)?;
        validate_name_part("component name", component)?;
        validate_name_part("instance ID", instance_id)?;

        Ok(Self {
            owner_scope: owner_scope.to_string(),
            model_id: model_id.to_string(),
            component: component.to_string(),
            instance_id: instance_id.to_string(),
        })
    }

    /// Instance this component belongs to
    pub fn instance_key(&self) -> InstanceKey {
        InstanceKey {
            owner_scope: self.owner_scope.clone(),
            model_id: self.model_id.clone(),
            instance_id: self.instance_id.clone(),
        }
    }
}

impl fmt::Display for CanonicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}{sep}{}",
            self.owner_scope,
            self.model_id,
            self.component,
            self.instance_id,
            sep = NAME_SEPARATOR
        )
    }
}

impl FromStr for CanonicalName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(NAME_SEPARATOR).collect();
        match parts.as_slice() {
            [owner, model, component, instance] => Self::new(owner, model, component, instance),
            _ => Err(Error::InvalidArgument(format!(
                "canonical name '{}' must have exactly four '{}'-separated parts",
                s, NAME_SEPARATOR
            ))),
        }
    }
}

/// Identity of one deployable model instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    /// Owner scope (user or organization)
    pub owner_scope: String,
    /// Model ID
    pub model_id: String,
    /// Instance or version ID
    pub instance_id: String,
}

impl InstanceKey {
    /// Creates an instance key after validating every part
    pub fn new(owner_scope: &str, model_id: &str, instance_id: &str) -> Result<Self> {
        validate_name_part("owner scope", owner_scope)?;
        validate_name_part("model ID", model_id)?;
        validate_name_part("instance ID", instance_id)?;

        Ok(Self {
            owner_scope: owner_scope.to_string(),
            model_id: model_id.to_string(),
            instance_id: instance_id.to_string(),
        })
    }

    /// Canonical name of a component of this instance
    pub fn component_name(&self, component: &str) -> Result<CanonicalName> {
        CanonicalName::new(&self.owner_scope, &self.model_id, component, &self.instance_id)
    }

    /// Stable key used for persisted records
    pub fn record_key(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.owner_scope,
            self.model_id,
            self.instance_id,
            sep = NAME_SEPARATOR
        )
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owner_scope, self.model_id, self.instance_id)
    }
}
