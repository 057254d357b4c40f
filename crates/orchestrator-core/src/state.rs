//! Deployment state transitions
//!
//! This module describes which transitions a model instance may start from
//! each [`DeploymentState`] and where each transition ends.

use std::fmt;

use common::models::DeploymentState;

/// A controller-driven change of deployment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Load the deployment target
    Deploy,

    /// Unload every component
    Undeploy,
}

impl Transition {
    /// Returns true if the transition may start from `state`
    ///
    /// ERROR is accepted by both, which is how an instance leaves it.
    pub fn can_start_from(&self, state: DeploymentState) -> bool {
        match self {
            Transition::Deploy => matches!(state, DeploymentState::Offline | DeploymentState::Error),
            Transition::Undeploy => matches!(state, DeploymentState::Online | DeploymentState::Error),
        }
    }

    /// State reached when the server call succeeds
    pub fn target(&self) -> DeploymentState {
        match self {
            Transition::Deploy => DeploymentState::Online,
            Transition::Undeploy => DeploymentState::Offline,
        }
    }

    /// State restored when the transition is cancelled
    pub fn cancelled(&self) -> DeploymentState {
        match self {
            Transition::Deploy => DeploymentState::Offline,
            Transition::Undeploy => DeploymentState::Online,
        }
    }

    /// Precondition wording for error messages
    pub fn expected(&self) -> &'static str {
        match self {
            Transition::Deploy => "OFFLINE or ERROR",
            Transition::Undeploy => "ONLINE or ERROR",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Deploy => write!(f, "deploy"),
            Transition::Undeploy => write!(f, "undeploy"),
        }
    }
}

/// States directly reachable from `state`
///
/// TRANSITIONING leads to the target, the cancellation state or ERROR of
/// either transition; reconciliation only ever picks ONLINE or OFFLINE.
pub fn successors(state: DeploymentState) -> Vec<DeploymentState> {
    match state {
        DeploymentState::Transitioning => vec![
            DeploymentState::Online,
            DeploymentState::Offline,
            DeploymentState::Error,
        ],
        stable => {
            if [Transition::Deploy, Transition::Undeploy]
                .iter()
                .any(|t| t.can_start_from(stable))
            {
                vec![DeploymentState::Transitioning]
            } else {
                Vec::new()
            }
        }
    }
}
