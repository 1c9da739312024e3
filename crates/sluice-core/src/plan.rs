//! Switch participants and the plan distributed when a switch begins.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SignalError;

/// The protocol role a node plays during one switch.
///
/// All four roles run the same algorithm skeleton; the role selects
/// which hooks fire and which signals the node reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchRole {
    /// The upstream node feeding records into the switching stage.
    Preceding,
    /// The operator instance being replaced.
    OriginalIntermediary,
    /// The replacement operator instance; it owns the replay decision.
    TargetIntermediary,
    /// A downstream consumer of the switching stage's output.
    EndNode,
}

impl fmt::Display for SwitchRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preceding => write!(f, "preceding"),
            Self::OriginalIntermediary => write!(f, "original-intermediary"),
            Self::TargetIntermediary => write!(f, "target-intermediary"),
            Self::EndNode => write!(f, "end-node"),
        }
    }
}

/// The five logical node names taking part in a switch.
///
/// Resolved once per switch by the adaptation layer and read-only
/// afterwards. The original and target end nodes may name the same
/// physical consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleIdentity {
    /// Upstream node feeding the switching stage.
    pub preceding: String,
    /// Operator instance being replaced.
    pub original_intermediary: String,
    /// Replacement operator instance.
    pub target_intermediary: String,
    /// Consumer of the original instance's output.
    pub original_end: String,
    /// Consumer of the target instance's output.
    pub target_end: String,
}

impl RoleIdentity {
    /// Resolves the protocol role `node` plays in this switch, if any.
    #[must_use]
    pub fn role_of(&self, node: &str) -> Option<SwitchRole> {
        if node == self.preceding {
            Some(SwitchRole::Preceding)
        } else if node == self.original_intermediary {
            Some(SwitchRole::OriginalIntermediary)
        } else if node == self.target_intermediary {
            Some(SwitchRole::TargetIntermediary)
        } else if node == self.original_end || node == self.target_end {
            Some(SwitchRole::EndNode)
        } else {
            None
        }
    }
}

/// The plan the adaptation layer broadcasts to every involved node when
/// it decides to switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchPlan {
    /// The pipeline the switch happens in.
    pub pipeline: String,
    /// Who plays which role.
    pub roles: RoleIdentity,
    /// Port of the target instance's transfer receiver.
    pub transfer_port: u16,
}

impl SwitchPlan {
    /// Encodes the plan as the switch-request signal payload.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Payload`] if JSON encoding fails.
    pub fn to_payload(&self) -> Result<Vec<u8>, SignalError> {
        serde_json::to_vec(self).map_err(|e| SignalError::Payload {
            signal: "SwitchRequested".to_string(),
            reason: e.to_string(),
        })
    }

    /// Decodes a plan from a switch-request signal payload.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::Payload`] if the bytes are not a valid
    /// JSON plan.
    pub fn from_payload(payload: &[u8]) -> Result<Self, SignalError> {
        serde_json::from_slice(payload).map_err(|e| SignalError::Payload {
            signal: "SwitchRequested".to_string(),
            reason: e.to_string(),
        })
    }
}
