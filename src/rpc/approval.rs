//! Tool-call approval policy.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::ToolCallUpdate;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Approve every tool call
    Auto,
    /// Approve kinds in the safelist, reject the rest (default)
    #[default]
    Selective,
    /// Ask an external approver for every call
    Manual,
}

impl std::fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalMode::Auto => write!(f, "auto"),
            ApprovalMode::Selective => write!(f, "selective"),
            ApprovalMode::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for ApprovalMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(ApprovalMode::Auto),
            "selective" => Ok(ApprovalMode::Selective),
            "manual" => Ok(ApprovalMode::Manual),
            _ => anyhow::bail!(
                "Invalid approval mode '{}'. Valid values: auto, selective, manual",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Reject,
    /// Needs an external approver.
    Escalate,
}

#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    pub mode: ApprovalMode,
    pub safelist: HashSet<String>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self::new(ApprovalMode::default(), ["edit".to_string()])
    }
}

impl ApprovalPolicy {
    pub fn new(mode: ApprovalMode, safelist: impl IntoIterator<Item = String>) -> Self {
        Self {
            mode,
            safelist: safelist.into_iter().collect(),
        }
    }

    pub fn decide(&self, kind: &str) -> ApprovalDecision {
        match self.mode {
            ApprovalMode::Auto => ApprovalDecision::Approve,
            ApprovalMode::Selective if self.safelist.contains(kind) => ApprovalDecision::Approve,
            ApprovalMode::Selective => ApprovalDecision::Reject,
            ApprovalMode::Manual => ApprovalDecision::Escalate,
        }
    }
}

/// External approver consulted in manual mode. Returns `true` to approve.
#[async_trait]
pub trait ToolApprover: Send + Sync {
    async fn approve(&self, app_id: &str, call: &ToolCallUpdate) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse_and_display() {
        assert_eq!("AUTO".parse::<ApprovalMode>().unwrap(), ApprovalMode::Auto);
        assert_eq!(ApprovalMode::Manual.to_string(), "manual");
        assert!("sometimes".parse::<ApprovalMode>().is_err());
    }

    #[test]
    fn test_selective_uses_safelist() {
        let policy = ApprovalPolicy::default();
        assert_eq!(policy.decide("edit"), ApprovalDecision::Approve);
        assert_eq!(policy.decide("execute"), ApprovalDecision::Reject);
    }

    #[test]
    fn test_auto_and_manual() {
        let auto = ApprovalPolicy::new(ApprovalMode::Auto, []);
        assert_eq!(auto.decide("delete"), ApprovalDecision::Approve);
        let manual = ApprovalPolicy::new(ApprovalMode::Manual, ["edit".to_string()]);
        assert_eq!(manual.decide("edit"), ApprovalDecision::Escalate);
    }
}
