//! Human review of decisions that require approval.

use agent_policy::{DecisionInput, Evaluation};
use async_trait::async_trait;

/// Outcome of a human review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalVerdict {
    /// The reviewer allowed the action.
    Approved {
        /// Who approved, or why.
        note: String,
    },
    /// The reviewer rejected the action.
    Rejected {
        /// Reason recorded in the decision log.
        reason: String,
    },
}

impl ApprovalVerdict {
    /// Returns `true` for [`ApprovalVerdict::Approved`].
    #[must_use]
    pub const fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }
}

/// Consulted when the policy evaluator holds an action for review.
///
/// Without a handler such actions are denied.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Reviews `input`, which `evaluation` marked as requiring approval.
    async fn review(&self, input: &DecisionInput, evaluation: &Evaluation) -> ApprovalVerdict;
}

/// Handler that approves everything, for development setups.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalHandler for AutoApprove {
    async fn review(&self, _input: &DecisionInput, _evaluation: &Evaluation) -> ApprovalVerdict {
        ApprovalVerdict::Approved {
            note: "auto-approved".to_owned(),
        }
    }
}
