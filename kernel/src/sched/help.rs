//! Help states of SMP scheduler nodes

use crate::error::{SchedError, SchedResult};

/// How a node takes part in resource helping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HelpState {
    /// No helping; the node only ever runs its owner.
    #[default]
    Yourself,
    /// Owner holds a helping resource. The node stays on its processor with
    /// an idle thread while the owner is blocked.
    ActiveOwner,
    /// Owner is ready and spinning for a resource; the node may be lent to
    /// the resource owner.
    ActiveRival,
    /// Owner is blocked waiting for a resource.
    Passive,
}

impl HelpState {
    /// Edges of the help-state graph.
    ///
    /// An active owner only returns to `Yourself`; it is never demoted to a
    /// rival or passive waiter directly.
    pub fn can_transition(self, to: HelpState) -> bool {
        use HelpState::*;
        match (self, to) {
            (from, to) if from == to => true,
            (Yourself, _) => true,
            (ActiveRival, ActiveOwner | Passive | Yourself) => true,
            (Passive, ActiveOwner | ActiveRival | Yourself) => true,
            (ActiveOwner, Yourself) => true,
            _ => false,
        }
    }

    /// Validate a transition without applying it.
    pub fn check_transition(self, to: HelpState) -> SchedResult<()> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(SchedError::InvalidHelpTransition { from: self, to })
        }
    }

    /// Node keeps its processor with an idle thread when its owner blocks.
    pub fn is_sticky(self) -> bool {
        self == HelpState::ActiveOwner
    }

    /// Node may be lent to another thread.
    pub fn may_lend(self) -> bool {
        self == HelpState::ActiveRival
    }
}
