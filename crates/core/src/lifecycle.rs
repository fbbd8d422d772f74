//! Per-request lifecycle state machine.
//!
//! ```text
//! Received -> Validating -> Rejected | Admitted
//! Admitted -> CacheCheck -> CacheHit | RateLimitCheck     (outbound)
//! RateLimitCheck -> Throttled | Executing
//! Admitted -> Executing                                   (local)
//! Executing -> Completed | Failed
//! CacheHit -> Completed
//! Rejected | Throttled | Completed | Failed -> Audited
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Received,
    Validating,
    Rejected,
    Admitted,
    CacheCheck,
    CacheHit,
    RateLimitCheck,
    Throttled,
    Executing,
    Completed,
    Failed,
    Audited,
}

impl GateState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GateState::Rejected | GateState::Throttled | GateState::Completed | GateState::Failed
        )
    }

    fn can_move_to(&self, next: GateState) -> bool {
        use GateState::*;
        match (self, next) {
            (Received, Validating) => true,
            (Validating, Rejected | Admitted) => true,
            (Admitted, CacheCheck | Executing | RateLimitCheck) => true,
            (CacheCheck, CacheHit | RateLimitCheck) => true,
            (CacheHit, Completed) => true,
            (RateLimitCheck, Throttled | Executing) => true,
            (Executing, Completed | Failed) => true,
            (s, Audited) => s.is_terminal(),
            _ => false,
        }
    }
}

/// Error returned for a transition the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Illegal lifecycle transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: GateState,
    pub to: GateState,
}

/// Records every state a request passes through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    states: Vec<GateState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            states: vec![GateState::Received],
        }
    }

    pub fn current(&self) -> GateState {
        self.states
            .last()
            .copied()
            .unwrap_or(GateState::Received)
    }

    pub fn advance(&mut self, next: GateState) -> Result<(), IllegalTransition> {
        let from = self.current();
        if !from.can_move_to(next) {
            return Err(IllegalTransition { from, to: next });
        }
        tracing::trace!(?from, to = ?next, "lifecycle transition");
        self.states.push(next);
        Ok(())
    }

    /// The terminal state reached before auditing, if any.
    pub fn terminal(&self) -> Option<GateState> {
        self.states.iter().rev().find(|s| s.is_terminal()).copied()
    }

    pub fn states(&self) -> &[GateState] {
        &self.states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use GateState::*;

    fn walk(path: &[GateState]) -> Result<Lifecycle, IllegalTransition> {
        let mut lc = Lifecycle::new();
        for s in path {
            lc.advance(*s)?;
        }
        Ok(lc)
    }

    #[test]
    fn local_operation_path() {
        let lc = walk(&[Validating, Admitted, Executing, Completed, Audited]).unwrap();
        assert_eq!(lc.terminal(), Some(Completed));
        assert_eq!(lc.current(), Audited);
    }

    #[test]
    fn outbound_cache_hit_path() {
        let lc = walk(&[Validating, Admitted, CacheCheck, CacheHit, Completed, Audited]).unwrap();
        assert_eq!(lc.states().len(), 7);
    }

    #[test]
    fn outbound_throttled_path() {
        let lc = walk(&[Validating, Admitted, CacheCheck, RateLimitCheck, Throttled, Audited])
            .unwrap();
        assert_eq!(lc.terminal(), Some(Throttled));
    }

    #[test]
    fn rejected_cannot_execute() {
        let err = walk(&[Validating, Rejected, Executing]).unwrap_err();
        assert_eq!(err.from, Rejected);
        assert_eq!(err.to, Executing);
    }

    #[test]
    fn audit_requires_terminal_state() {
        assert!(walk(&[Validating, Audited]).is_err());
        assert!(walk(&[Validating, Admitted, Executing, Audited]).is_err());
    }
}
