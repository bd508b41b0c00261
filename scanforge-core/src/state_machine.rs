//! Legal `Task.status` transitions.
//!
//! This module holds no state; it is a pure predicate plus the metadata-only
//! mutation rule, consulted by [`crate::task_store::TaskStore`] under the
//! single-writer file lock.

use crate::error::{Result, ScanforgeError};
use crate::model::TaskStatus;

/// Returns `Ok(())` if moving from `from` to `to` is legal, else a typed
/// `StateTransitionError`:
///
/// ```text
/// QUEUED  -> RUNNING | FAILED
/// RUNNING -> RUNNING | COMPLETED | FAILED | TIMEOUT
/// COMPLETED, FAILED, TIMEOUT -> (terminal)
/// ```
pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<()> {
    use TaskStatus::*;
    let legal = match (from, to) {
        (Queued, Running) | (Queued, Failed) => true,
        (Running, Running) | (Running, Completed) | (Running, Failed) | (Running, Timeout) => true,
        _ => false,
    };
    if legal {
        Ok(())
    } else {
        Err(ScanforgeError::StateTransition { from, to })
    }
}

/// `RUNNING -> RUNNING` updates may touch `nessus_scan_id`, `progress`, and
/// validation fields, but must never backdate `started_at`.
pub fn is_metadata_only_update(from: TaskStatus, to: TaskStatus) -> bool {
    from == TaskStatus::Running && to == TaskStatus::Running
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    #[test]
    fn queued_can_reach_running_or_failed() {
        assert!(validate_transition(Queued, Running).is_ok());
        assert!(validate_transition(Queued, Failed).is_ok());
        assert!(validate_transition(Queued, Completed).is_err());
        assert!(validate_transition(Queued, Timeout).is_err());
    }

    #[test]
    fn running_can_reach_any_terminal_or_itself() {
        assert!(validate_transition(Running, Running).is_ok());
        assert!(validate_transition(Running, Completed).is_ok());
        assert!(validate_transition(Running, Failed).is_ok());
        assert!(validate_transition(Running, Timeout).is_ok());
    }

    #[test]
    fn terminal_states_never_transition() {
        for terminal in [Completed, Failed, Timeout] {
            for target in [Queued, Running, Completed, Failed, Timeout] {
                assert!(validate_transition(terminal, target).is_err());
            }
        }
    }

    #[test]
    fn no_backward_edges_from_running_to_queued() {
        assert!(validate_transition(Running, Queued).is_err());
    }
}
