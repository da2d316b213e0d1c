//! Saga status state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The status of an activation saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Scheduled ──► Checking ──┬──► Delivered
///     │             │      └──► Expired ──┬──────────────► Refunded
///     │             │                     └──► Cancelling ──┘
///     └─────────────┴────────────────────────► Cancelling
/// ```
///
/// Statuses are ranked so that every legal transition strictly increases
/// the rank; a saga never revisits an earlier status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaStatus {
    /// Waiting for the due timestamp.
    #[default]
    Scheduled,

    /// The provider status query is in progress.
    Checking,

    /// The code was delivered (terminal state).
    Delivered,

    /// The code was not delivered in time; compensation follows.
    Expired,

    /// A manual cancel won the race; compensation follows.
    Cancelling,

    /// The reserved amount was refunded (terminal state).
    Refunded,
}

impl SagaStatus {
    /// Statuses from which a manual cancel may start compensation.
    pub const CANCELLABLE: [SagaStatus; 2] = [SagaStatus::Scheduled, SagaStatus::Checking];

    /// Statuses from which the refund transition may be taken.
    pub const COMPENSABLE: [SagaStatus; 2] = [SagaStatus::Expired, SagaStatus::Cancelling];

    /// Non-terminal statuses that are only held while an executor is running.
    pub const IN_FLIGHT: [SagaStatus; 3] = [
        SagaStatus::Checking,
        SagaStatus::Expired,
        SagaStatus::Cancelling,
    ];

    /// Position of the status along the transition graph.
    pub fn rank(&self) -> u8 {
        match self {
            SagaStatus::Scheduled => 0,
            SagaStatus::Checking => 1,
            SagaStatus::Delivered | SagaStatus::Expired => 2,
            SagaStatus::Cancelling => 3,
            SagaStatus::Refunded => 4,
        }
    }

    /// Returns true if `next` is a direct successor of this status.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        matches!(
            (self, next),
            (Scheduled, Checking)
                | (Scheduled, Cancelling)
                | (Checking, Delivered)
                | (Checking, Expired)
                | (Checking, Cancelling)
                | (Expired, Cancelling)
                | (Expired, Refunded)
                | (Cancelling, Refunded)
        )
    }

    /// Validates the edge `self -> next`.
    pub fn ensure_transition(&self, next: SagaStatus) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }

    /// Returns true if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Delivered | SagaStatus::Refunded)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Scheduled => "Scheduled",
            SagaStatus::Checking => "Checking",
            SagaStatus::Delivered => "Delivered",
            SagaStatus::Expired => "Expired",
            SagaStatus::Cancelling => "Cancelling",
            SagaStatus::Refunded => "Refunded",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SagaStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Scheduled" => Ok(SagaStatus::Scheduled),
            "Checking" => Ok(SagaStatus::Checking),
            "Delivered" => Ok(SagaStatus::Delivered),
            "Expired" => Ok(SagaStatus::Expired),
            "Cancelling" => Ok(SagaStatus::Cancelling),
            "Refunded" => Ok(SagaStatus::Refunded),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SagaStatus; 6] = [
        SagaStatus::Scheduled,
        SagaStatus::Checking,
        SagaStatus::Delivered,
        SagaStatus::Expired,
        SagaStatus::Cancelling,
        SagaStatus::Refunded,
    ];

    #[test]
    fn test_default_status_is_scheduled() {
        assert_eq!(SagaStatus::default(), SagaStatus::Scheduled);
    }

    #[test]
    fn test_every_edge_increases_rank() {
        for from in ALL {
            for to in ALL {
                if from.can_transition_to(to) {
                    assert!(to.rank() > from.rank(), "{from} -> {to} must move forward");
                }
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_successors() {
        for from in ALL.into_iter().filter(SagaStatus::is_terminal) {
            assert!(ALL.iter().all(|to| !from.can_transition_to(*to)));
        }
    }

    #[test]
    fn test_manual_cancel_edges() {
        assert!(SagaStatus::Scheduled.can_transition_to(SagaStatus::Cancelling));
        assert!(SagaStatus::Checking.can_transition_to(SagaStatus::Cancelling));
        assert!(!SagaStatus::Delivered.can_transition_to(SagaStatus::Cancelling));
        assert!(!SagaStatus::Refunded.can_transition_to(SagaStatus::Cancelling));
    }

    #[test]
    fn test_refund_only_from_compensable() {
        for from in ALL {
            assert_eq!(
                from.can_transition_to(SagaStatus::Refunded),
                SagaStatus::COMPENSABLE.contains(&from)
            );
        }
    }

    #[test]
    fn test_ensure_transition_rejects_regression() {
        let err = SagaStatus::Expired
            .ensure_transition(SagaStatus::Checking)
            .unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition {
                from: SagaStatus::Expired,
                to: SagaStatus::Checking
            }
        );
    }

    #[test]
    fn test_string_roundtrip() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<SagaStatus>().unwrap(), status);
        }
        assert!("Pending".parse::<SagaStatus>().is_err());
    }
}
