use std::fmt;

use serde::Serialize;
use utoipa::ToSchema;

use crate::errors::LifecycleError;

/// Registration state of this process with the discovery registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Unregistered,
    Registering,
    Registered,
    Deregistering,
    Deregistered,
}

impl LifecycleState {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Registering -> Deregistering` covers a shutdown that arrives before
    /// the registry acknowledged the registration.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Unregistered, Registering)
                | (Registering, Registered)
                | (Registering, Deregistering)
                | (Registered, Deregistering)
                | (Deregistering, Deregistered)
        )
    }

    pub fn transition(self, next: LifecycleState) -> Result<LifecycleState, LifecycleError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(LifecycleError::IllegalTransition { from: self, to: next })
        }
    }

    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Deregistered
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Unregistered => "UNREGISTERED",
            LifecycleState::Registering => "REGISTERING",
            LifecycleState::Registered => "REGISTERED",
            LifecycleState::Deregistering => "DEREGISTERING",
            LifecycleState::Deregistered => "DEREGISTERED",
        })
    }
}
