use crate::lifecycle::LifecycleState;

/// Domain errors for the beacon core
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("illegal lifecycle transition {from} -> {to}")]
    IllegalTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("registration gave up after {attempts} attempts")]
    RegistrationExhausted { attempts: u32 },
}

/// Why a verified token was still not accepted for a route.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GrantError {
    #[error("token lacks required scope {0}")]
    MissingScope(String),

    #[error("token lacks required realm role {0}")]
    MissingRealmRole(String),

    #[error("token lacks required role {role} for client {client}")]
    MissingClientRole { client: String, role: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown route policy '{0}', expected one of: any, certificate, token, none")]
pub struct PolicyParseError(pub String);
