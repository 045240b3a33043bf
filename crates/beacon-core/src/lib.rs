pub mod auth;
pub mod counter;
pub mod errors;
pub mod health;
pub mod instance;
pub mod lifecycle;
pub mod time;

pub use auth::{AuthDecision, AuthMethod, Principal, RequiredMethods, RoleRequirement, RoutePolicy, TokenGrants};
pub use counter::Counter;
pub use errors::{GrantError, LifecycleError, PolicyParseError};
pub use health::HealthStatus;
pub use instance::{InstanceStatus, ServiceInstance};
pub use lifecycle::LifecycleState;
