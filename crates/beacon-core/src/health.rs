use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

impl HealthStatus {
    pub fn from_accepting(accepting: bool) -> Self {
        if accepting { HealthStatus::Up } else { HealthStatus::Down }
    }

    pub fn is_up(self) -> bool {
        self == HealthStatus::Up
    }
}
