use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// The placeholder resource guarded by the auth gate.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Counter {
    pub value: i64,
    pub last_updated: DateTime<Utc>,
    pub description: Option<String>,
}

impl Counter {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            value: 0,
            last_updated: Utc::now(),
            description: Some(description.into()),
        }
    }

    pub fn increment(&mut self) -> i64 {
        self.value = self.value.saturating_add(1);
        self.last_updated = Utc::now();
        self.value
    }

    pub fn reset(&mut self) -> i64 {
        self.value = 0;
        self.last_updated = Utc::now();
        self.value
    }
}
