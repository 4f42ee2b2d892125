//! Recurring per-connector jobs and their executions.
//!
//! The clock lives in the external workflow runtime; these are read models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::id::{ConnectorId, InstanceId, ScheduleId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub connector_id: ConnectorId,
    pub name: String,
    pub interval_secs: u64,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    /// Schedules are named per connector, so re-registering one is idempotent.
    pub fn for_connector(connector_id: ConnectorId, name: impl Into<String>, interval_secs: u64) -> Self {
        let name = name.into();
        Self {
            id: ScheduleId::new(format!("{name}-{connector_id}")),
            connector_id,
            name,
            interval_secs,
            created_at: Utc::now(),
        }
    }
}

impl Entity for Schedule {
    type Id = ScheduleId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// One execution record of a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub schedule_id: ScheduleId,
    pub connector_id: ConnectorId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub terminated: bool,
    pub terminated_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Instance {
    pub fn started(id: InstanceId, schedule: &Schedule) -> Self {
        let now = Utc::now();
        Self {
            id,
            schedule_id: schedule.id.clone(),
            connector_id: schedule.connector_id.clone(),
            created_at: now,
            updated_at: now,
            terminated: false,
            terminated_at: None,
            error: None,
        }
    }

    pub fn terminate(&mut self, error: Option<String>) {
        let now = Utc::now();
        self.terminated = true;
        self.terminated_at = Some(now);
        self.updated_at = now;
        self.error = error;
    }
}

impl Entity for Instance {
    type Id = InstanceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
