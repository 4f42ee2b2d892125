//! Read side of connector schedules, plus the hooks the workflow runtime
//! uses to run them and report executions.

use tracing::{info, instrument};

use paybridge_core::{ConnectorId, Instance, Schedule, ScheduleId};

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::storage::{Page, Pagination};
use crate::workflow::WorkflowTrigger;

impl Engine {
    pub async fn schedules_get(&self, id: &ScheduleId) -> EngineResult<Schedule> {
        self.storage()
            .schedules_get(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("schedule {id}")))
    }

    pub async fn schedules_list(
        &self,
        connector_id: Option<&ConnectorId>,
        pagination: Pagination,
    ) -> EngineResult<Page<Schedule>> {
        Ok(self.storage().schedules_list(connector_id, pagination).await?)
    }

    pub async fn instances_list(
        &self,
        schedule_id: Option<&ScheduleId>,
        pagination: Pagination,
    ) -> EngineResult<Page<Instance>> {
        Ok(self.storage().instances_list(schedule_id, pagination).await?)
    }

    /// Ask the runtime to run a schedule now.
    #[instrument(skip_all, fields(schedule_id = %id), err)]
    pub async fn schedules_trigger(&self, id: &ScheduleId) -> EngineResult<()> {
        let schedule = self.schedules_get(id).await?;
        self.registry().get(&schedule.connector_id).await?;

        self.trigger(WorkflowTrigger::RunSchedule {
            schedule_id: schedule.id,
        })
        .await?;
        info!("schedule triggered");
        Ok(())
    }

    /// Record an execution reported by the runtime.
    #[instrument(skip_all, fields(schedule_id = %instance.schedule_id, instance_id = %instance.id), err)]
    pub async fn instances_record(&self, instance: Instance) -> EngineResult<()> {
        self.storage().instances_upsert(instance).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use paybridge_core::{CapabilitySet, InstanceId};

    #[tokio::test]
    async fn installed_schedules_can_be_triggered_and_recorded() {
        let harness = testing::harness(CapabilitySet::empty()).await;
        let schedules = harness
            .engine
            .schedules_list(Some(&harness.connector), Pagination::default())
            .await
            .unwrap();
        assert_eq!(schedules.total, 2);
        let schedule = schedules.items[0].clone();

        harness.engine.schedules_trigger(&schedule.id).await.unwrap();
        assert!(harness.runtime.triggers().contains(&WorkflowTrigger::RunSchedule {
            schedule_id: schedule.id.clone()
        }));

        let mut instance = Instance::started(InstanceId::new("run-1"), &schedule);
        harness.engine.instances_record(instance.clone()).await.unwrap();
        instance.terminate(Some("rate limited".into()));
        harness.engine.instances_record(instance).await.unwrap();

        let instances = harness
            .engine
            .instances_list(Some(&schedule.id), Pagination::default())
            .await
            .unwrap();
        assert_eq!(instances.total, 1);
        assert!(instances.items[0].terminated);
        assert_eq!(instances.items[0].error.as_deref(), Some("rate limited"));
    }

    #[tokio::test]
    async fn unknown_schedule_is_not_found() {
        let harness = testing::harness(CapabilitySet::empty()).await;
        let missing = ScheduleId::new("missing");
        assert!(matches!(
            harness.engine.schedules_trigger(&missing).await,
            Err(EngineError::NotFound(_))
        ));

        let orphan = Schedule::for_connector(harness.connector.clone(), "orphan", 60);
        let instance = Instance::started(InstanceId::new("run-1"), &orphan);
        assert!(matches!(
            harness.engine.instances_record(instance).await,
            Err(EngineError::NotFound(_))
        ));
    }
}
