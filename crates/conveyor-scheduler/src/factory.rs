//! Plan construction from committed inputs.

use async_trait::async_trait;
use uuid::Uuid;

use conveyor_core::config::{JobConfig, ResourceConfig};
use conveyor_core::plan::{Plan, PlanFactory, PlanStep};
use conveyor_core::version::BuildInput;
use conveyor_core::{Error, Result};

/// Builds step plans: one get per committed input, the job's tasks in
/// template order, then one put per declared output.
///
/// The get steps carry the exact committed versions, so the plan the
/// engine receives can never drift from what was recorded for the build.
pub struct StepPlanFactory;

#[async_trait]
impl PlanFactory for StepPlanFactory {
    async fn create(
        &self,
        job: &JobConfig,
        resources: &[ResourceConfig],
        inputs: &[BuildInput],
    ) -> Result<Plan> {
        let mut steps = Vec::with_capacity(inputs.len() + job.tasks.len() + job.outputs.len());

        for input in inputs {
            if !resources.iter().any(|r| r.name == input.resource) {
                return Err(Error::PlanCreation(format!(
                    "input {} refers to unknown resource {}",
                    input.name, input.resource
                )));
            }
            steps.push(PlanStep::Get {
                name: input.name.clone(),
                resource: input.resource.clone(),
                version: input.version.clone(),
            });
        }

        for task in &job.tasks {
            if !task.config.is_object() {
                return Err(Error::PlanCreation(format!(
                    "task {} has a non-object config",
                    task.name
                )));
            }
            steps.push(PlanStep::Task {
                name: task.name.clone(),
                config: task.config.clone(),
            });
        }

        for output in &job.outputs {
            if !resources.iter().any(|r| r.name == output.resource) {
                return Err(Error::PlanCreation(format!(
                    "output {} refers to unknown resource {}",
                    output.name, output.resource
                )));
            }
            steps.push(PlanStep::Put {
                name: output.name.clone(),
                resource: output.resource.clone(),
                params: output.params.clone(),
            });
        }

        Ok(Plan {
            id: Uuid::now_v7(),
            steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::config::{JobOutput, TaskConfig};
    use conveyor_core::version::Version;

    fn job() -> JobConfig {
        JobConfig {
            name: "package".to_string(),
            inputs: Vec::new(),
            outputs: vec![JobOutput {
                name: "release".to_string(),
                resource: "bucket".to_string(),
                params: serde_json::json!({ "acl": "public" }),
            }],
            tasks: vec![TaskConfig {
                name: "compile".to_string(),
                config: serde_json::json!({ "run": "make" }),
            }],
            max_in_flight: None,
            serial_groups: Vec::new(),
            paused: false,
        }
    }

    fn resources() -> Vec<ResourceConfig> {
        vec![
            ResourceConfig {
                name: "source".to_string(),
                resource_type: "git".to_string(),
                source: serde_json::json!({ "uri": "https://example.com/source.git" }),
            },
            ResourceConfig {
                name: "bucket".to_string(),
                resource_type: "s3".to_string(),
                source: serde_json::json!({ "bucket": "releases" }),
            },
        ]
    }

    fn input(version: &str) -> BuildInput {
        BuildInput {
            name: "src".to_string(),
            resource: "source".to_string(),
            version: [("ref".to_string(), version.to_string())]
                .into_iter()
                .collect::<Version>(),
        }
    }

    #[tokio::test]
    async fn orders_gets_then_tasks_then_puts() {
        let plan = StepPlanFactory
            .create(&job(), &resources(), &[input("abc123")])
            .await
            .unwrap();

        assert_eq!(plan.steps.len(), 3);
        assert!(matches!(&plan.steps[0], PlanStep::Get { name, .. } if name == "src"));
        assert!(matches!(&plan.steps[1], PlanStep::Task { name, .. } if name == "compile"));
        assert!(matches!(&plan.steps[2], PlanStep::Put { name, .. } if name == "release"));
    }

    #[tokio::test]
    async fn get_steps_carry_the_committed_version() {
        let committed = input("abc123");
        let plan = StepPlanFactory
            .create(&job(), &resources(), &[committed.clone()])
            .await
            .unwrap();

        match &plan.steps[0] {
            PlanStep::Get { version, .. } => assert_eq!(version, &committed.version),
            other => panic!("expected a get step, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_inputs_for_unknown_resources() {
        let mut orphan = input("abc123");
        orphan.resource = "nowhere".to_string();

        let result = StepPlanFactory.create(&job(), &resources(), &[orphan]).await;
        assert!(matches!(result, Err(Error::PlanCreation(_))));
    }

    #[tokio::test]
    async fn rejects_non_object_task_configs() {
        let mut job = job();
        job.tasks[0].config = serde_json::json!("make");

        let result = StepPlanFactory.create(&job, &resources(), &[]).await;
        assert!(matches!(result, Err(Error::PlanCreation(_))));
    }
}
