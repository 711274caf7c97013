//! Queue dispatcher: feeds queued ideas to the deployment pipeline.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::deploy::{DeployRequest, DeploymentPipeline};
use crate::fleet::FleetController;
use crate::queue::{Task, TaskQueue, TaskResult, TaskStatus};

/// Run up to `max_concurrent` pipeline turns until `shutdown` fires.
///
/// A permit is taken before a task is dequeued, so tasks stay `pending`
/// (and visible as such) while every slot is busy.
pub(crate) fn spawn_dispatcher(
    queue: Arc<TaskQueue>,
    pipeline: Arc<DeploymentPipeline>,
    fleet: FleetController,
    max_concurrent: usize,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        info!(max_concurrent, "task dispatcher started");

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let task = tokio::select! {
                _ = shutdown.cancelled() => break,
                task = queue.next() => task,
            };

            let queue = queue.clone();
            let pipeline = pipeline.clone();
            let fleet = fleet.clone();
            tokio::spawn(async move {
                let _permit = permit; // Hold until complete
                run_task(&queue, &pipeline, &fleet, task).await;
            });
        }

        debug!("task dispatcher stopped");
    })
}

async fn run_task(queue: &TaskQueue, pipeline: &DeploymentPipeline, fleet: &FleetController, task: Task) {
    let task_id = task.task_id.clone();
    let request = DeployRequest {
        task_id: task.task_id,
        idea: task.idea,
    };

    match pipeline.deploy(request).await {
        Ok(outcome) => {
            queue.complete(
                &task_id,
                TaskResult {
                    app_id: outcome.app_id.clone(),
                    revision: outcome.revision,
                    summary: outcome.summary,
                },
            );
            if outcome.created {
                fleet.app_created(&outcome.app_id).await;
            }
        }
        Err(e) => {
            if queue.fail(&task_id, &e) == Some(TaskStatus::Pending) {
                debug!(task_id = %task_id, "task requeued");
            }
        }
    }
}
