//! Pull-based agent dispatch for single-process deployments.
//!
//! Without a message broker, dispatched jobs wait in a per-platform queue
//! until an agent claims them over HTTP. Queueing is the acknowledgement.

use async_trait::async_trait;
use stagehand_core::Result;
use stagehand_core::ids::JobInstanceId;
use stagehand_core::pipeline::Platform;
use stagehand_core::ports::{Ack, AgentDispatch, DispatchRequest};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Default)]
pub struct QueueDispatch {
    queues: Mutex<HashMap<Platform, VecDeque<DispatchRequest>>>,
}

impl QueueDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the oldest queued job for a platform.
    pub fn claim(&self, platform: Platform) -> Option<DispatchRequest> {
        let request = self.lock().get_mut(&platform)?.pop_front();
        if let Some(request) = &request {
            info!(
                job_instance_id = %request.job_instance.id,
                platform = %platform,
                "Job claimed"
            );
        }
        request
    }

    pub fn pending(&self, platform: Platform) -> usize {
        self.lock().get(&platform).map(VecDeque::len).unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Platform, VecDeque<DispatchRequest>>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl AgentDispatch for QueueDispatch {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<Ack> {
        let platform = request.job.platform;
        let mut queues = self.lock();
        let queue = queues.entry(platform).or_default();
        // Redelivery after a lost ack must not queue the job twice.
        if !queue
            .iter()
            .any(|r| r.job_instance.id == request.job_instance.id)
        {
            queue.push_back(request.clone());
        }
        debug!(
            job_instance_id = %request.job_instance.id,
            platform = %platform,
            depth = queue.len(),
            "Job queued"
        );
        Ok(Ack::accepted("queue"))
    }

    async fn cancel(&self, job_instance_id: JobInstanceId) -> Result<()> {
        for queue in self.lock().values_mut() {
            queue.retain(|r| r.job_instance.id != job_instance_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::ids::{JobId, PipelineId, PipelineInstanceId, StageId};
    use stagehand_core::instance::JobInstance;
    use stagehand_core::pipeline::JobDefinition;

    fn request(platform: Platform) -> DispatchRequest {
        DispatchRequest {
            job_instance: JobInstance::new(
                PipelineId::new(),
                PipelineInstanceId::new(),
                StageId::new("build"),
                JobId::new("compile"),
            ),
            job: JobDefinition {
                id: JobId::new("compile"),
                label: None,
                order: 0,
                task_groups: vec![],
                platform,
            },
            sources: vec![],
        }
    }

    #[tokio::test]
    async fn test_claim_in_fifo_order_per_platform() {
        let queue = QueueDispatch::new();
        let first = request(Platform::Docker);
        let second = request(Platform::Docker);
        let shell = request(Platform::Shell);

        for r in [&first, &second, &shell, &first] {
            assert!(queue.dispatch(r).await.unwrap().accepted);
        }
        assert_eq!(queue.pending(Platform::Docker), 2);

        assert_eq!(
            queue.claim(Platform::Docker).unwrap().job_instance.id,
            first.job_instance.id
        );
        assert_eq!(
            queue.claim(Platform::Docker).unwrap().job_instance.id,
            second.job_instance.id
        );
        assert!(queue.claim(Platform::Docker).is_none());
        assert!(queue.claim(Platform::Kubernetes).is_none());
        assert_eq!(queue.pending(Platform::Shell), 1);
    }

    #[tokio::test]
    async fn test_cancel_removes_queued_job() {
        let queue = QueueDispatch::new();
        let r = request(Platform::Docker);
        queue.dispatch(&r).await.unwrap();

        queue.cancel(r.job_instance.id).await.unwrap();
        assert!(queue.claim(Platform::Docker).is_none());
    }
}
