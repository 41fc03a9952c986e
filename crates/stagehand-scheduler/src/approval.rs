//! Per-stage approval gates.
//!
//! Each (pipeline instance, stage) pair with `required_approvals > 0` gets its
//! own gate behind its own mutex, so concurrent approvers of one stage are
//! serialized without touching other stages or instances.

use stagehand_core::Error;
use stagehand_core::ids::{PipelineInstanceId, StageId};
use stagehand_core::instance::StageApproval;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("Stage {0} is not ready for approval")]
    NotReady(StageId),
    #[error("Stage {0} does not require approval")]
    NotRequired(StageId),
}

impl From<ApprovalError> for Error {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::NotReady(stage) => Error::NotReady {
                stage: stage.to_string(),
            },
            ApprovalError::NotRequired(stage) => Error::ApprovalNotRequired {
                stage: stage.to_string(),
            },
        }
    }
}

type GateKey = (PipelineInstanceId, StageId);

/// Tracks approval counts for gated stages.
#[derive(Default)]
pub struct ApprovalGateManager {
    gates: RwLock<HashMap<GateKey, Arc<Mutex<StageApproval>>>>,
}

impl ApprovalGateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gate for a stage. Stages without required approvals get no
    /// record. Opening an existing gate is a no-op.
    pub async fn open(
        &self,
        instance_id: PipelineInstanceId,
        stage_id: &StageId,
        required_approvals: u32,
    ) -> Option<StageApproval> {
        if required_approvals == 0 {
            return None;
        }

        let mut gates = self.gates.write().await;
        let gate = gates
            .entry((instance_id, stage_id.clone()))
            .or_insert_with(|| {
                Arc::new(Mutex::new(StageApproval::new(
                    stage_id.clone(),
                    instance_id,
                    required_approvals,
                )))
            })
            .clone();
        drop(gates);

        let approval = gate.lock().await.clone();
        Some(approval)
    }

    /// Flag a gate as ready once all predecessors succeeded. Returns the
    /// updated record if the flag changed.
    pub async fn mark_ready(
        &self,
        instance_id: PipelineInstanceId,
        stage_id: &StageId,
    ) -> Option<StageApproval> {
        let gate = self.gate(instance_id, stage_id).await?;
        let mut approval = gate.lock().await;
        if approval.ready_for_approval {
            return None;
        }
        approval.ready_for_approval = true;
        info!(
            instance_id = %instance_id,
            stage = %stage_id,
            required = approval.required_approvals,
            "Stage ready for approval"
        );
        Some(approval.clone())
    }

    /// Record an approval. Approving twice with the same approver leaves the
    /// count unchanged.
    pub async fn record_approval(
        &self,
        instance_id: PipelineInstanceId,
        stage_id: &StageId,
        approver_id: &str,
    ) -> Result<StageApproval, ApprovalError> {
        let gate = self
            .gate(instance_id, stage_id)
            .await
            .ok_or_else(|| ApprovalError::NotRequired(stage_id.clone()))?;

        let mut approval = gate.lock().await;
        if !approval.ready_for_approval {
            warn!(
                instance_id = %instance_id,
                stage = %stage_id,
                approver = approver_id,
                "Approval rejected, stage not ready"
            );
            return Err(ApprovalError::NotReady(stage_id.clone()));
        }

        if approval.approver_ids.insert(approver_id.to_string()) {
            approval.approval_count = approval.approver_ids.len() as u32;
            info!(
                instance_id = %instance_id,
                stage = %stage_id,
                approver = approver_id,
                count = approval.approval_count,
                required = approval.required_approvals,
                "Approval recorded"
            );
        } else {
            debug!(
                instance_id = %instance_id,
                stage = %stage_id,
                approver = approver_id,
                "Duplicate approval ignored"
            );
        }

        Ok(approval.clone())
    }

    /// Whether a stage may receive job instances. Ungated stages are always
    /// satisfied.
    pub async fn is_satisfied(&self, instance_id: PipelineInstanceId, stage_id: &StageId) -> bool {
        match self.gate(instance_id, stage_id).await {
            Some(gate) => gate.lock().await.is_satisfied(),
            None => true,
        }
    }

    pub async fn get(
        &self,
        instance_id: PipelineInstanceId,
        stage_id: &StageId,
    ) -> Option<StageApproval> {
        let gate = self.gate(instance_id, stage_id).await?;
        let approval = gate.lock().await.clone();
        Some(approval)
    }

    /// All gates of an instance, sorted by stage id.
    pub async fn list(&self, instance_id: PipelineInstanceId) -> Vec<StageApproval> {
        let gates: Vec<_> = self
            .gates
            .read()
            .await
            .iter()
            .filter(|((id, _), _)| *id == instance_id)
            .map(|(_, gate)| gate.clone())
            .collect();

        let mut approvals = Vec::with_capacity(gates.len());
        for gate in gates {
            approvals.push(gate.lock().await.clone());
        }
        approvals.sort_by(|a, b| a.stage_id.cmp(&b.stage_id));
        approvals
    }

    /// Drop every gate of a finished instance.
    pub async fn close_instance(&self, instance_id: PipelineInstanceId) {
        self.gates
            .write()
            .await
            .retain(|(id, _), _| *id != instance_id);
    }

    async fn gate(
        &self,
        instance_id: PipelineInstanceId,
        stage_id: &StageId,
    ) -> Option<Arc<Mutex<StageApproval>>> {
        self.gates
            .read()
            .await
            .get(&(instance_id, stage_id.clone()))
            .cloned()
    }
}
