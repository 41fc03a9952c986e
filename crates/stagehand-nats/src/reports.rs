//! Agent state reports arriving on `<prefix>.report.<job_instance_id>`.

use crate::connection::NatsConnection;
use crate::subjects::Subjects;
use futures::{Stream, StreamExt};
use stagehand_core::ports::StateReport;
use stagehand_core::{Error, Result};
use std::pin::Pin;
use tracing::{debug, info, warn};

pub type ReportStream = Pin<Box<dyn Stream<Item = StateReport> + Send>>;

#[derive(Clone)]
pub struct NatsReportListener {
    connection: NatsConnection,
}

impl NatsReportListener {
    pub fn new(connection: NatsConnection) -> Self {
        Self { connection }
    }

    /// Subscribe to every report subject. Malformed reports are logged and
    /// skipped.
    pub async fn subscribe(&self) -> Result<ReportStream> {
        let subject = self.connection.subjects().reports();
        let subscriber = self
            .connection
            .client()
            .subscribe(subject.clone())
            .await
            .map_err(|e| Error::EventBus(format!("Failed to subscribe to {}: {}", subject, e)))?;
        info!(subject = %subject, "Listening for agent state reports");

        let subjects = self.connection.subjects().clone();
        let metrics = self.connection.metrics().clone();
        let reports = subscriber.filter_map(move |message| {
            let decoded = decode_report(&subjects, message.subject.as_str(), &message.payload);
            match &decoded {
                Ok(report) => {
                    metrics.record_report(message.payload.len() as u64);
                    debug!(
                        job_instance_id = %report.job_instance_id,
                        state = %report.state,
                        "State report received"
                    );
                }
                Err(e) => {
                    metrics.record_malformed_report();
                    warn!(subject = %message.subject, error = %e, "Dropping state report");
                }
            }
            futures::future::ready(decoded.ok())
        });

        Ok(Box::pin(reports))
    }
}

/// Decode a report, requiring the subject and payload to name the same job.
pub fn decode_report(subjects: &Subjects, subject: &str, payload: &[u8]) -> Result<StateReport> {
    let report: StateReport = serde_json::from_slice(payload)?;
    match subjects.report_target(subject) {
        Some(target) if target == report.job_instance_id => Ok(report),
        Some(target) => Err(Error::Serialization(format!(
            "report for {} published on subject of {}",
            report.job_instance_id, target
        ))),
        None => Err(Error::Serialization(format!(
            "unrecognized report subject {}",
            subject
        ))),
    }
}
