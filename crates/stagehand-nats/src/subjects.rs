//! Subject naming.
//!
//! | Subject | Direction |
//! |---|---|
//! | `<prefix>.live.<entity>.<action>` | server → clients |
//! | `<prefix>.dispatch.<platform>` | server → agents (request/reply) |
//! | `<prefix>.cancel.<job_instance_id>` | server → agents |
//! | `<prefix>.report.<job_instance_id>` | agents → server |

use stagehand_core::events::{Entity, LiveEvent};
use stagehand_core::ids::JobInstanceId;
use stagehand_core::pipeline::Platform;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    prefix: String,
}

impl Subjects {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('.').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn live(&self, event: &LiveEvent) -> String {
        format!("{}.live.{}", self.prefix, event.subject())
    }

    /// Wildcard matching every action on one entity stream.
    pub fn live_entity(&self, entity: Entity) -> String {
        format!("{}.live.{}.>", self.prefix, entity.as_str())
    }

    pub fn dispatch(&self, platform: Platform) -> String {
        format!("{}.dispatch.{}", self.prefix, platform.as_str())
    }

    pub fn cancel(&self, job_instance_id: JobInstanceId) -> String {
        format!("{}.cancel.{}", self.prefix, job_instance_id)
    }

    pub fn report(&self, job_instance_id: JobInstanceId) -> String {
        format!("{}.report.{}", self.prefix, job_instance_id)
    }

    pub fn reports(&self) -> String {
        format!("{}.report.*", self.prefix)
    }

    /// Job instance id carried in the last token of a report subject.
    pub fn report_target(&self, subject: &str) -> Option<JobInstanceId> {
        let rest = subject.strip_prefix(&self.prefix)?.strip_prefix(".report.")?;
        rest.parse().ok()
    }
}
