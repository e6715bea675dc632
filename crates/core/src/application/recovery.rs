// Start-up recovery
use crate::domain::{Job, JobStatus, Subject, SubjectStatus};
use crate::error::Result;
use crate::port::store::{read_as, scan_as};
use crate::port::{Collection, CommitOutcome, TimeProvider, VersionedStore, Write};
use std::sync::Arc;
use tracing::{info, warn};

/// Restores the `active_job_id` invariant on daemon start-up
///
/// Jobs with expired leases need no help here: discovery reclaims them.
pub struct RecoveryService {
    store: Arc<dyn VersionedStore>,
    time_provider: Arc<dyn TimeProvider>,
}

impl RecoveryService {
    pub fn new(store: Arc<dyn VersionedStore>, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            store,
            time_provider,
        }
    }

    /// Clear back-references that point at missing or terminal jobs
    ///
    /// A subject left `running` by such a reference is moved to the status
    /// its last job implies (`active`, or `error` when the job is missing or failed).
    ///
    /// # Returns
    /// Number of subjects repaired
    pub async fn repair_dangling_subjects(&self) -> Result<usize> {
        let subjects = scan_as::<Subject>(self.store.as_ref(), Collection::Subjects, &[]).await?;
        let mut repaired = 0;

        for record in subjects {
            let mut subject = record.value;
            let Some(job_id) = subject.active_job_id.clone() else {
                continue;
            };

            let job = read_as::<Job>(self.store.as_ref(), Collection::Jobs, &job_id)
                .await?
                .map(|r| r.value);
            if job.as_ref().map_or(false, Job::is_live) {
                continue;
            }

            let status = match &job {
                Some(job) if job.status == JobStatus::Succeeded => SubjectStatus::Active,
                _ => SubjectStatus::Error,
            };
            let status = if subject.status == SubjectStatus::Running {
                status
            } else {
                subject.status
            };
            subject.detach_job(&job_id, status, self.time_provider.now_millis());

            let write = Write::update(
                Collection::Subjects,
                record.key.clone(),
                record.version,
                &subject,
            )?;
            match self.store.commit(vec![write]).await? {
                CommitOutcome::Committed => {
                    warn!(
                        subject_id = %subject.id,
                        job_id = %job_id,
                        job_found = job.is_some(),
                        "Cleared dangling active job reference"
                    );
                    repaired += 1;
                }
                // Someone else touched the subject; their write re-established the invariant
                CommitOutcome::Conflict => {}
            }
        }

        info!(repaired, "Subject repair complete");
        Ok(repaired)
    }
}
