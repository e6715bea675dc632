// Subject registry: what the external watcher (or an operator) writes

use crate::domain::{Job, Subject, SubjectStatus};
use crate::error::{AppError, Result};
use crate::port::store::{conflict_exhausted, read_as, scan_as};
use crate::port::{
    Collection, CommitOutcome, TimeProvider, VersionedStore, Write, MAX_CONFLICT_RETRIES,
};
use std::sync::Arc;
use tracing::info;

/// Fields an upsert may change
#[derive(Debug, Clone)]
pub struct SubjectDraft {
    pub id: String,
    pub title: String,
    pub destinations: Vec<String>,
    pub payload: serde_json::Value,
}

pub struct SubjectService {
    store: Arc<dyn VersionedStore>,
    time_provider: Arc<dyn TimeProvider>,
}

impl SubjectService {
    pub fn new(store: Arc<dyn VersionedStore>, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            store,
            time_provider,
        }
    }

    /// Create or update a subject
    ///
    /// New subjects start `pending`. For an existing subject, `trigger` moves it
    /// back to `pending` unless it has a live job; otherwise its status and job
    /// reference are left alone.
    pub async fn upsert(&self, draft: SubjectDraft, trigger: bool) -> Result<Subject> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let now = self.time_provider.now_millis();
            let existing =
                read_as::<Subject>(self.store.as_ref(), Collection::Subjects, &draft.id).await?;

            let (subject, version) = match existing {
                None => (
                    Subject::new(
                        draft.id.clone(),
                        draft.title.clone(),
                        draft.destinations.clone(),
                        draft.payload.clone(),
                        now,
                    )?,
                    None,
                ),
                Some(record) => {
                    let mut subject = record.value;
                    if draft.title.trim().is_empty() {
                        return Err(AppError::Validation(
                            "subject title must not be empty".to_string(),
                        ));
                    }
                    subject.title = draft.title.clone();
                    subject.destinations = draft.destinations.clone();
                    subject.payload = draft.payload.clone();
                    subject.updated_at = now;
                    if trigger && !self.has_live_job(&subject).await? {
                        subject.status = SubjectStatus::Pending;
                    }
                    (subject, Some(record.version))
                }
            };

            let write = Write::put(Collection::Subjects, draft.id.clone(), version, &subject)?;
            match self.store.commit(vec![write]).await? {
                CommitOutcome::Committed => {
                    info!(subject_id = %subject.id, status = %subject.status, "Subject saved");
                    return Ok(subject);
                }
                CommitOutcome::Conflict => continue,
            }
        }
        Err(conflict_exhausted(format!("upsert of subject {}", draft.id)))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Subject>> {
        Ok(read_as::<Subject>(self.store.as_ref(), Collection::Subjects, id)
            .await?
            .map(|r| r.value))
    }

    pub async fn list(&self) -> Result<Vec<Subject>> {
        Ok(scan_as::<Subject>(self.store.as_ref(), Collection::Subjects, &[])
            .await?
            .into_iter()
            .map(|r| r.value)
            .collect())
    }

    async fn has_live_job(&self, subject: &Subject) -> Result<bool> {
        let Some(job_id) = &subject.active_job_id else {
            return Ok(false);
        };
        Ok(read_as::<Job>(self.store.as_ref(), Collection::Jobs, job_id)
            .await?
            .map_or(false, |r| r.value.is_live()))
    }
}
