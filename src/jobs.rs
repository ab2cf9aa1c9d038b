use crate::{
    config::env_or,
    models::{ApiError, BatchReport, BatchRequest},
    pipeline::Pipeline,
    security::AuthContext,
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::info;
use uuid::Uuid;

/// Background queue for batch classification. Jobs run one at a time in
/// submission order so backend rate limits apply across batches.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobState>>>,
}

struct Job {
    id: Uuid,
    request: BatchRequest,
    requested_by: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed {
        result: BatchReport,
    },
    Failed {
        error: String,
        stage: Option<String>,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    pub fn spawn(pipeline: Pipeline) -> (Self, JoinHandle<()>) {
        Self::with_capacity(pipeline, queue_capacity_from_env())
    }

    pub fn with_capacity(pipeline: Pipeline, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let statuses = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                {
                    let mut guard = statuses_bg.lock().await;
                    guard.insert(job.id, JobState::Running);
                }

                info!(
                    target = "fixedprice.jobs",
                    job_id = %job.id,
                    requested_by = %job.requested_by,
                    "batch_job_started"
                );
                let result = pipeline.classify_batch(job.request).await;
                let mut guard = statuses_bg.lock().await;
                match result {
                    Ok(report) => {
                        info!(
                            target = "fixedprice.jobs",
                            job_id = %job.id,
                            processed = report.processed,
                            failed = report.failed,
                            "batch_job_completed"
                        );
                        guard.insert(job.id, JobState::Completed { result: report });
                    }
                    Err(err) => {
                        guard.insert(
                            job.id,
                            JobState::Failed {
                                error: err.detail().to_string(),
                                stage: Some(err.stage().to_string()),
                            },
                        );
                    }
                }
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue_batch(
        &self,
        request: BatchRequest,
        context: &AuthContext,
    ) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            guard.insert(id, JobState::Queued);
        }
        let job = Job {
            id,
            request,
            requested_by: context.user_id.clone(),
        };
        if self.tx.send(job).await.is_err() {
            self.statuses.lock().await.remove(&id);
            return Err(ApiError {
                error: "queue_send_failed".into(),
                detail: Some("worker not available".into()),
                existing_listing: None,
            });
        }
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.get(&id).cloned().map(|state| JobInfo {
            id: id.to_string(),
            state,
        })
    }
}

fn queue_capacity_from_env() -> usize {
    env_or("QUEUE_CAPACITY", 64usize).max(1)
}
