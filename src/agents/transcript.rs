//! Conversation transcript persistence

use crate::checkpoint::{Checkpoint, Checkpointer};
use crate::node::{BackgroundAgent, BackgroundError};
use crate::state::{Status, WorkflowState};
use crate::workflow::RunPhase;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

/// Checkpoint key a run's transcript is stored under
pub fn transcript_key(run_id: &str) -> String {
    format!("{}:transcript", run_id)
}

/// Saves the final conversation to a checkpoint store
pub struct TranscriptRecorder {
    store: Arc<dyn Checkpointer>,
}

impl TranscriptRecorder {
    pub fn new(store: Arc<dyn Checkpointer>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BackgroundAgent for TranscriptRecorder {
    fn name(&self) -> &str {
        "transcript"
    }

    async fn run(&self, snapshot: Arc<WorkflowState>) -> Result<Option<Value>, BackgroundError> {
        let key = transcript_key(snapshot.run_id());
        let messages = snapshot.history().len();
        let mut checkpoint = Checkpoint::snapshot((*snapshot).clone()).with_run_id(key.clone());
        checkpoint.phase = match snapshot.status() {
            Status::Completed => RunPhase::Completed,
            Status::Failed => RunPhase::Failed,
            Status::Pending => RunPhase::Idle,
            Status::Running => RunPhase::Running,
        };

        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save(&checkpoint))
            .await
            .map_err(|e| BackgroundError::Failed(format!("transcript writer stopped: {}", e)))??;

        tracing::debug!(key = %key, messages, "saved transcript");
        Ok(Some(json!({ "key": key, "messages": messages })))
    }
}
