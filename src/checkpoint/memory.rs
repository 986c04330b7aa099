//! In-process checkpoint store

use super::{Checkpoint, CheckpointError, Checkpointer, RunSummary};
use std::collections::HashMap;
use std::sync::Mutex;

/// Keeps every checkpoint in memory; for tests and one-shot runs
#[derive(Debug, Default)]
pub struct MemoryCheckpointer {
    runs: Mutex<HashMap<String, Vec<Checkpoint>>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    /// All checkpoints of a run in save order
    pub fn history(&self, run_id: &str) -> Vec<Checkpoint> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Checkpointer for MemoryCheckpointer {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(checkpoint.run_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(run_id)
            .and_then(|saved| saved.last().cloned()))
    }

    fn list_runs(&self) -> Result<Vec<RunSummary>, CheckpointError> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let mut summaries: Vec<RunSummary> = runs
            .iter()
            .filter_map(|(run_id, saved)| {
                saved.last().map(|last| RunSummary {
                    run_id: run_id.clone(),
                    checkpoints: saved.len() as u64,
                    last_step: last.step,
                    phase: last.phase,
                    status: last.state.status().to_string(),
                    saved_at: last.saved_at,
                })
            })
            .collect();
        summaries.sort_by(|a, b| b.saved_at.cmp(&a.saved_at).then(a.run_id.cmp(&b.run_id)));
        Ok(summaries)
    }

    fn delete(&self, run_id: &str) -> Result<usize, CheckpointError> {
        Ok(self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(run_id)
            .map_or(0, |saved| saved.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Message, Status, WorkflowState};
    use crate::workflow::RunPhase;

    #[test]
    fn test_latest_wins() {
        let store = MemoryCheckpointer::new();
        let mut state = WorkflowState::new("run-1").with_messages([Message::user("m1", "hi")]);
        store.save(&Checkpoint::snapshot(state.clone())).unwrap();

        state.transition("runner", Status::Running).unwrap();
        let mut second = Checkpoint::snapshot(state);
        second.step = 1;
        second.phase = RunPhase::Running;
        store.save(&second).unwrap();

        let latest = store.load_latest("run-1").unwrap().unwrap();
        assert_eq!(latest.step, 1);
        assert_eq!(latest.state.status(), Status::Running);
        assert_eq!(store.history("run-1").len(), 2);

        let runs = store.list_runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].checkpoints, 2);
        assert_eq!(runs[0].status, "running");

        assert_eq!(store.delete("run-1").unwrap(), 2);
        assert!(store.load_latest("run-1").unwrap().is_none());
    }
}
