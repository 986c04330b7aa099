//! SQLite checkpoint store

use super::schema::init_schema;
use super::{Checkpoint, CheckpointError, Checkpointer, RunSummary};
use crate::state::WorkflowState;
use crate::workflow::RunPhase;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Checkpoints persisted to a SQLite database, one row per save
pub struct SqliteCheckpointer {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointer {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> Result<Self, CheckpointError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        tracing::debug!(path = %path.display(), "opened checkpoint store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, CheckpointError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_phase(run_id: &str, raw: &str) -> Result<RunPhase, CheckpointError> {
    RunPhase::parse(raw).ok_or_else(|| CheckpointError::Corrupt {
        run_id: run_id.to_string(),
        message: format!("unknown phase '{}'", raw),
    })
}

fn parse_time(run_id: &str, raw: &str) -> Result<DateTime<Utc>, CheckpointError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CheckpointError::Corrupt {
            run_id: run_id.to_string(),
            message: format!("bad timestamp '{}': {}", raw, e),
        })
}

impl Checkpointer for SqliteCheckpointer {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let state = checkpoint.state.to_json()?;
        self.conn().execute(
            "INSERT INTO checkpoints (run_id, step, next_node, awaiting_input, phase, status, state, saved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            (
                &checkpoint.run_id,
                checkpoint.step,
                &checkpoint.next_node,
                checkpoint.awaiting_input,
                checkpoint.phase.as_str(),
                checkpoint.state.status().as_str(),
                &state,
                checkpoint.saved_at.to_rfc3339(),
            ),
        )?;
        Ok(())
    }

    fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let row = self
            .conn()
            .query_row(
                "SELECT step, next_node, awaiting_input, phase, state, saved_at
                 FROM checkpoints
                 WHERE run_id = ?1
                 ORDER BY id DESC
                 LIMIT 1",
                [run_id],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((step, next_node, awaiting_input, phase, state, saved_at)) = row else {
            return Ok(None);
        };

        Ok(Some(Checkpoint {
            run_id: run_id.to_string(),
            step,
            next_node,
            awaiting_input,
            phase: parse_phase(run_id, &phase)?,
            state: WorkflowState::from_json(&state)?,
            saved_at: parse_time(run_id, &saved_at)?,
        }))
    }

    fn list_runs(&self) -> Result<Vec<RunSummary>, CheckpointError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT c.run_id, counts.n, c.step, c.phase, c.status, c.saved_at
             FROM checkpoints c
             JOIN (SELECT run_id, COUNT(*) AS n, MAX(id) AS last_id
                   FROM checkpoints GROUP BY run_id) counts
               ON c.id = counts.last_id
             ORDER BY c.id DESC",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(run_id, n, last_step, phase, status, saved_at)| {
                Ok(RunSummary {
                    phase: parse_phase(&run_id, &phase)?,
                    saved_at: parse_time(&run_id, &saved_at)?,
                    checkpoints: n as u64,
                    last_step,
                    status,
                    run_id,
                })
            })
            .collect()
    }

    fn delete(&self, run_id: &str) -> Result<usize, CheckpointError> {
        Ok(self
            .conn()
            .execute("DELETE FROM checkpoints WHERE run_id = ?1", [run_id])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Message, StateDelta, Status};
    use serde_json::json;
    use tempfile::TempDir;

    fn running_state(run_id: &str) -> WorkflowState {
        let mut state = WorkflowState::new(run_id).with_messages([Message::user("m1", "hello")]);
        state.transition("runner", Status::Running).unwrap();
        state
            .update("intelligence", StateDelta::new().set("decision", json!({"action": "wait"})))
            .unwrap();
        state
    }

    #[test]
    fn test_round_trip_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("checkpoints.db");
        let store = SqliteCheckpointer::open(&path).unwrap();

        let state = running_state("run-a");
        let checkpoint = Checkpoint {
            run_id: "run-a".into(),
            step: 3,
            next_node: Some("listener".into()),
            awaiting_input: true,
            phase: RunPhase::Suspended,
            state: state.clone(),
            saved_at: Utc::now(),
        };
        store.save(&checkpoint).unwrap();
        drop(store);

        let reopened = SqliteCheckpointer::open(&path).unwrap();
        let loaded = reopened.load_latest("run-a").unwrap().unwrap();
        assert_eq!(loaded.step, 3);
        assert_eq!(loaded.next_node.as_deref(), Some("listener"));
        assert!(loaded.awaiting_input);
        assert_eq!(loaded.phase, RunPhase::Suspended);
        assert_eq!(loaded.state, state);
        assert!(reopened.load_latest("missing").unwrap().is_none());
    }

    #[test]
    fn test_list_and_delete() {
        let store = SqliteCheckpointer::in_memory().unwrap();
        for step in 1..=3 {
            let mut cp = Checkpoint::snapshot(running_state("run-a"));
            cp.step = step;
            cp.phase = RunPhase::Running;
            store.save(&cp).unwrap();
        }
        store
            .save(&Checkpoint::snapshot(running_state("run-b")).with_run_id("run-b:transcript"))
            .unwrap();

        let runs = store.list_runs().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, "run-b:transcript");
        assert_eq!(runs[1].run_id, "run-a");
        assert_eq!(runs[1].checkpoints, 3);
        assert_eq!(runs[1].last_step, 3);
        assert_eq!(runs[1].status, "running");

        assert_eq!(store.delete("run-a").unwrap(), 3);
        assert_eq!(store.list_runs().unwrap().len(), 1);
    }
}
