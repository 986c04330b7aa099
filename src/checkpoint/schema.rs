//! Database schema for the checkpoint store

use rusqlite::Connection;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            step INTEGER NOT NULL,
            next_node TEXT,
            awaiting_input INTEGER NOT NULL DEFAULT 0,
            phase TEXT NOT NULL,
            status TEXT NOT NULL,
            state TEXT NOT NULL,
            saved_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_checkpoints_run ON checkpoints(run_id, id);
        CREATE INDEX IF NOT EXISTS idx_checkpoints_saved ON checkpoints(saved_at);
        "#,
    )
}
