use rusqlite::Connection;

use crate::error::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sequence_slot (
    basename TEXT NOT NULL,
    seq      INTEGER NOT NULL,
    owner    TEXT NOT NULL DEFAULT '',
    assigned INTEGER NOT NULL DEFAULT 0,
    stamp    INTEGER NOT NULL,
    PRIMARY KEY (basename, seq)
);
CREATE INDEX IF NOT EXISTS sequence_slot_owner ON sequence_slot (owner);

CREATE TABLE IF NOT EXISTS delayed_task (
    id              TEXT PRIMARY KEY,
    type_name       TEXT NOT NULL,
    instance        TEXT NOT NULL,
    insert_date     INTEGER NOT NULL,
    execution_delay INTEGER NOT NULL,
    execution_time  INTEGER NOT NULL,
    tag             TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS delayed_task_execution_time ON delayed_task (execution_time);
CREATE INDEX IF NOT EXISTS delayed_task_tag ON delayed_task (tag);
";

pub(crate) fn ensure(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}
