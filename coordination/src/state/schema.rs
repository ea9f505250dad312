//! Relational schema for the Postgres run store.
//!
//! One row per run holds the JSON payload and its version token. Messages
//! live in a side table keyed by `(run_id, seq)`; a partial unique index on
//! the fingerprint turns redelivered appends into no-ops.

/// Table holding versioned run payloads
pub const RUNS_TABLE: &str = "workflow_runs";

/// Append-only message side table
pub const MESSAGES_TABLE: &str = "workflow_messages";

/// Idempotent DDL applied by `PostgresStore::migrate`.
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS workflow_runs (
    id          TEXT PRIMARY KEY,
    payload     JSONB NOT NULL,
    version     BIGINT NOT NULL DEFAULT 1,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS workflow_messages (
    seq          BIGSERIAL PRIMARY KEY,
    run_id       TEXT NOT NULL REFERENCES workflow_runs(id) ON DELETE CASCADE,
    fingerprint  TEXT NOT NULL DEFAULT '',
    message      JSONB NOT NULL,
    created_at   TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE UNIQUE INDEX IF NOT EXISTS workflow_messages_dedup
    ON workflow_messages (run_id, fingerprint) WHERE fingerprint <> '';

CREATE INDEX IF NOT EXISTS workflow_messages_run_seq
    ON workflow_messages (run_id, seq);
"#;

/// Statements used by the store.
pub mod sql {
    pub const INSERT_RUN: &str =
        "INSERT INTO workflow_runs (id, payload, version) VALUES ($1, $2, 1)";

    pub const SELECT_RUN: &str = "SELECT payload, version FROM workflow_runs WHERE id = $1";

    /// Row lock taken by the atomic procedures.
    pub const SELECT_RUN_FOR_UPDATE: &str =
        "SELECT payload, version FROM workflow_runs WHERE id = $1 FOR UPDATE";

    /// Optimistic write: zero rows affected means the version moved.
    pub const CONDITIONAL_WRITE: &str = "UPDATE workflow_runs \
         SET payload = $3, version = version + 1, updated_at = now() \
         WHERE id = $1 AND version = $2";

    /// Unconditional write under a held row lock.
    pub const LOCKED_WRITE: &str = "UPDATE workflow_runs \
         SET payload = $2, version = version + 1, updated_at = now() \
         WHERE id = $1 RETURNING version";

    pub const BUMP_VERSION: &str = "UPDATE workflow_runs \
         SET version = version + 1, updated_at = now() \
         WHERE id = $1 RETURNING version";

    pub const INSERT_MESSAGE: &str = "INSERT INTO workflow_messages (run_id, fingerprint, message) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (run_id, fingerprint) WHERE fingerprint <> '' DO NOTHING \
         RETURNING seq";

    pub const SELECT_MESSAGES: &str =
        "SELECT message FROM workflow_messages WHERE run_id = $1 ORDER BY seq";
}
