//! SQL migration definitions for the document database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: documents, store_indexes",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- JSON documents for every collection; rowid order is the natural order
CREATE TABLE IF NOT EXISTS documents (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    doc        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);

-- Indexes requested through ensure_index
CREATE TABLE IF NOT EXISTS store_indexes (
    collection TEXT NOT NULL,
    field      TEXT NOT NULL,
    is_unique  INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (collection, field)
);

INSERT OR IGNORE INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Run log for builder invocations",
            sql: r#"
CREATE TABLE IF NOT EXISTS build_runs (
    run_id      TEXT PRIMARY KEY,
    builder     TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    stats_json  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_build_runs_builder ON build_runs(builder);

INSERT OR IGNORE INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
