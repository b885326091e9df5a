//! Turso Embedded / libSQL document store.
//!
//! Every collection lives in one `documents` table as JSON text; rowid order
//! is the natural iteration order. `eq`/`in` criteria on scalar values are
//! pushed down to SQL, everything else is filtered in process with
//! [`Criteria::matches`].
//!
//! `ensure_index(field)` creates two expression indexes over
//! `(collection, json_extract(doc, '$.field'))` and
//! `(collection, json_type(doc, '$.field'))`. A pushed-down term on an
//! indexed field is answered from them: scalar equality through the first,
//! array membership through the second. Unindexed fields fall back to a
//! `json_each` scan.
//!
//! **Access rules:** writes are serialized through one connection guarded by
//! a mutex; each `update`, `replace` and `remove_docs` runs in its own
//! transaction.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::Utc;
use libsql::params::Params;
use libsql::{Connection, Database, TransactionBehavior, params};
use regex::Regex;
use serde_json::Value;
use tokio::sync::Mutex;

use matbuild_shared::{Criteria, MatbuildError, Record, Result};

use crate::{Store, effective_key_fields, migrations};

/// Field paths allowed in index DDL and JSON paths.
static FIELD_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").expect("static regex")
});

/// SQLite primary result codes we translate.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_CONSTRAINT: i32 = 19;

/// One collection inside a libSQL database file.
pub struct SqliteStore {
    name: String,
    collection: String,
    key: String,
    last_updated_field: String,
    #[allow(dead_code)]
    db: Database,
    conn: Mutex<Connection>,
    readonly: bool,
}

/// A recorded builder run.
#[derive(Debug, Clone)]
pub struct RunLogEntry {
    pub run_id: String,
    pub builder: String,
    pub started_at: String,
    pub stats_json: String,
}

impl SqliteStore {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(
        path: &Path,
        collection: &str,
        key: &str,
        last_updated_field: &str,
    ) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| MatbuildError::io(parent, e))?;
            }
        }

        let store = Self::connect(path, collection, key, last_updated_field, false).await?;
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(
        path: &Path,
        collection: &str,
        key: &str,
        last_updated_field: &str,
    ) -> Result<Self> {
        Self::connect(path, collection, key, last_updated_field, true).await
    }

    async fn connect(
        path: &Path,
        collection: &str,
        key: &str,
        last_updated_field: &str,
        readonly: bool,
    ) -> Result<Self> {
        validate_field(collection)?;
        validate_field(key)?;
        validate_field(last_updated_field)?;

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| MatbuildError::unavailable(collection, e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| MatbuildError::unavailable(collection, e.to_string()))?;

        // Several stores may share one file; wait for the file lock instead
        // of failing immediately.
        conn.query("PRAGMA busy_timeout = 5000", params![])
            .await
            .map_err(|e| MatbuildError::Storage(e.to_string()))?;

        Ok(Self {
            name: collection.to_string(),
            collection: collection.to_string(),
            key: key.to_string(),
            last_updated_field: last_updated_field.to_string(),
            db,
            conn: Mutex::new(conn),
            readonly,
        })
    }

    /// Override the display name (defaults to the collection).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;
        let conn = self.conn.lock().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    MatbuildError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let conn = self.conn.lock().await;
        let result = conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(MatbuildError::Storage(format!(
                "store '{}' is opened in read-only mode",
                self.name
            )));
        }
        Ok(())
    }

    /// Translate a libSQL error into the pipeline's taxonomy.
    fn map_err(&self, e: libsql::Error) -> MatbuildError {
        let message = e.to_string();
        let code = match &e {
            libsql::Error::SqliteFailure(code, _) => Some(*code & 0xff),
            _ => None,
        };
        let lower = message.to_lowercase();
        if code == Some(SQLITE_CONSTRAINT) || lower.contains("constraint failed") {
            MatbuildError::conflict(&self.name, message)
        } else if matches!(code, Some(SQLITE_BUSY | SQLITE_LOCKED))
            || lower.contains("database is locked")
            || lower.contains("busy")
        {
            MatbuildError::unavailable(&self.name, message)
        } else {
            MatbuildError::Storage(message)
        }
    }

    /// Fetch `(rowid, record)` pairs, pushing down what SQL can evaluate.
    async fn fetch(&self, criteria: &Criteria) -> Result<Vec<(i64, Record)>> {
        let conn = self.conn.lock().await;
        self.select(&conn, criteria).await
    }

    /// [`fetch`](Self::fetch) on a connection the caller already holds,
    /// possibly inside an open transaction.
    async fn select(&self, conn: &Connection, criteria: &Criteria) -> Result<Vec<(i64, Record)>> {
        let terms = pushdown_terms(criteria);
        let indexed = if terms.is_empty() {
            HashSet::new()
        } else {
            self.indexed_fields(conn).await?
        };
        let (sql, values) = select_sql(&self.collection, terms, &indexed);

        let mut rows = conn
            .query(&sql, Params::Positional(values))
            .await
            .map_err(|e| self.map_err(e))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| self.map_err(e))? {
            let id: i64 = row.get(0).map_err(|e| self.map_err(e))?;
            let text: String = row.get(1).map_err(|e| self.map_err(e))?;
            let record = Record::from_value(serde_json::from_str(&text)?)?;
            if criteria.matches(&record) {
                out.push((id, record));
            }
        }
        Ok(out)
    }

    /// Fields of this collection that `ensure_index` has indexed, by any
    /// process sharing the file.
    async fn indexed_fields(&self, conn: &Connection) -> Result<HashSet<String>> {
        let mut rows = conn
            .query(
                "SELECT field FROM store_indexes WHERE collection = ?1",
                params![self.collection.as_str()],
            )
            .await
            .map_err(|e| self.map_err(e))?;
        let mut fields = HashSet::new();
        while let Some(row) = rows.next().await.map_err(|e| self.map_err(e))? {
            fields.insert(row.get::<String>(0).map_err(|e| self.map_err(e))?);
        }
        Ok(fields)
    }

    /// Delete matching records on `conn`, returning how many went.
    async fn delete_in(&self, conn: &Connection, criteria: &Criteria) -> Result<usize> {
        if criteria.is_all() {
            let removed = conn
                .execute(
                    "DELETE FROM documents WHERE collection = ?1",
                    params![self.collection.as_str()],
                )
                .await
                .map_err(|e| self.map_err(e))?;
            return Ok(removed as usize);
        }

        let ids: Vec<i64> = self
            .select(conn, criteria)
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        for id in &ids {
            conn.execute("DELETE FROM documents WHERE id = ?1", params![*id])
                .await
                .map_err(|e| self.map_err(e))?;
        }
        Ok(ids.len())
    }

    /// Optional delete plus upsert, in one transaction.
    async fn write(
        &self,
        remove: Option<&Criteria>,
        docs: Vec<Record>,
        key_fields: &[String],
    ) -> Result<usize> {
        self.check_writable()?;
        let fields = effective_key_fields(self, key_fields);
        for field in &fields {
            validate_field(field)?;
        }
        for doc in &docs {
            doc.key(&fields)?;
        }
        if docs.is_empty() && remove.is_none() {
            return Ok(0);
        }

        // Literal paths, so the planner can match the expression indexes
        // created by `ensure_index`.
        let mut update_sql = String::from("UPDATE documents SET doc = ?1 WHERE collection = ?2");
        for field in &fields {
            let path = json_path(field);
            update_sql.push_str(&format!(
                " AND json_extract(doc, '{path}') = json_extract(?1, '{path}')"
            ));
        }

        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(|e| self.map_err(e))?;
        match self.write_in(&tx, remove, &docs, &update_sql).await {
            Ok(written) => {
                tx.commit().await.map_err(|e| self.map_err(e))?;
                Ok(written)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(store = %self.name, error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn write_in(
        &self,
        conn: &Connection,
        remove: Option<&Criteria>,
        docs: &[Record],
        update_sql: &str,
    ) -> Result<usize> {
        if let Some(criteria) = remove {
            let removed = self.delete_in(conn, criteria).await?;
            tracing::debug!(store = %self.name, removed, "records replaced");
        }

        let mut written = 0;
        for doc in docs {
            let text = serde_json::to_string(doc)?;
            let changed = conn
                .execute(update_sql, params![text.as_str(), self.collection.as_str()])
                .await
                .map_err(|e| self.map_err(e))?;
            if changed == 0 {
                conn.execute(
                    "INSERT INTO documents (collection, doc) VALUES (?1, ?2)",
                    params![self.collection.as_str(), text.as_str()],
                )
                .await
                .map_err(|e| self.map_err(e))?;
            }
            written += 1;
        }
        Ok(written)
    }

    async fn ensure_index_in(&self, conn: &Connection, field: &str, unique: bool) -> Result<bool> {
        let mut rows = conn
            .query(
                "SELECT is_unique FROM store_indexes WHERE collection = ?1 AND field = ?2",
                params![self.collection.as_str(), field],
            )
            .await
            .map_err(|e| self.map_err(e))?;
        let existing = match rows.next().await.map_err(|e| self.map_err(e))? {
            Some(row) => Some(row.get::<i64>(0).map_err(|e| self.map_err(e))? != 0),
            None => None,
        };
        drop(rows);
        if existing == Some(unique) {
            return Ok(false);
        }

        let (value_index, type_index) = index_names(&self.collection, field);
        let path = json_path(field);
        let mut ddl = String::new();
        if existing.is_some() {
            ddl.push_str(&format!("DROP INDEX IF EXISTS \"{value_index}\";\n"));
        }
        // Names and paths passed validate_field, so they are safe to splice.
        ddl.push_str(&format!(
            "CREATE {unique_kw}INDEX IF NOT EXISTS \"{value_index}\"
                 ON documents(collection, json_extract(doc, '{path}'));
             CREATE INDEX IF NOT EXISTS \"{type_index}\"
                 ON documents(collection, json_type(doc, '{path}'));",
            unique_kw = if unique { "UNIQUE " } else { "" },
        ));
        conn.execute_batch(&ddl).await.map_err(|e| self.map_err(e))?;

        conn.execute(
            "INSERT INTO store_indexes (collection, field, is_unique, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(collection, field) DO UPDATE SET is_unique = excluded.is_unique",
            params![
                self.collection.as_str(),
                field,
                i64::from(unique),
                Utc::now().to_rfc3339()
            ],
        )
        .await
        .map_err(|e| self.map_err(e))?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Run log
    // -----------------------------------------------------------------------

    /// Record a finished builder run.
    pub async fn record_run(&self, run_id: &str, builder: &str, stats_json: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO build_runs (run_id, builder, started_at, stats_json) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, builder, now.as_str(), stats_json],
        )
        .await
        .map_err(|e| self.map_err(e))?;
        Ok(())
    }

    /// Most recent runs of `builder`, newest first.
    pub async fn list_runs(&self, builder: &str, limit: u32) -> Result<Vec<RunLogEntry>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT run_id, builder, started_at, stats_json FROM build_runs
                 WHERE builder = ?1 ORDER BY started_at DESC LIMIT ?2",
                params![builder, limit],
            )
            .await
            .map_err(|e| self.map_err(e))?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| self.map_err(e))? {
            results.push(RunLogEntry {
                run_id: row.get::<String>(0).map_err(|e| self.map_err(e))?,
                builder: row.get::<String>(1).map_err(|e| self.map_err(e))?,
                started_at: row.get::<String>(2).map_err(|e| self.map_err(e))?,
                stats_json: row.get::<String>(3).map_err(|e| self.map_err(e))?,
            });
        }
        Ok(results)
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn last_updated_field(&self) -> &str {
        &self.last_updated_field
    }

    async fn query(&self, criteria: &Criteria, properties: &[String]) -> Result<Vec<Record>> {
        Ok(self
            .fetch(criteria)
            .await?
            .into_iter()
            .map(|(_, record)| record.project(properties))
            .collect())
    }

    async fn update(&self, docs: Vec<Record>, key_fields: &[String]) -> Result<usize> {
        self.write(None, docs, key_fields).await
    }

    async fn replace(
        &self,
        criteria: &Criteria,
        docs: Vec<Record>,
        key_fields: &[String],
    ) -> Result<usize> {
        self.write(Some(criteria), docs, key_fields).await
    }

    async fn remove_docs(&self, criteria: &Criteria) -> Result<usize> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(|e| self.map_err(e))?;
        match self.delete_in(&tx, criteria).await {
            Ok(removed) => {
                tx.commit().await.map_err(|e| self.map_err(e))?;
                Ok(removed)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(store = %self.name, error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn ensure_index(&self, field: &str, unique: bool) -> Result<bool> {
        self.check_writable()?;
        validate_field(field)?;

        let conn = self.conn.lock().await;
        // IMMEDIATE takes the write lock up front, so workers sharing the
        // file see each other's registration instead of racing the DDL.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| self.map_err(e))?;
        match self.ensure_index_in(&tx, field, unique).await {
            Ok(created) => {
                tx.commit().await.map_err(|e| self.map_err(e))?;
                if created {
                    tracing::debug!(store = %self.name, field, unique, "index created");
                }
                Ok(created)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(store = %self.name, error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    fn as_dyn(&self) -> &dyn Store {
        self
    }
}

/// Reject names that are unsafe to splice into SQL or JSON paths.
fn validate_field(field: &str) -> Result<()> {
    if FIELD_PATH.is_match(field) {
        Ok(())
    } else {
        Err(MatbuildError::validation(format!("invalid field name '{field}'")))
    }
}

fn json_path(field: &str) -> String {
    format!("$.{field}")
}

/// Scalar `eq`/`in` terms reachable through top-level conjunctions.
///
/// Terms match a field's value or any element of an array value. The
/// in-process filter still runs, so a term only has to select a superset of
/// the true matches.
fn pushdown_terms(criteria: &Criteria) -> Vec<(String, Vec<libsql::Value>)> {
    let mut terms = Vec::new();
    collect_terms(criteria, &mut terms);
    terms
}

fn collect_terms(criteria: &Criteria, terms: &mut Vec<(String, Vec<libsql::Value>)>) {
    match criteria {
        Criteria::Eq { field, value } if FIELD_PATH.is_match(field) => {
            if let Some(v) = sql_scalar(value) {
                terms.push((field.clone(), vec![v]));
            }
        }
        Criteria::In { field, values } if FIELD_PATH.is_match(field) && !values.is_empty() => {
            let scalars: Option<Vec<libsql::Value>> = values.iter().map(sql_scalar).collect();
            if let Some(scalars) = scalars {
                terms.push((field.clone(), scalars));
            }
        }
        Criteria::And(parts) => parts.iter().for_each(|p| collect_terms(p, terms)),
        _ => {}
    }
}

/// `SELECT id, doc` for one collection restricted by `terms`.
///
/// The first term on an indexed field leads: a `UNION` of an index lookup
/// on the scalar value and an index lookup of array-valued documents checked
/// with `json_each`. The remaining terms become `json_each` filters.
fn select_sql(
    collection: &str,
    terms: Vec<(String, Vec<libsql::Value>)>,
    indexed: &HashSet<String>,
) -> (String, Vec<libsql::Value>) {
    let mut values = vec![libsql::Value::Text(collection.to_string())];
    let mut slotted = Vec::with_capacity(terms.len());
    for (field, candidates) in terms {
        let mut slots = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            values.push(candidate);
            slots.push(format!("?{}", values.len()));
        }
        slotted.push((field, slots.join(", ")));
    }

    let lead = slotted.iter().position(|(field, _)| indexed.contains(field));
    let filters: String = slotted
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != lead)
        .map(|(_, (field, slots))| format!(" AND {}", member_of(field, slots)))
        .collect();

    let base = "SELECT id, doc FROM documents WHERE collection = ?1";
    let sql = match lead {
        Some(i) => {
            let (field, slots) = &slotted[i];
            let path = json_path(field);
            format!(
                "{base} AND json_extract(doc, '{path}') IN ({slots}){filters} \
                 UNION \
                 {base} AND json_type(doc, '{path}') = 'array' AND {member}{filters} \
                 ORDER BY id",
                member = member_of(field, slots),
            )
        }
        None => format!("{base}{filters} ORDER BY id"),
    };
    (sql, values)
}

/// `field` holds one of `slots`, directly or as an array element.
fn member_of(field: &str, slots: &str) -> String {
    format!(
        "EXISTS (SELECT 1 FROM json_each(doc, '{}') WHERE value IN ({slots}))",
        json_path(field)
    )
}

/// Names of the value and type indexes for `field` in `collection`.
///
/// `:` cannot occur in a validated name, so distinct pairs never share an
/// index name.
fn index_names(collection: &str, field: &str) -> (String, String) {
    (
        format!("idx_doc:{collection}:{field}"),
        format!("idx_doc_type:{collection}:{field}"),
    )
}

fn sql_scalar(value: &Value) -> Option<libsql::Value> {
    match value {
        Value::String(s) => Some(libsql::Value::Text(s.clone())),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(libsql::Value::Integer(i)),
            None => n.as_f64().map(libsql::Value::Real),
        },
        Value::Bool(b) => Some(libsql::Value::Integer(i64::from(*b))),
        _ => None,
    }
}
