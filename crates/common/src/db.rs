//! SQLite-backed document store for DeviceFarm state persistence
//!
//! Documents are JSON bodies grouped into named collections. Every write
//! touches documents through a single SQL statement, so a single update is
//! atomic with respect to concurrent writers; nothing spans documents.

use crate::Result;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Equality conditions on top-level document fields, joined with AND.
///
/// A `null` value matches documents where the field is null or absent.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<(String, serde_json::Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<serde_json::Value>) -> Self {
        self.clauses.push((field.to_string(), value.into()));
        self
    }
}

/// Field assignments applied by an update (`$set` semantics)
#[derive(Debug, Clone, Default)]
pub struct Set {
    fields: Vec<(String, serde_json::Value)>,
}

impl Set {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, field: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.push((field.to_string(), value.into()));
        self
    }

    fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

const INSERT_DOCUMENT: &str =
    "INSERT INTO documents (collection, body, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)";

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode so other processes can read while a worker writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Round-trip a trivial query to check the connection is usable
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    // ========================================================================
    // Inserts
    // ========================================================================

    /// Insert a single document
    pub fn insert_one<T: Serialize>(&self, collection: &str, doc: &T) -> Result<()> {
        let body = serde_json::to_string(doc)?;
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock();

        conn.execute(INSERT_DOCUMENT, params![collection, body, now])?;

        debug!("Inserted document into {}", collection);
        Ok(())
    }

    /// Insert a batch of documents in one transaction
    pub fn insert_many<T: Serialize>(&self, collection: &str, docs: &[T]) -> Result<usize> {
        if docs.is_empty() {
            return Ok(0);
        }

        let bodies = docs
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let now = chrono::Utc::now().timestamp();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(INSERT_DOCUMENT)?;
            for body in &bodies {
                stmt.execute(params![collection, body, now])?;
            }
        }
        tx.commit()?;

        debug!("Inserted {} documents into {}", bodies.len(), collection);
        Ok(bodies.len())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// All documents in a collection matching the filter, in insertion order
    pub fn find_many<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<T>> {
        self.find(collection, filter, None)
    }

    /// First document matching the filter
    pub fn find_one<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<T>> {
        Ok(self.find(collection, filter, Some(1))?.into_iter().next())
    }

    /// Number of documents matching the filter
    pub fn count(&self, collection: &str, filter: &Filter) -> Result<usize> {
        let mut sql = String::from("SELECT COUNT(*) FROM documents WHERE ");
        let mut args = Vec::new();
        push_where(&mut sql, &mut args, collection, filter);

        let conn = self.conn.lock();
        let count: i64 = conn.query_row(&sql, params_from_iter(args.iter()), |row| row.get(0))?;
        Ok(count as usize)
    }

    fn find<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<T>> {
        let mut sql = String::from("SELECT body FROM documents WHERE ");
        let mut args = Vec::new();
        push_where(&mut sql, &mut args, collection, filter);
        sql.push_str(" ORDER BY id");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(serde_json::from_str(&row?)?);
        }

        Ok(docs)
    }

    // ========================================================================
    // Updates
    // ========================================================================

    /// Apply `set` to the first matching document. Returns how many documents
    /// were modified (0 or 1).
    pub fn update_one(&self, collection: &str, filter: &Filter, set: &Set) -> Result<usize> {
        if set.is_empty() {
            return Ok(0);
        }

        let mut args = Vec::new();
        let mut sql = set_clause(set, &mut args)?;
        sql.push_str(" WHERE id = (SELECT id FROM documents WHERE ");
        push_where(&mut sql, &mut args, collection, filter);
        sql.push_str(" ORDER BY id LIMIT 1)");

        let conn = self.conn.lock();
        let changed = conn.execute(&sql, params_from_iter(args.iter()))?;

        debug!("update_one on {} modified {} document(s)", collection, changed);
        Ok(changed)
    }

    /// Apply `set` to every matching document
    pub fn update_many(&self, collection: &str, filter: &Filter, set: &Set) -> Result<usize> {
        if set.is_empty() {
            return Ok(0);
        }

        let mut args = Vec::new();
        let mut sql = set_clause(set, &mut args)?;
        sql.push_str(" WHERE ");
        push_where(&mut sql, &mut args, collection, filter);

        let conn = self.conn.lock();
        let changed = conn.execute(&sql, params_from_iter(args.iter()))?;

        debug!("update_many on {} modified {} document(s)", collection, changed);
        Ok(changed)
    }
}

fn json_path(field: &str) -> String {
    format!("$.{}", field)
}

fn to_sql(value: &serde_json::Value) -> Option<SqlValue> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::Bool(b) => Some(SqlValue::Integer(*b as i64)),
        serde_json::Value::Number(n) => Some(match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        }),
        serde_json::Value::String(s) => Some(SqlValue::Text(s.clone())),
        other => Some(SqlValue::Text(other.to_string())),
    }
}

fn push_where(sql: &mut String, args: &mut Vec<SqlValue>, collection: &str, filter: &Filter) {
    sql.push_str("collection = ?");
    args.push(SqlValue::Text(collection.to_string()));

    for (field, value) in &filter.clauses {
        args.push(SqlValue::Text(json_path(field)));
        match to_sql(value) {
            Some(v) => {
                sql.push_str(" AND json_extract(body, ?) = ?");
                args.push(v);
            }
            None => sql.push_str(" AND json_extract(body, ?) IS NULL"),
        }
    }
}

fn set_clause(set: &Set, args: &mut Vec<SqlValue>) -> Result<String> {
    let mut sql = String::from("UPDATE documents SET body = json_set(body");
    for (field, value) in &set.fields {
        sql.push_str(", ?, json(?)");
        args.push(SqlValue::Text(json_path(field)));
        args.push(SqlValue::Text(serde_json::to_string(value)?));
    }
    sql.push_str("), updated_at = ?");
    args.push(SqlValue::Integer(chrono::Utc::now().timestamp()));
    Ok(sql)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Gadget {
        name: String,
        state: String,
        closed_at: Option<String>,
    }

    fn gadget(name: &str, state: &str) -> Gadget {
        Gadget {
            name: name.to_string(),
            state: state.to_string(),
            closed_at: None,
        }
    }

    #[test]
    fn test_crud() {
        let db = Database::open_memory().unwrap();

        // Insert
        db.insert_one("gadgets", &gadget("a", "idle")).unwrap();
        let inserted = db
            .insert_many("gadgets", &[gadget("b", "idle"), gadget("c", "busy")])
            .unwrap();
        assert_eq!(inserted, 2);

        // Query
        let idle: Vec<Gadget> = db
            .find_many("gadgets", &Filter::new().eq("state", "idle"))
            .unwrap();
        assert_eq!(idle.len(), 2);
        assert_eq!(idle[0].name, "a");

        let c: Option<Gadget> = db
            .find_one("gadgets", &Filter::new().eq("name", "c"))
            .unwrap();
        assert_eq!(c.unwrap().state, "busy");

        // Update
        let changed = db
            .update_one(
                "gadgets",
                &Filter::new().eq("name", "a"),
                &Set::new().field("state", "busy"),
            )
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(db.count("gadgets", &Filter::new().eq("state", "busy")).unwrap(), 2);
    }

    #[test]
    fn test_update_one_touches_single_document() {
        let db = Database::open_memory().unwrap();
        db.insert_many("gadgets", &[gadget("a", "idle"), gadget("b", "idle")])
            .unwrap();

        let changed = db
            .update_one(
                "gadgets",
                &Filter::new().eq("state", "idle"),
                &Set::new().field("state", "busy"),
            )
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(db.count("gadgets", &Filter::new().eq("state", "idle")).unwrap(), 1);

        let changed = db
            .update_many(
                "gadgets",
                &Filter::new().eq("state", "idle"),
                &Set::new().field("state", "busy"),
            )
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(db.count("gadgets", &Filter::new()).unwrap(), 2);
    }

    #[test]
    fn test_conditional_update_misses_when_state_changed() {
        let db = Database::open_memory().unwrap();
        db.insert_one("gadgets", &gadget("a", "busy")).unwrap();

        let changed = db
            .update_one(
                "gadgets",
                &Filter::new().eq("name", "a").eq("state", "idle"),
                &Set::new().field("state", "busy"),
            )
            .unwrap();
        assert_eq!(changed, 0);
    }

    #[test]
    fn test_null_filter_and_set() {
        let db = Database::open_memory().unwrap();
        db.insert_many("gadgets", &[gadget("a", "idle"), gadget("b", "idle")])
            .unwrap();

        db.update_one(
            "gadgets",
            &Filter::new().eq("name", "b"),
            &Set::new().field("closed_at", "2024-01-01T00:00:00Z"),
        )
        .unwrap();

        let open: Vec<Gadget> = db
            .find_many("gadgets", &Filter::new().eq("closed_at", serde_json::Value::Null))
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].name, "a");

        let b: Gadget = db
            .find_one("gadgets", &Filter::new().eq("name", "b"))
            .unwrap()
            .unwrap();
        assert_eq!(b.closed_at.as_deref(), Some("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn test_collections_are_isolated() {
        let db = Database::open_memory().unwrap();
        db.insert_one("left", &gadget("a", "idle")).unwrap();
        db.insert_one("right", &gadget("a", "idle")).unwrap();

        db.update_many("left", &Filter::new(), &Set::new().field("state", "busy"))
            .unwrap();

        let right: Gadget = db.find_one("right", &Filter::new()).unwrap().unwrap();
        assert_eq!(right.state, "idle");
        assert_eq!(db.insert_many::<Gadget>("left", &[]).unwrap(), 0);
    }

    #[test]
    fn test_persists_across_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("farm.db");

        {
            let db = Database::open(&path).unwrap();
            db.ping().unwrap();
            db.insert_one("gadgets", &gadget("a", "idle")).unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.count("gadgets", &Filter::new()).unwrap(), 1);
    }
}
