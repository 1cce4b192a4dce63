//! SQLite adapter for the archive import storage port.

mod repository;
mod session;

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use provenance_archive_core::{
    ExistingComment, FieldMap, ImportBackend, ImportError, ImportStore, LinkType,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

pub use repository::FsRepository;
use session::SqliteSession;

const LATEST_SCHEMA_VERSION: i64 = 1;

/// Owner of groups the importer creates on its own.
pub const DEFAULT_OWNER_EMAIL: &str = "importer@localhost";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT NOT NULL UNIQUE,
  first_name TEXT NOT NULL DEFAULT '',
  last_name TEXT NOT NULL DEFAULT '',
  institution TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS computers (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  uuid TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL UNIQUE,
  hostname TEXT NOT NULL DEFAULT '',
  description TEXT NOT NULL DEFAULT '',
  scheduler_type TEXT NOT NULL DEFAULT '',
  transport_type TEXT NOT NULL DEFAULT '',
  metadata_json TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS nodes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  uuid TEXT NOT NULL UNIQUE,
  node_type TEXT NOT NULL,
  process_type TEXT,
  label TEXT NOT NULL DEFAULT '',
  description TEXT NOT NULL DEFAULT '',
  ctime TEXT NOT NULL,
  mtime TEXT NOT NULL,
  user_id INTEGER NOT NULL,
  computer_id INTEGER,
  attributes_json TEXT NOT NULL DEFAULT '{}',
  extras_json TEXT NOT NULL DEFAULT '{}',
  FOREIGN KEY (user_id) REFERENCES users(id),
  FOREIGN KEY (computer_id) REFERENCES computers(id)
);

CREATE TABLE IF NOT EXISTS node_groups (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  uuid TEXT NOT NULL UNIQUE,
  label TEXT NOT NULL UNIQUE,
  type_string TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  time TEXT NOT NULL,
  user_id INTEGER NOT NULL,
  extras_json TEXT NOT NULL DEFAULT '{}',
  FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS group_members (
  group_id INTEGER NOT NULL,
  node_id INTEGER NOT NULL,
  PRIMARY KEY (group_id, node_id),
  FOREIGN KEY (group_id) REFERENCES node_groups(id),
  FOREIGN KEY (node_id) REFERENCES nodes(id)
);

CREATE TABLE IF NOT EXISTS links (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  input_id INTEGER NOT NULL,
  output_id INTEGER NOT NULL,
  label TEXT NOT NULL,
  type TEXT NOT NULL CHECK (type IN ('create','return','input_calc','input_work','call_calc','call_work')),
  FOREIGN KEY (input_id) REFERENCES nodes(id),
  FOREIGN KEY (output_id) REFERENCES nodes(id)
);

CREATE TABLE IF NOT EXISTS logs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  uuid TEXT NOT NULL UNIQUE,
  time TEXT NOT NULL,
  loggername TEXT NOT NULL DEFAULT '',
  levelname TEXT NOT NULL DEFAULT '',
  node_id INTEGER NOT NULL,
  message TEXT NOT NULL DEFAULT '',
  metadata_json TEXT NOT NULL DEFAULT '{}',
  FOREIGN KEY (node_id) REFERENCES nodes(id)
);

CREATE TABLE IF NOT EXISTS comments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  uuid TEXT NOT NULL UNIQUE,
  ctime TEXT NOT NULL,
  mtime TEXT NOT NULL,
  content TEXT NOT NULL DEFAULT '',
  node_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  FOREIGN KEY (node_id) REFERENCES nodes(id),
  FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS auto_now (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  enabled INTEGER NOT NULL CHECK (enabled IN (0, 1))
);
INSERT OR IGNORE INTO auto_now(id, enabled) VALUES (1, 1);

CREATE TRIGGER IF NOT EXISTS nodes_touch_on_insert AFTER INSERT ON nodes
WHEN (SELECT enabled FROM auto_now WHERE id = 1) = 1
BEGIN
  UPDATE nodes SET mtime = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = NEW.id;
END;

CREATE TRIGGER IF NOT EXISTS nodes_touch_on_update AFTER UPDATE OF label, description, attributes_json ON nodes
WHEN (SELECT enabled FROM auto_now WHERE id = 1) = 1
BEGIN
  UPDATE nodes SET mtime = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = NEW.id;
END;

CREATE TRIGGER IF NOT EXISTS comments_touch_on_insert AFTER INSERT ON comments
WHEN (SELECT enabled FROM auto_now WHERE id = 1) = 1
BEGIN
  UPDATE comments SET mtime = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = NEW.id;
END;

CREATE TRIGGER IF NOT EXISTS comments_touch_on_update AFTER UPDATE OF content ON comments
WHEN (SELECT enabled FROM auto_now WHERE id = 1) = 1
BEGIN
  UPDATE comments SET mtime = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = NEW.id;
END;

CREATE INDEX IF NOT EXISTS idx_links_input ON links(input_id);
CREATE INDEX IF NOT EXISTS idx_links_output ON links(output_id);
CREATE INDEX IF NOT EXISTS idx_logs_node ON logs(node_id);
CREATE INDEX IF NOT EXISTS idx_comments_node ON comments(node_id);
";

pub struct SqliteStore {
    conn: Connection,
    owner_email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Row counts per table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreCounts {
    pub users: usize,
    pub computers: usize,
    pub nodes: usize,
    pub groups: usize,
    pub group_members: usize,
    pub links: usize,
    pub logs: usize,
    pub comments: usize,
}

/// A stored link with its endpoints spelled as node UUIDs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct StoredLink {
    pub input: String,
    pub output: String,
    pub label: String,
    pub link_type: LinkType,
}

impl SqliteStore {
    /// Open the provenance store at `path`, creating the file when missing.
    ///
    /// The connection runs in WAL mode with foreign keys enforced, and waits up
    /// to five seconds on a locked database. Call [`SqliteStore::migrate`]
    /// before importing.
    ///
    /// # Errors
    /// Fails when the file cannot be opened as a SQLite database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("cannot open provenance store {}", path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .with_context(|| format!("cannot prepare provenance store {}", path.display()))?;

        Ok(Self { conn, owner_email: DEFAULT_OWNER_EMAIL.to_string() })
    }

    /// Use `email` as the owner of groups created by imports.
    #[must_use]
    pub fn with_owner_email(mut self, email: impl Into<String>) -> Self {
        self.owner_email = email.into();
        self
    }

    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer
    /// than this build.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            debug!(version = 1, "applied schema migration");
        }

        let version = current_schema_version(&self.conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }
        Ok(())
    }

    /// Check the store file for corruption, dangling foreign keys (a link or
    /// membership whose node is gone, for instance) and pending migrations.
    ///
    /// # Errors
    /// Fails only when the checks themselves cannot run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .context("provenance store quick check did not run")?;

        let mut violations = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("provenance store foreign key check did not run")?;
        let foreign_key_violations = violations
            .query_map([], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get(1)?,
                    parent: row.get(2)?,
                    fk_index: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read foreign key violations")?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status: self.schema_status()?,
        })
    }

    /// # Errors
    /// Returns an error when any table cannot be counted.
    pub fn counts(&self) -> Result<StoreCounts> {
        Ok(StoreCounts {
            users: count_rows(&self.conn, "users")?,
            computers: count_rows(&self.conn, "computers")?,
            nodes: count_rows(&self.conn, "nodes")?,
            groups: count_rows(&self.conn, "node_groups")?,
            group_members: count_rows(&self.conn, "group_members")?,
            links: count_rows(&self.conn, "links")?,
            logs: count_rows(&self.conn, "logs")?,
            comments: count_rows(&self.conn, "comments")?,
        })
    }

    /// # Errors
    /// Returns an error when groups cannot be read.
    pub fn group_labels(&self) -> Result<Vec<String>> {
        query_strings(&self.conn, "SELECT label FROM node_groups ORDER BY label", [])
    }

    /// # Errors
    /// Returns an error when computers cannot be read.
    pub fn computer_names(&self) -> Result<Vec<String>> {
        query_strings(&self.conn, "SELECT name FROM computers ORDER BY name", [])
    }

    /// UUIDs of the nodes in the group labelled `label`, sorted.
    ///
    /// # Errors
    /// Returns an error when membership cannot be read.
    pub fn group_member_uuids(&self, label: &str) -> Result<Vec<String>> {
        query_strings(
            &self.conn,
            "SELECT n.uuid FROM group_members gm
             JOIN node_groups g ON g.id = gm.group_id
             JOIN nodes n ON n.id = gm.node_id
             WHERE g.label = ?1
             ORDER BY n.uuid",
            [label],
        )
    }

    /// # Errors
    /// Returns an error when the group cannot be read.
    pub fn group_type(&self, label: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT type_string FROM node_groups WHERE label = ?1", [label], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .with_context(|| format!("failed to read group {label}"))
    }

    /// # Errors
    /// Returns an error when the node cannot be read or its extras are not JSON.
    pub fn node_extras(&self, uuid: &str) -> Result<Option<FieldMap>> {
        self.node_json_column(uuid, "extras_json")
    }

    /// # Errors
    /// Returns an error when the node cannot be read or its attributes are not JSON.
    pub fn node_attributes(&self, uuid: &str) -> Result<Option<FieldMap>> {
        self.node_json_column(uuid, "attributes_json")
    }

    fn node_json_column(&self, uuid: &str, column: &str) -> Result<Option<FieldMap>> {
        let raw = self
            .conn
            .query_row(&format!("SELECT {column} FROM nodes WHERE uuid = ?1"), [uuid], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .with_context(|| format!("failed to read {column} of node {uuid}"))?;
        raw.map(|raw| parse_json_map(&raw)).transpose()
    }

    /// # Errors
    /// Returns an error when the node cannot be read or its mtime is malformed.
    pub fn node_mtime(&self, uuid: &str) -> Result<Option<OffsetDateTime>> {
        let raw = self
            .conn
            .query_row("SELECT mtime FROM nodes WHERE uuid = ?1", [uuid], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .with_context(|| format!("failed to read mtime of node {uuid}"))?;
        raw.map(|raw| parse_rfc3339(&raw)).transpose()
    }

    /// # Errors
    /// Returns an error when the comment cannot be read.
    pub fn comment(&self, uuid: &str) -> Result<Option<ExistingComment>> {
        session::load_comment(&self.conn, uuid)
    }

    /// Contents of every comment on the node with `uuid`, oldest first.
    ///
    /// # Errors
    /// Returns an error when comments cannot be read.
    pub fn comments_on(&self, uuid: &str) -> Result<Vec<String>> {
        query_strings(
            &self.conn,
            "SELECT c.content FROM comments c JOIN nodes n ON n.id = c.node_id
             WHERE n.uuid = ?1 ORDER BY c.id",
            [uuid],
        )
    }

    /// # Errors
    /// Returns an error when links cannot be read or carry an unknown type.
    pub fn links(&self) -> Result<Vec<StoredLink>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT i.uuid, o.uuid, l.label, l.type FROM links l
                 JOIN nodes i ON i.id = l.input_id
                 JOIN nodes o ON o.id = l.output_id
                 ORDER BY l.id",
            )
            .context("failed to prepare link listing")?;
        let mut rows = stmt.query([])?;
        let mut links = Vec::new();
        while let Some(row) = rows.next()? {
            let raw_type: String = row.get(3)?;
            links.push(StoredLink {
                input: row.get(0)?,
                output: row.get(1)?,
                label: row.get(2)?,
                link_type: parse_link_type(&raw_type)?,
            });
        }
        Ok(links)
    }
}

impl ImportBackend for SqliteStore {
    fn atomic(
        &mut self,
        work: &mut dyn FnMut(&mut dyn ImportStore) -> Result<(), ImportError>,
    ) -> Result<(), ImportError> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start import transaction")
            .map_err(storage_error)?;
        {
            let mut session = SqliteSession::new(&tx, &self.owner_email);
            // dropping `tx` on error rolls everything back
            work(&mut session)?;
        }
        tx.commit().context("failed to commit import transaction").map_err(storage_error)
    }
}

pub(crate) fn storage_error(err: anyhow::Error) -> ImportError {
    ImportError::Storage(format!("{err:#}"))
}

fn count_rows(conn: &Connection, table: &str) -> Result<usize> {
    let count = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get::<_, i64>(0))
        .with_context(|| format!("failed to count rows of {table}"))?;
    usize::try_from(count).with_context(|| format!("negative row count for {table}"))
}

fn query_strings<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql).with_context(|| format!("failed to prepare query: {sql}"))?;
    let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

pub(crate) fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

pub(crate) fn parse_json_map(raw: &str) -> Result<FieldMap> {
    serde_json::from_str(raw).with_context(|| format!("stored JSON is not an object: {raw}"))
}

pub(crate) fn parse_link_type(raw: &str) -> Result<LinkType> {
    LinkType::parse(raw).ok_or_else(|| anyhow!("unknown link type in store: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_creates_schema_once() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        assert_eq!(store.schema_status()?.pending_versions, vec![1]);

        store.migrate()?;
        store.migrate()?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert!(status.pending_versions.is_empty());
        assert_eq!(store.counts()?, StoreCounts::default());
        Ok(())
    }

    #[test]
    fn fresh_store_passes_integrity_check() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        Ok(())
    }

    #[test]
    fn membership_of_a_missing_node_is_reported() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        store.conn.execute_batch(
            "PRAGMA foreign_keys = OFF;
             INSERT INTO group_members (group_id, node_id) VALUES (1, 2);",
        )?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(!report.foreign_key_violations.is_empty());
        assert!(report.foreign_key_violations.iter().all(|v| v.table == "group_members"));
        Ok(())
    }

    #[test]
    fn unopenable_store_path_is_named_in_the_error() {
        let path = std::env::temp_dir()
            .join(format!("parc-absent-{}", std::process::id()))
            .join("store.sqlite3");
        let Err(err) = SqliteStore::open(&path) else {
            panic!("opening {} should fail", path.display());
        };
        let message = format!("{err:#}");
        assert!(message.contains("cannot open provenance store"), "{message}");
        assert!(message.contains("store.sqlite3"), "{message}");
    }

    #[test]
    fn failed_work_rolls_back_the_transaction() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;

        let outcome = store.atomic(&mut |session| {
            session.create_group("00000000-0000-4000-8000-000000000001", "scratch", "core")?;
            Err(ImportError::Validation("stop".to_string()))
        });
        assert!(outcome.is_err());
        assert!(store.group_labels()?.is_empty());
        assert_eq!(store.counts()?.users, 0);

        store
            .atomic(&mut |session| {
                session.create_group("00000000-0000-4000-8000-000000000001", "kept", "core")?;
                Ok(())
            })
            .map_err(|err| anyhow!(err))?;
        assert_eq!(store.group_labels()?, vec!["kept".to_string()]);
        assert_eq!(store.group_type("kept")?.as_deref(), Some("core"));
        Ok(())
    }
}
