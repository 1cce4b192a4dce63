use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use provenance_archive_core::{
    EntityKind, EntityRow, ExistingComment, FieldMap, ImportError, ImportStore, LinkRow,
    NodeSummary, StorageId,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::debug;

use crate::{parse_json_map, parse_link_type, parse_rfc3339, rfc3339, storage_error};

/// Bound on bound parameters per statement.
const MAX_SQL_VARIABLES: usize = 999;

const USER_COLUMNS: &[&str] = &["email", "first_name", "last_name", "institution"];
const COMPUTER_COLUMNS: &[&str] = &[
    "uuid",
    "name",
    "hostname",
    "description",
    "scheduler_type",
    "transport_type",
    "metadata_json",
];
const NODE_COLUMNS: &[&str] = &[
    "uuid",
    "node_type",
    "process_type",
    "label",
    "description",
    "ctime",
    "mtime",
    "user_id",
    "computer_id",
    "attributes_json",
    "extras_json",
];
const GROUP_COLUMNS: &[&str] =
    &["uuid", "label", "type_string", "description", "time", "user_id", "extras_json"];
const LOG_COLUMNS: &[&str] =
    &["uuid", "time", "loggername", "levelname", "node_id", "message", "metadata_json"];
const COMMENT_COLUMNS: &[&str] = &["uuid", "ctime", "mtime", "content", "node_id", "user_id"];
const LINK_COLUMNS: &[&str] = &["input_id", "output_id", "label", "type"];
const MEMBER_COLUMNS: &[&str] = &["group_id", "node_id"];

/// One import transaction's view of the store.
pub(crate) struct SqliteSession<'conn> {
    conn: &'conn Connection,
    owner_email: &'conn str,
}

impl<'conn> SqliteSession<'conn> {
    pub(crate) fn new(conn: &'conn Connection, owner_email: &'conn str) -> Self {
        Self { conn, owner_email }
    }

    fn lookup_ids(
        &self,
        kind: EntityKind,
        unique_ids: &BTreeSet<String>,
        batch_size: usize,
    ) -> Result<BTreeMap<String, StorageId>> {
        let (table, key) = table_of(kind);
        let mut found = BTreeMap::new();
        let keys = unique_ids.iter().collect::<Vec<_>>();
        for chunk in keys.chunks(lookup_chunk(batch_size)) {
            let sql = format!(
                "SELECT {key}, id FROM {table} WHERE {key} IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt =
                self.conn.prepare_cached(&sql).with_context(|| format!("failed to prepare {table} lookup"))?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (unique_id, id) = row?;
                found.insert(unique_id, id);
            }
        }
        Ok(found)
    }

    fn insert_rows(&self, rows: &[EntityRow], batch_size: usize) -> Result<()> {
        let Some(first) = rows.first() else {
            return Ok(());
        };
        let kind = first.kind();
        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            anyhow::ensure!(row.kind() == kind, "cannot insert {} rows into the {kind} table", row.kind());
            values.push(row_values(row)?);
        }
        let (table, _) = table_of(kind);
        bulk_insert(self.conn, "INSERT", table, columns_of(kind), &values, batch_size)
    }

    fn load_extras(
        &self,
        uuids: &BTreeSet<String>,
        batch_size: usize,
    ) -> Result<BTreeMap<String, (StorageId, FieldMap)>> {
        let mut found = BTreeMap::new();
        let keys = uuids.iter().collect::<Vec<_>>();
        for chunk in keys.chunks(lookup_chunk(batch_size)) {
            let sql = format!(
                "SELECT uuid, id, extras_json FROM nodes WHERE uuid IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare_cached(&sql).context("failed to prepare extras lookup")?;
            let mut rows = stmt.query(params_from_iter(chunk.iter()))?;
            while let Some(row) = rows.next()? {
                let raw: String = row.get(2)?;
                found.insert(row.get::<_, String>(0)?, (row.get::<_, i64>(1)?, parse_json_map(&raw)?));
            }
        }
        Ok(found)
    }

    fn load_links(&self) -> Result<Vec<LinkRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT input_id, output_id, label, type FROM links")
            .context("failed to prepare link scan")?;
        let mut rows = stmt.query([])?;
        let mut links = Vec::new();
        while let Some(row) = rows.next()? {
            let raw_type: String = row.get(3)?;
            links.push(LinkRow {
                input_id: row.get(0)?,
                output_id: row.get(1)?,
                label: row.get(2)?,
                link_type: parse_link_type(&raw_type)?,
            });
        }
        Ok(links)
    }

    fn load_summaries(
        &self,
        ids: &BTreeSet<StorageId>,
        batch_size: usize,
    ) -> Result<BTreeMap<StorageId, NodeSummary>> {
        let mut found = BTreeMap::new();
        let keys = ids.iter().collect::<Vec<_>>();
        for chunk in keys.chunks(lookup_chunk(batch_size)) {
            let sql = format!(
                "SELECT id, uuid, node_type FROM nodes WHERE id IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare_cached(&sql).context("failed to prepare node lookup")?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, i64>(0)?, NodeSummary { uuid: row.get(1)?, node_type: row.get(2)? }))
            })?;
            for row in rows {
                let (id, summary) = row?;
                found.insert(id, summary);
            }
        }
        Ok(found)
    }

    fn owner_id(&self) -> Result<StorageId> {
        self.conn
            .execute("INSERT OR IGNORE INTO users(email) VALUES (?1)", [self.owner_email])
            .with_context(|| format!("failed to ensure owner {}", self.owner_email))?;
        self.conn
            .query_row("SELECT id FROM users WHERE email = ?1", [self.owner_email], |row| row.get(0))
            .with_context(|| format!("failed to read owner {}", self.owner_email))
    }

    fn insert_group(&self, uuid: &str, label: &str, type_string: &str) -> Result<StorageId> {
        let owner = self.owner_id()?;
        self.conn
            .execute(
                "INSERT INTO node_groups(uuid, label, type_string, time, user_id) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![uuid, label, type_string, rfc3339(OffsetDateTime::now_utc())?, owner],
            )
            .with_context(|| format!("failed to create group {label}"))?;
        Ok(self.conn.last_insert_rowid())
    }
}

impl ImportStore for SqliteSession<'_> {
    fn find_existing(
        &mut self,
        kind: EntityKind,
        unique_ids: &BTreeSet<String>,
        batch_size: usize,
    ) -> Result<BTreeMap<String, StorageId>, ImportError> {
        self.lookup_ids(kind, unique_ids, batch_size).map_err(storage_error)
    }

    fn name_in_use(&mut self, kind: EntityKind, name: &str) -> Result<bool, ImportError> {
        let sql = match kind {
            EntityKind::Group => "SELECT EXISTS(SELECT 1 FROM node_groups WHERE label = ?1)",
            EntityKind::Computer => "SELECT EXISTS(SELECT 1 FROM computers WHERE name = ?1)",
            _ => return Ok(false),
        };
        self.conn
            .query_row(sql, [name], |row| row.get::<_, bool>(0))
            .with_context(|| format!("failed to check whether {kind} name {name} is taken"))
            .map_err(storage_error)
    }

    fn insert_entities(&mut self, rows: &[EntityRow], batch_size: usize) -> Result<(), ImportError> {
        self.insert_rows(rows, batch_size).map_err(storage_error)
    }

    fn set_auto_now(&mut self, enabled: bool) -> Result<(), ImportError> {
        self.conn
            .execute("UPDATE auto_now SET enabled = ?1 WHERE id = 1", [enabled])
            .context("failed to toggle automatic timestamps")
            .map(|_| ())
            .map_err(storage_error)
    }

    fn node_extras(
        &mut self,
        uuids: &BTreeSet<String>,
        batch_size: usize,
    ) -> Result<BTreeMap<String, (StorageId, FieldMap)>, ImportError> {
        self.load_extras(uuids, batch_size).map_err(storage_error)
    }

    fn update_node_extras(&mut self, id: StorageId, extras: &FieldMap) -> Result<(), ImportError> {
        let raw = serde_json::to_string(extras)
            .context("failed to serialize extras")
            .map_err(storage_error)?;
        self.conn
            .execute("UPDATE nodes SET extras_json = ?1 WHERE id = ?2", params![raw, id])
            .with_context(|| format!("failed to update extras of node {id}"))
            .map(|_| ())
            .map_err(storage_error)
    }

    fn find_comment(&mut self, uuid: &str) -> Result<Option<ExistingComment>, ImportError> {
        load_comment(self.conn, uuid).map_err(storage_error)
    }

    fn update_comment(
        &mut self,
        id: StorageId,
        content: &str,
        mtime: OffsetDateTime,
    ) -> Result<(), ImportError> {
        let mtime = rfc3339(mtime).map_err(storage_error)?;
        self.conn
            .execute(
                "UPDATE comments SET content = ?1, mtime = ?2 WHERE id = ?3",
                params![content, mtime, id],
            )
            .with_context(|| format!("failed to update comment {id}"))
            .map(|_| ())
            .map_err(storage_error)
    }

    fn all_links(&mut self) -> Result<Vec<LinkRow>, ImportError> {
        self.load_links().map_err(storage_error)
    }

    fn node_summaries(
        &mut self,
        ids: &BTreeSet<StorageId>,
        batch_size: usize,
    ) -> Result<BTreeMap<StorageId, NodeSummary>, ImportError> {
        self.load_summaries(ids, batch_size).map_err(storage_error)
    }

    fn insert_links(&mut self, links: &[LinkRow], batch_size: usize) -> Result<(), ImportError> {
        let rows = links
            .iter()
            .map(|link| {
                vec![
                    Value::Integer(link.input_id),
                    Value::Integer(link.output_id),
                    Value::Text(link.label.clone()),
                    Value::Text(link.link_type.as_str().to_string()),
                ]
            })
            .collect::<Vec<_>>();
        bulk_insert(self.conn, "INSERT", "links", LINK_COLUMNS, &rows, batch_size)
            .map_err(storage_error)
    }

    fn add_group_members(
        &mut self,
        group_id: StorageId,
        node_ids: &BTreeSet<StorageId>,
        batch_size: usize,
    ) -> Result<(), ImportError> {
        let rows = node_ids
            .iter()
            .map(|node| vec![Value::Integer(group_id), Value::Integer(*node)])
            .collect::<Vec<_>>();
        bulk_insert(self.conn, "INSERT OR IGNORE", "group_members", MEMBER_COLUMNS, &rows, batch_size)
            .map_err(storage_error)
    }

    fn find_group_by_label(&mut self, label: &str) -> Result<Option<StorageId>, ImportError> {
        self.conn
            .query_row("SELECT id FROM node_groups WHERE label = ?1", [label], |row| row.get(0))
            .optional()
            .with_context(|| format!("failed to look up group {label}"))
            .map_err(storage_error)
    }

    fn create_group(
        &mut self,
        uuid: &str,
        label: &str,
        type_string: &str,
    ) -> Result<StorageId, ImportError> {
        self.insert_group(uuid, label, type_string).map_err(storage_error)
    }
}

pub(crate) fn load_comment(conn: &Connection, uuid: &str) -> Result<Option<ExistingComment>> {
    let row = conn
        .query_row("SELECT id, mtime, content FROM comments WHERE uuid = ?1", [uuid], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })
        .optional()
        .with_context(|| format!("failed to read comment {uuid}"))?;
    row.map(|(id, mtime, content)| {
        Ok(ExistingComment { id, mtime: parse_rfc3339(&mtime)?, content })
    })
    .transpose()
}

/// Insert `rows` with multi-row `VALUES` statements holding at most
/// `batch_size` rows and [`MAX_SQL_VARIABLES`] parameters each.
fn bulk_insert(
    conn: &Connection,
    verb: &str,
    table: &str,
    columns: &[&str],
    rows: &[Vec<Value>],
    batch_size: usize,
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let per_statement = batch_size.min(MAX_SQL_VARIABLES / columns.len()).max(1);
    let row_placeholders = format!("({})", placeholders(columns.len()));
    for chunk in rows.chunks(per_statement) {
        let sql = format!(
            "{verb} INTO {table} ({}) VALUES {}",
            columns.join(", "),
            vec![row_placeholders.as_str(); chunk.len()].join(", ")
        );
        let mut stmt =
            conn.prepare_cached(&sql).with_context(|| format!("failed to prepare insert into {table}"))?;
        stmt.execute(params_from_iter(chunk.iter().flatten()))
            .with_context(|| format!("failed to insert {} rows into {table}", chunk.len()))?;
    }
    debug!(table, rows = rows.len(), "bulk insert");
    Ok(())
}

fn lookup_chunk(batch_size: usize) -> usize {
    batch_size.clamp(1, MAX_SQL_VARIABLES)
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn table_of(kind: EntityKind) -> (&'static str, &'static str) {
    match kind {
        EntityKind::User => ("users", "email"),
        EntityKind::Computer => ("computers", "uuid"),
        EntityKind::Node => ("nodes", "uuid"),
        EntityKind::Group => ("node_groups", "uuid"),
        EntityKind::Log => ("logs", "uuid"),
        EntityKind::Comment => ("comments", "uuid"),
    }
}

fn columns_of(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::User => USER_COLUMNS,
        EntityKind::Computer => COMPUTER_COLUMNS,
        EntityKind::Node => NODE_COLUMNS,
        EntityKind::Group => GROUP_COLUMNS,
        EntityKind::Log => LOG_COLUMNS,
        EntityKind::Comment => COMMENT_COLUMNS,
    }
}

fn row_values(row: &EntityRow) -> Result<Vec<Value>> {
    let text = |value: &str| Value::Text(value.to_string());
    let json = |value: &FieldMap| -> Result<Value> {
        Ok(Value::Text(serde_json::to_string(value).context("failed to serialize JSON column")?))
    };
    let time = |value: OffsetDateTime| -> Result<Value> { Ok(Value::Text(rfc3339(value)?)) };

    let values = match row {
        EntityRow::User(user) => vec![
            text(&user.email),
            text(&user.first_name),
            text(&user.last_name),
            text(&user.institution),
        ],
        EntityRow::Computer(computer) => vec![
            text(&computer.uuid),
            text(&computer.name),
            text(&computer.hostname),
            text(&computer.description),
            text(&computer.scheduler_type),
            text(&computer.transport_type),
            json(&computer.metadata)?,
        ],
        EntityRow::Node(node) => vec![
            text(&node.uuid),
            text(&node.node_type),
            node.process_type.as_deref().map_or(Value::Null, text),
            text(&node.label),
            text(&node.description),
            time(node.ctime)?,
            time(node.mtime)?,
            Value::Integer(node.user),
            node.dbcomputer.map_or(Value::Null, Value::Integer),
            json(&node.attributes)?,
            json(&node.extras)?,
        ],
        EntityRow::Group(group) => vec![
            text(&group.uuid),
            text(&group.label),
            text(&group.type_string),
            text(&group.description),
            time(group.time)?,
            Value::Integer(group.user),
            json(&group.extras)?,
        ],
        EntityRow::Log(log) => vec![
            text(&log.uuid),
            time(log.time)?,
            text(&log.loggername),
            text(&log.levelname),
            Value::Integer(log.dbnode),
            text(&log.message),
            json(&log.metadata)?,
        ],
        EntityRow::Comment(comment) => vec![
            text(&comment.uuid),
            time(comment.ctime)?,
            time(comment.mtime)?,
            text(&comment.content),
            Value::Integer(comment.dbnode),
            Value::Integer(comment.user),
        ],
    };
    Ok(values)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::SqliteStore;

    #[test]
    fn bulk_insert_splits_by_parameter_budget() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        let tx = store.conn.transaction()?;
        let rows = (0..1200)
            .map(|n| {
                vec![
                    Value::Text(format!("user{n}@example.com")),
                    Value::Text(String::new()),
                    Value::Text(String::new()),
                    Value::Text(String::new()),
                ]
            })
            .collect::<Vec<_>>();
        bulk_insert(&tx, "INSERT", "users", USER_COLUMNS, &rows, 1000)?;
        let count: i64 = tx.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        assert_eq!(count, 1200);
        Ok(())
    }

    #[test]
    fn auto_now_toggle_controls_insert_timestamps() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        let tx = store.conn.transaction()?;
        let mut session = SqliteSession::new(&tx, "owner@example.com");
        let owner = session.owner_id()?;

        let insert = |session: &SqliteSession<'_>, uuid: &str| -> Result<()> {
            session.conn.execute(
                "INSERT INTO nodes(uuid, node_type, ctime, mtime, user_id)
                 VALUES (?1, 'data.', '2020-01-01T00:00:00Z', '2020-01-01T00:00:00Z', ?2)",
                params![uuid, owner],
            )?;
            Ok(())
        };
        let mtime = |uuid: &str| -> Result<String> {
            Ok(tx.query_row("SELECT mtime FROM nodes WHERE uuid = ?1", [uuid], |row| row.get(0))?)
        };

        session.set_auto_now(false).map_err(anyhow::Error::from)?;
        insert(&session, "kept")?;
        session.set_auto_now(true).map_err(anyhow::Error::from)?;
        insert(&session, "touched")?;

        assert_eq!(mtime("kept")?, "2020-01-01T00:00:00Z");
        assert_ne!(mtime("touched")?, "2020-01-01T00:00:00Z");
        Ok(())
    }
}
