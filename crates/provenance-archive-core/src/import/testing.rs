//! In-memory port implementations shared by the import unit tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::entity::{EntityKind, EntityRow, FieldMap, GroupRow};
use crate::reader::{ArchiveData, ArchiveMetadata, ArchiveReader, JsonArchive};
use crate::store::{
    ExistingComment, ImportBackend, ImportStore, LinkRow, NodeSummary, RepositoryCopier, StorageId,
};
use crate::ImportError;

pub(crate) type TestResult = Result<(), Box<dyn std::error::Error>>;

pub(crate) fn node_uuid(n: u32) -> String {
    format!("00000000-0000-4000-8000-{n:012}")
}

pub(crate) fn archive(data: Value) -> Result<JsonArchive, Box<dyn std::error::Error>> {
    let data: ArchiveData = serde_json::from_value(data)?;
    Ok(JsonArchive::from_parts(ArchiveMetadata::current(), data)?)
}

/// One user, one computer, a calculation that creates a data node, a group
/// holding both nodes, a log and a comment on the calculation.
pub(crate) fn sample_data() -> Value {
    json!({
        "export_data": {
            "User": {"1": {"email": "alice@example.com", "first_name": "Alice"}},
            "Computer": {"1": {"uuid": node_uuid(900), "name": "cluster", "hostname": "hpc"}},
            "Node": {
                "1": {
                    "uuid": node_uuid(1), "node_type": "process.calculation.calcjob.CalcJobNode.",
                    "ctime": "2020-01-01T10:00:00.000000", "mtime": "2020-01-02T10:00:00.000000",
                    "user": 1, "dbcomputer": 1,
                    "attributes": {"checkpoints": "state", "exit_status": 0},
                    "extras": {"_aiida_hash": "abc", "tag": "run"}
                },
                "2": {
                    "uuid": node_uuid(2), "node_type": "data.core.int.Int.",
                    "ctime": "2020-01-01T10:00:00.000000", "mtime": "2020-01-02T10:00:00.000000",
                    "user": 1, "dbcomputer": null,
                    "attributes": {"value": 3}, "extras": {"a": 1, "b": 2}
                }
            },
            "Group": {"1": {
                "uuid": node_uuid(500), "label": "results", "type_string": "core",
                "time": "2020-01-03T00:00:00", "user": 1
            }},
            "Log": {"1": {
                "uuid": node_uuid(600), "time": "2020-01-01T10:00:01", "loggername": "engine",
                "levelname": "INFO", "dbnode": 1, "message": "started"
            }},
            "Comment": {"1": {
                "uuid": node_uuid(700), "ctime": "2020-01-01T11:00:00",
                "mtime": "2020-01-01T11:00:00", "content": "looks fine", "dbnode": 1, "user": 1
            }}
        },
        "links_uuid": [
            {"input": node_uuid(1), "output": node_uuid(2), "label": "result", "type": "create"}
        ],
        "groups_uuid": {node_uuid(500): [node_uuid(1), node_uuid(2)]}
    })
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryState {
    pub rows: BTreeMap<EntityKind, BTreeMap<String, (StorageId, EntityRow)>>,
    pub links: Vec<LinkRow>,
    pub members: BTreeSet<(StorageId, StorageId)>,
    pub next_id: StorageId,
    pub auto_now: bool,
    pub fail_link_insert: bool,
}

impl MemoryState {
    fn allocate(&mut self) -> StorageId {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn count(&self, kind: EntityKind) -> usize {
        self.rows.get(&kind).map_or(0, BTreeMap::len)
    }

    pub(crate) fn row(&self, kind: EntityKind, unique_id: &str) -> Option<&EntityRow> {
        self.rows.get(&kind)?.get(unique_id).map(|(_, row)| row)
    }

    fn rows_mut(&mut self, kind: EntityKind) -> impl Iterator<Item = &mut (StorageId, EntityRow)> {
        self.rows.entry(kind).or_default().values_mut()
    }

    pub(crate) fn group_labels(&self) -> Vec<String> {
        self.rows
            .get(&EntityKind::Group)
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter_map(|(_, row)| match row {
                EntityRow::Group(group) => Some(group.label.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ImportStore for MemoryState {
    fn find_existing(
        &mut self,
        kind: EntityKind,
        unique_ids: &BTreeSet<String>,
        _batch_size: usize,
    ) -> Result<BTreeMap<String, StorageId>, ImportError> {
        let stored = self.rows.get(&kind);
        Ok(unique_ids
            .iter()
            .filter_map(|uid| stored?.get(uid).map(|(id, _)| (uid.clone(), *id)))
            .collect())
    }

    fn name_in_use(&mut self, kind: EntityKind, name: &str) -> Result<bool, ImportError> {
        Ok(self.rows.get(&kind).into_iter().flat_map(BTreeMap::values).any(|(_, row)| {
            match row {
                EntityRow::Group(group) => group.label == name,
                EntityRow::Computer(computer) => computer.name == name,
                _ => false,
            }
        }))
    }

    fn insert_entities(&mut self, rows: &[EntityRow], _batch_size: usize) -> Result<(), ImportError> {
        for row in rows {
            if self.row(row.kind(), row.unique_id()).is_some() {
                return Err(ImportError::Storage(format!(
                    "duplicate {} {}",
                    row.kind(),
                    row.unique_id()
                )));
            }
            let mut row = row.clone();
            if self.auto_now {
                if let EntityRow::Node(node) = &mut row {
                    node.mtime = OffsetDateTime::now_utc();
                }
            }
            let id = self.allocate();
            self.rows
                .entry(row.kind())
                .or_default()
                .insert(row.unique_id().to_string(), (id, row));
        }
        Ok(())
    }

    fn set_auto_now(&mut self, enabled: bool) -> Result<(), ImportError> {
        self.auto_now = enabled;
        Ok(())
    }

    fn node_extras(
        &mut self,
        uuids: &BTreeSet<String>,
        _batch_size: usize,
    ) -> Result<BTreeMap<String, (StorageId, FieldMap)>, ImportError> {
        Ok(uuids
            .iter()
            .filter_map(|uuid| match self.row(EntityKind::Node, uuid)? {
                EntityRow::Node(node) => {
                    let id = self.rows.get(&EntityKind::Node)?.get(uuid)?.0;
                    Some((uuid.clone(), (id, node.extras.clone())))
                }
                _ => None,
            })
            .collect())
    }

    fn update_node_extras(&mut self, id: StorageId, extras: &FieldMap) -> Result<(), ImportError> {
        for (row_id, row) in self.rows_mut(EntityKind::Node) {
            if let (true, EntityRow::Node(node)) = (*row_id == id, row) {
                node.extras = extras.clone();
            }
        }
        Ok(())
    }

    fn find_comment(&mut self, uuid: &str) -> Result<Option<ExistingComment>, ImportError> {
        let Some((id, EntityRow::Comment(comment))) =
            self.rows.get(&EntityKind::Comment).and_then(|rows| rows.get(uuid))
        else {
            return Ok(None);
        };
        Ok(Some(ExistingComment { id: *id, mtime: comment.mtime, content: comment.content.clone() }))
    }

    fn update_comment(
        &mut self,
        id: StorageId,
        content: &str,
        mtime: OffsetDateTime,
    ) -> Result<(), ImportError> {
        for (row_id, row) in self.rows_mut(EntityKind::Comment) {
            if let (true, EntityRow::Comment(comment)) = (*row_id == id, row) {
                comment.content = content.to_string();
                comment.mtime = mtime;
            }
        }
        Ok(())
    }

    fn all_links(&mut self) -> Result<Vec<LinkRow>, ImportError> {
        Ok(self.links.clone())
    }

    fn node_summaries(
        &mut self,
        ids: &BTreeSet<StorageId>,
        _batch_size: usize,
    ) -> Result<BTreeMap<StorageId, NodeSummary>, ImportError> {
        Ok(self
            .rows
            .get(&EntityKind::Node)
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter_map(|(id, row)| match row {
                EntityRow::Node(node) if ids.contains(id) => Some((
                    *id,
                    NodeSummary { uuid: node.uuid.clone(), node_type: node.node_type.clone() },
                )),
                _ => None,
            })
            .collect())
    }

    fn insert_links(&mut self, links: &[LinkRow], _batch_size: usize) -> Result<(), ImportError> {
        if self.fail_link_insert {
            return Err(ImportError::Storage("link table is read-only".to_string()));
        }
        self.links.extend_from_slice(links);
        Ok(())
    }

    fn add_group_members(
        &mut self,
        group_id: StorageId,
        node_ids: &BTreeSet<StorageId>,
        _batch_size: usize,
    ) -> Result<(), ImportError> {
        self.members.extend(node_ids.iter().map(|node| (group_id, *node)));
        Ok(())
    }

    fn find_group_by_label(&mut self, label: &str) -> Result<Option<StorageId>, ImportError> {
        Ok(self.rows.get(&EntityKind::Group).into_iter().flat_map(BTreeMap::values).find_map(
            |(id, row)| match row {
                EntityRow::Group(group) if group.label == label => Some(*id),
                _ => None,
            },
        ))
    }

    fn create_group(
        &mut self,
        uuid: &str,
        label: &str,
        type_string: &str,
    ) -> Result<StorageId, ImportError> {
        let id = self.allocate();
        let row = EntityRow::Group(GroupRow {
            uuid: uuid.to_string(),
            label: label.to_string(),
            type_string: type_string.to_string(),
            description: String::new(),
            time: OffsetDateTime::now_utc(),
            user: 0,
            extras: FieldMap::new(),
        });
        self.rows.entry(EntityKind::Group).or_default().insert(uuid.to_string(), (id, row));
        Ok(id)
    }
}

/// Backend whose transactions work on a scratch copy of the state.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryBackend {
    pub state: MemoryState,
}

impl ImportBackend for MemoryBackend {
    fn atomic(
        &mut self,
        work: &mut dyn FnMut(&mut dyn ImportStore) -> Result<(), ImportError>,
    ) -> Result<(), ImportError> {
        let mut scratch = self.state.clone();
        work(&mut scratch)?;
        self.state = scratch;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub(crate) struct RecordingRepository {
    pub staged: RefCell<Vec<String>>,
}

impl RepositoryCopier for RecordingRepository {
    fn stage_nodes(&self, uuids: &[String], _reader: &dyn ArchiveReader) -> Result<(), ImportError> {
        self.staged.borrow_mut().extend(uuids.iter().cloned());
        Ok(())
    }
}
