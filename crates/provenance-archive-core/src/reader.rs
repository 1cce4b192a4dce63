use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::entity::{EntityKind, FieldDescriptor, FieldMap};
use crate::link::LinkRecord;
use crate::ImportError;

/// Export format versions this importer understands.
pub const SUPPORTED_EXPORT_VERSIONS: &[&str] = &["0.9", CURRENT_EXPORT_VERSION];

const CURRENT_EXPORT_VERSION: &str = "0.10";

const METADATA_FILE: &str = "metadata.json";
const DATA_FILE: &str = "data.json";
const NODES_DIR: &str = "nodes";

/// Archive-wide metadata: format version, identifier fields, field descriptors.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveMetadata {
    pub export_version: String,
    #[serde(default)]
    pub unique_identifiers: BTreeMap<String, String>,
    #[serde(default)]
    pub all_fields_info: BTreeMap<String, BTreeMap<String, FieldDescriptor>>,
}

impl ArchiveMetadata {
    /// Metadata describing the current export layout of all six entity types.
    #[must_use]
    pub fn current() -> Self {
        let descriptor = |requires: Option<EntityKind>, date: bool| FieldDescriptor {
            requires: requires.map(|kind| kind.as_str().to_string()),
            related_name: None,
            convert_type: date.then(|| "date".to_string()),
        };
        let plain = || descriptor(None, false);
        let date = || descriptor(None, true);
        let fields = |entries: Vec<(&str, FieldDescriptor)>| {
            entries
                .into_iter()
                .map(|(name, field)| (name.to_string(), field))
                .collect::<BTreeMap<_, _>>()
        };

        let mut all_fields_info = BTreeMap::new();
        all_fields_info.insert(
            EntityKind::User.as_str().to_string(),
            fields(vec![
                ("email", plain()),
                ("first_name", plain()),
                ("last_name", plain()),
                ("institution", plain()),
            ]),
        );
        all_fields_info.insert(
            EntityKind::Computer.as_str().to_string(),
            fields(vec![
                ("uuid", plain()),
                ("name", plain()),
                ("hostname", plain()),
                ("description", plain()),
                ("scheduler_type", plain()),
                ("transport_type", plain()),
                ("metadata", plain()),
            ]),
        );
        all_fields_info.insert(
            EntityKind::Node.as_str().to_string(),
            fields(vec![
                ("uuid", plain()),
                ("label", plain()),
                ("description", plain()),
                ("node_type", plain()),
                ("process_type", plain()),
                ("ctime", date()),
                ("mtime", date()),
                ("user", descriptor(Some(EntityKind::User), false)),
                ("dbcomputer", descriptor(Some(EntityKind::Computer), false)),
                ("attributes", plain()),
                ("extras", plain()),
            ]),
        );
        all_fields_info.insert(
            EntityKind::Group.as_str().to_string(),
            fields(vec![
                ("uuid", plain()),
                ("label", plain()),
                ("type_string", plain()),
                ("description", plain()),
                ("time", date()),
                ("user", descriptor(Some(EntityKind::User), false)),
                ("extras", plain()),
            ]),
        );
        all_fields_info.insert(
            EntityKind::Log.as_str().to_string(),
            fields(vec![
                ("uuid", plain()),
                ("time", date()),
                ("loggername", plain()),
                ("levelname", plain()),
                ("dbnode", descriptor(Some(EntityKind::Node), false)),
                ("message", plain()),
                ("metadata", plain()),
            ]),
        );
        all_fields_info.insert(
            EntityKind::Comment.as_str().to_string(),
            fields(vec![
                ("uuid", plain()),
                ("ctime", date()),
                ("mtime", date()),
                ("content", plain()),
                ("dbnode", descriptor(Some(EntityKind::Node), false)),
                ("user", descriptor(Some(EntityKind::User), false)),
            ]),
        );

        let unique_identifiers = EntityKind::ALL
            .iter()
            .map(|kind| (kind.as_str().to_string(), kind.unique_identifier().to_string()))
            .collect();

        Self {
            export_version: CURRENT_EXPORT_VERSION.to_string(),
            unique_identifiers,
            all_fields_info,
        }
    }
}

/// One archived record with the id it carries inside the archive.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    pub import_id: i64,
    pub fields: FieldMap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembers {
    pub group_uuid: String,
    pub node_uuids: Vec<String>,
}

/// Read access to an archive. Implementations must be cheap to iterate more
/// than once.
pub trait ArchiveReader {
    /// # Errors
    /// Returns [`ImportError::IncompatibleVersion`] for unsupported formats.
    fn check_version(&self) -> Result<(), ImportError>;

    fn metadata(&self) -> &ArchiveMetadata;

    /// Entity type names present in the archive, unknown ones included.
    fn entity_names(&self) -> Vec<String>;

    fn entity_count(&self, name: &str) -> usize;

    /// Iterate records of one entity type, optionally projected onto `fields`.
    fn iter_entity_fields(
        &self,
        name: &str,
        fields: Option<&[&str]>,
    ) -> Box<dyn Iterator<Item = ArchiveEntry> + '_>;

    fn link_count(&self) -> usize;

    fn iter_link_data(&self) -> Box<dyn Iterator<Item = LinkRecord> + '_>;

    fn iter_group_uuids(&self) -> Box<dyn Iterator<Item = GroupMembers> + '_>;

    fn iter_node_uuids(&self) -> Box<dyn Iterator<Item = String> + '_> {
        Box::new(
            self.iter_entity_fields(EntityKind::Node.as_str(), Some(&["uuid"][..]))
                .filter_map(|entry| entry.fields.get("uuid")?.as_str().map(str::to_string)),
        )
    }

    /// Folder holding the repository payload of one node, if the archive has one.
    fn node_repository(&self, _uuid: &str) -> Option<PathBuf> {
        None
    }
}

/// Serialized contents of `data.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ArchiveData {
    /// Entity name, then archive-local id, then fields.
    #[serde(default)]
    pub export_data: BTreeMap<String, BTreeMap<String, FieldMap>>,
    #[serde(default)]
    pub links_uuid: Vec<LinkRecord>,
    #[serde(default)]
    pub groups_uuid: BTreeMap<String, Vec<String>>,
}

/// Archive held in memory, loaded from an extracted folder or built directly.
#[derive(Debug, Clone)]
pub struct JsonArchive {
    metadata: ArchiveMetadata,
    entities: BTreeMap<String, Vec<ArchiveEntry>>,
    links: Vec<LinkRecord>,
    groups: Vec<GroupMembers>,
    root: Option<PathBuf>,
}

impl JsonArchive {
    /// Load an extracted archive folder (`metadata.json`, `data.json`, `nodes/`).
    ///
    /// # Errors
    /// Returns [`ImportError::CorruptArchive`] when a file is missing or malformed.
    pub fn open(path: &Path) -> Result<Self, ImportError> {
        if !path.is_dir() {
            return Err(ImportError::CorruptArchive(format!(
                "archive path is not an extracted folder: {}",
                path.display()
            )));
        }
        let metadata: ArchiveMetadata = read_json(&path.join(METADATA_FILE))?;
        let data: ArchiveData = read_json(&path.join(DATA_FILE))?;
        let mut archive = Self::from_parts(metadata, data)?;
        archive.root = Some(path.to_path_buf());
        Ok(archive)
    }

    /// # Errors
    /// Returns [`ImportError::CorruptArchive`] when an archive-local id is not an integer.
    pub fn from_parts(metadata: ArchiveMetadata, data: ArchiveData) -> Result<Self, ImportError> {
        let mut entities = BTreeMap::new();
        for (name, records) in data.export_data {
            let mut entries = Vec::with_capacity(records.len());
            for (raw_id, fields) in records {
                let import_id = raw_id.parse::<i64>().map_err(|_| {
                    ImportError::CorruptArchive(format!(
                        "{name} record key `{raw_id}` is not an integer id"
                    ))
                })?;
                entries.push(ArchiveEntry { import_id, fields });
            }
            entries.sort_by_key(|entry| entry.import_id);
            entities.insert(name, entries);
        }

        let groups = data
            .groups_uuid
            .into_iter()
            .map(|(group_uuid, node_uuids)| GroupMembers { group_uuid, node_uuids })
            .collect();

        Ok(Self { metadata, entities, links: data.links_uuid, groups, root: None })
    }
}

impl ArchiveReader for JsonArchive {
    fn check_version(&self) -> Result<(), ImportError> {
        if SUPPORTED_EXPORT_VERSIONS.contains(&self.metadata.export_version.as_str()) {
            return Ok(());
        }
        Err(ImportError::IncompatibleVersion(format!(
            "archive export version {} is not supported; supported versions are {}",
            self.metadata.export_version,
            SUPPORTED_EXPORT_VERSIONS.join(", ")
        )))
    }

    fn metadata(&self) -> &ArchiveMetadata {
        &self.metadata
    }

    fn entity_names(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    fn entity_count(&self, name: &str) -> usize {
        self.entities.get(name).map_or(0, Vec::len)
    }

    fn iter_entity_fields(
        &self,
        name: &str,
        fields: Option<&[&str]>,
    ) -> Box<dyn Iterator<Item = ArchiveEntry> + '_> {
        let Some(entries) = self.entities.get(name) else {
            return Box::new(std::iter::empty());
        };
        let wanted: Option<Vec<String>> =
            fields.map(|names| names.iter().map(|name| (*name).to_string()).collect());
        Box::new(entries.iter().map(move |entry| project(entry, wanted.as_ref())))
    }

    fn link_count(&self) -> usize {
        self.links.len()
    }

    fn iter_link_data(&self) -> Box<dyn Iterator<Item = LinkRecord> + '_> {
        Box::new(self.links.iter().cloned())
    }

    fn iter_group_uuids(&self) -> Box<dyn Iterator<Item = GroupMembers> + '_> {
        Box::new(self.groups.iter().cloned())
    }

    fn node_repository(&self, uuid: &str) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(NODES_DIR).join(node_shard_path(uuid)))
    }
}

fn project(entry: &ArchiveEntry, wanted: Option<&Vec<String>>) -> ArchiveEntry {
    let Some(wanted) = wanted else {
        return entry.clone();
    };
    let fields = entry
        .fields
        .iter()
        .filter(|(name, _)| wanted.contains(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    ArchiveEntry { import_id: entry.import_id, fields }
}

/// Sharded location of a node folder: `ab/cd/<rest of uuid>`.
#[must_use]
pub fn node_shard_path(uuid: &str) -> PathBuf {
    match (uuid.get(..2), uuid.get(2..4), uuid.get(4..)) {
        (Some(first), Some(second), Some(rest)) if !rest.is_empty() => {
            Path::new(first).join(second).join(rest)
        }
        _ => PathBuf::from(uuid),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ImportError> {
    let bytes = fs::read(path).map_err(|err| {
        ImportError::CorruptArchive(format!("failed to read {}: {err}", path.display()))
    })?;
    serde_json::from_slice(&bytes).map_err(|err| {
        ImportError::CorruptArchive(format!("failed to parse {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn fixture_data() -> Result<ArchiveData, serde_json::Error> {
        serde_json::from_value(json!({
            "export_data": {
                "Node": {
                    "10": {"uuid": "bbbb", "label": "ten"},
                    "2": {"uuid": "aaaa", "label": "two"}
                }
            },
            "links_uuid": [
                {"input": "aaaa", "output": "bbbb", "label": "result", "type": "create"}
            ],
            "groups_uuid": {"gggg": ["aaaa"]}
        }))
    }

    #[test]
    fn entries_iterate_in_numeric_id_order() -> Result<(), Box<dyn std::error::Error>> {
        let archive = JsonArchive::from_parts(ArchiveMetadata::current(), fixture_data()?)?;
        let ids = archive
            .iter_entity_fields("Node", None)
            .map(|entry| entry.import_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![2, 10]);
        assert_eq!(archive.iter_node_uuids().collect::<Vec<_>>(), vec!["aaaa", "bbbb"]);
        Ok(())
    }

    #[test]
    fn projection_keeps_only_requested_fields() -> Result<(), Box<dyn std::error::Error>> {
        let archive = JsonArchive::from_parts(ArchiveMetadata::current(), fixture_data()?)?;
        let first = archive
            .iter_entity_fields("Node", Some(&["uuid"][..]))
            .next()
            .ok_or("expected one node")?;
        assert_eq!(first.fields.len(), 1);
        assert_eq!(first.fields.get("uuid"), Some(&json!("aaaa")));
        Ok(())
    }

    #[test]
    fn non_integer_record_keys_are_corrupt() -> Result<(), serde_json::Error> {
        let data: ArchiveData = serde_json::from_value(json!({
            "export_data": {"User": {"abc": {"email": "x@example.com"}}}
        }))?;
        let result = JsonArchive::from_parts(ArchiveMetadata::current(), data);
        assert!(matches!(result, Err(ImportError::CorruptArchive(_))));
        Ok(())
    }

    #[test]
    fn version_check_rejects_unknown_versions() -> Result<(), ImportError> {
        let mut metadata = ArchiveMetadata::current();
        let archive = JsonArchive::from_parts(metadata.clone(), ArchiveData::default())?;
        archive.check_version()?;

        metadata.export_version = "0.4".to_string();
        let archive = JsonArchive::from_parts(metadata, ArchiveData::default())?;
        assert!(matches!(archive.check_version(), Err(ImportError::IncompatibleVersion(_))));
        Ok(())
    }

    #[test]
    fn node_folders_are_sharded_by_uuid_prefix() {
        assert_eq!(
            node_shard_path("12345678-aaaa"),
            Path::new("12").join("34").join("5678-aaaa")
        );
        assert_eq!(node_shard_path("abc"), PathBuf::from("abc"));
    }

    #[test]
    fn in_memory_archives_have_no_repository() -> Result<(), ImportError> {
        let archive = JsonArchive::from_parts(ArchiveMetadata::current(), ArchiveData::default())?;
        assert!(archive.node_repository("12345678").is_none());
        Ok(())
    }

    #[test]
    fn opening_a_missing_folder_is_corrupt() {
        let missing = std::env::temp_dir().join("provenance-archive-does-not-exist");
        assert!(matches!(JsonArchive::open(&missing), Err(ImportError::CorruptArchive(_))));
    }
}
