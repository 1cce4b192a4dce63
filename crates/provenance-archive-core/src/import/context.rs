use std::collections::BTreeMap;

use serde_json::Value;

use crate::entity::EntityKind;
use crate::reader::ArchiveReader;
use crate::store::StorageId;
use crate::ImportError;

/// Resolution tables of one import run.
///
/// Maps archive-local ids to unique identifiers, and unique identifiers to the
/// storage ids they were matched or persisted under. Built fresh per run and
/// dropped with it.
#[derive(Debug, Clone, Default)]
pub struct ImportContext {
    import_unique_ids: BTreeMap<EntityKind, BTreeMap<i64, String>>,
    storage_ids: BTreeMap<EntityKind, BTreeMap<String, StorageId>>,
}

impl ImportContext {
    /// Read the unique identifier of every archived record of the given kinds.
    ///
    /// # Errors
    /// Returns [`ImportError::CorruptArchive`] when a record lacks its unique
    /// identifier or carries it as something other than a string.
    pub fn from_reader(reader: &dyn ArchiveReader, kinds: &[EntityKind]) -> Result<Self, ImportError> {
        let mut context = Self::default();
        for kind in kinds {
            let field = kind.unique_identifier();
            for entry in reader.iter_entity_fields(kind.as_str(), Some(&[field][..])) {
                let unique_id = match entry.fields.get(field) {
                    Some(Value::String(value)) if !value.is_empty() => value.clone(),
                    _ => {
                        return Err(ImportError::CorruptArchive(format!(
                            "{kind} record {} has no usable `{field}`",
                            entry.import_id
                        )))
                    }
                };
                context.register_import_id(*kind, entry.import_id, unique_id);
            }
        }
        Ok(context)
    }

    pub fn register_import_id(&mut self, kind: EntityKind, import_id: i64, unique_id: String) {
        self.import_unique_ids.entry(kind).or_default().insert(import_id, unique_id);
    }

    #[must_use]
    pub fn unique_id(&self, kind: EntityKind, import_id: i64) -> Option<&str> {
        self.import_unique_ids.get(&kind)?.get(&import_id).map(String::as_str)
    }

    pub fn record_storage_id(&mut self, kind: EntityKind, unique_id: &str, id: StorageId) {
        self.storage_ids.entry(kind).or_default().insert(unique_id.to_string(), id);
    }

    #[must_use]
    pub fn storage_id(&self, kind: EntityKind, unique_id: &str) -> Option<StorageId> {
        self.storage_ids.get(&kind)?.get(unique_id).copied()
    }

    /// Every storage id known for `kind`, keyed by unique identifier.
    #[must_use]
    pub fn storage_ids(&self, kind: EntityKind) -> Option<&BTreeMap<String, StorageId>> {
        self.storage_ids.get(&kind)
    }

    /// Translate a foreign key held as an archive-local id into a storage id.
    ///
    /// # Errors
    /// Returns [`ImportError::ArchiveImport`] when either hop is unknown, which
    /// means the referenced type was not materialized first.
    pub fn resolve_foreign_key(
        &self,
        required: EntityKind,
        import_id: i64,
    ) -> Result<StorageId, ImportError> {
        let unique_id = self.unique_id(required, import_id).ok_or_else(|| {
            ImportError::ArchiveImport(format!(
                "archive-local {required} id {import_id} is not present in the archive"
            ))
        })?;
        self.storage_id(required, unique_id).ok_or_else(|| {
            ImportError::ArchiveImport(format!(
                "{required} {unique_id} (archive id {import_id}) was referenced before it was stored"
            ))
        })
    }
}
