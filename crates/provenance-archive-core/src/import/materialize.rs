use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::entity::{
    format_rfc3339, parse_archive_date, EntityKind, EntityRow, FieldDescriptor, FieldMap,
};
use crate::import::classify::Partition;
use crate::import::context::ImportContext;
use crate::import::{EntityOutcome, ImportOptions};
use crate::merge::{merge_comment, merge_extras, CommentMerge, ExtrasConflictResolver};
use crate::reader::{ArchiveEntry, ArchiveReader};
use crate::store::{ImportStore, RepositoryCopier};
use crate::ImportError;

/// Collaborators and policies shared by every materialization step of a run.
pub(crate) struct Materializer<'run> {
    pub reader: &'run dyn ArchiveReader,
    pub repository: &'run dyn RepositoryCopier,
    pub options: &'run ImportOptions,
    pub resolver: &'run mut dyn ExtrasConflictResolver,
}

impl Materializer<'_> {
    /// Merge the matched records of one type into their stored rows, then
    /// persist the new ones in bulk and record their storage ids.
    ///
    /// # Errors
    /// Fails on unresolved foreign keys, malformed records, repository staging
    /// errors, and storage errors.
    pub(crate) fn materialize(
        &mut self,
        store: &mut dyn ImportStore,
        context: &mut ImportContext,
        kind: EntityKind,
        partition: Partition,
    ) -> Result<EntityOutcome, ImportError> {
        let descriptors =
            self.reader.metadata().all_fields_info.get(kind.as_str()).cloned().unwrap_or_default();
        let mut outcome = EntityOutcome::default();

        let promoted = match kind {
            EntityKind::Comment => {
                self.merge_comments(store, context, &descriptors, &partition.existing, &mut outcome)?
            }
            EntityKind::Node => {
                self.merge_node_extras(
                    store,
                    context,
                    &descriptors,
                    &partition.existing,
                    &mut outcome,
                )?;
                Vec::new()
            }
            _ => {
                record_existing(context, kind, &descriptors, &partition.existing, &mut outcome)?;
                Vec::new()
            }
        };

        let mut new_entries = partition.new;
        new_entries.extend(promoted);
        if !new_entries.is_empty() {
            self.insert_new(store, context, kind, &descriptors, new_entries, &mut outcome)?;
        }
        Ok(outcome)
    }

    /// Reconcile archived comments with stored ones. Imported comments that lose
    /// to a newer, divergent stored one are returned under a fresh UUID so they
    /// can be inserted as new.
    fn merge_comments(
        &self,
        store: &mut dyn ImportStore,
        context: &ImportContext,
        descriptors: &BTreeMap<String, FieldDescriptor>,
        existing: &[ArchiveEntry],
        outcome: &mut EntityOutcome,
    ) -> Result<Vec<ArchiveEntry>, ImportError> {
        let resolved = record_existing(context, EntityKind::Comment, descriptors, existing, outcome)?;

        let mut promoted = Vec::new();
        for (entry, fields) in existing.iter().zip(resolved) {
            let EntityRow::Comment(imported) = EntityRow::from_fields(EntityKind::Comment, fields)?
            else {
                continue;
            };
            let Some(stored) = store.find_comment(&imported.uuid)? else {
                return Err(ImportError::ArchiveImport(format!(
                    "Comment {} was matched but could not be loaded",
                    imported.uuid
                )));
            };

            match merge_comment(
                self.options.comment_mode,
                stored.mtime,
                &stored.content,
                imported.mtime,
                &imported.content,
            ) {
                CommentMerge::Unchanged => {}
                CommentMerge::Overwrite => {
                    store.set_auto_now(false)?;
                    let updated = store.update_comment(stored.id, &imported.content, imported.mtime);
                    store.set_auto_now(true)?;
                    updated?;
                }
                CommentMerge::Promote => {
                    let mut fields = entry.fields.clone();
                    let fresh = Uuid::new_v4().to_string();
                    debug!(from = %imported.uuid, to = %fresh, "importing newer-diverged comment as new");
                    fields.insert("uuid".to_string(), Value::String(fresh));
                    promoted.push(ArchiveEntry { import_id: entry.import_id, fields });
                }
            }
        }
        Ok(promoted)
    }

    fn merge_node_extras(
        &mut self,
        store: &mut dyn ImportStore,
        context: &ImportContext,
        descriptors: &BTreeMap<String, FieldDescriptor>,
        existing: &[ArchiveEntry],
        outcome: &mut EntityOutcome,
    ) -> Result<(), ImportError> {
        record_existing(context, EntityKind::Node, descriptors, existing, outcome)?;
        if existing.is_empty() {
            return Ok(());
        }

        let mut imported = BTreeMap::new();
        for entry in existing {
            let uuid = entry_unique_id(EntityKind::Node, entry)?;
            let extras = match entry.fields.get("extras") {
                Some(Value::Object(extras)) => extras.clone(),
                _ => FieldMap::new(),
            };
            imported.insert(uuid, extras);
        }

        let uuids = imported.keys().cloned().collect::<BTreeSet<_>>();
        let stored = store.node_extras(&uuids, self.options.batch_size)?;
        let mut updated = 0_usize;
        for (uuid, new_extras) in &imported {
            let Some((id, old_extras)) = stored.get(uuid) else {
                return Err(ImportError::ArchiveImport(format!(
                    "Node {uuid} was matched but its extras could not be loaded"
                )));
            };
            let merged = merge_extras(
                old_extras,
                new_extras,
                self.options.extras_mode_existing,
                &mut *self.resolver,
            )?;
            if merged != *old_extras {
                store.update_node_extras(*id, &merged)?;
                updated += 1;
            }
        }
        debug!(updated, "merged extras of existing nodes");
        Ok(())
    }

    fn insert_new(
        &self,
        store: &mut dyn ImportStore,
        context: &mut ImportContext,
        kind: EntityKind,
        descriptors: &BTreeMap<String, FieldDescriptor>,
        entries: Vec<ArchiveEntry>,
        outcome: &mut EntityOutcome,
    ) -> Result<(), ImportError> {
        let mut rows = Vec::with_capacity(entries.len());
        let mut keys = Vec::with_capacity(entries.len());
        for entry in &entries {
            let fields = deserialize_fields(kind, entry, descriptors, context)?;
            let row = EntityRow::from_fields(kind, fields)?;
            keys.push((entry.import_id, row.unique_id().to_string()));
            rows.push(row);
        }

        if kind == EntityKind::Node {
            let uuids = keys.iter().map(|(_, uuid)| uuid.clone()).collect::<Vec<_>>();
            self.repository.stage_nodes(&uuids, self.reader)?;
        }

        store.set_auto_now(false)?;
        let inserted = store.insert_entities(&rows, self.options.batch_size);
        store.set_auto_now(true)?;
        inserted?;

        let wanted = keys.iter().map(|(_, unique_id)| unique_id.clone()).collect::<BTreeSet<_>>();
        let assigned = store.find_existing(kind, &wanted, self.options.batch_size)?;
        for (import_id, unique_id) in keys {
            let id = assigned.get(&unique_id).copied().ok_or_else(|| {
                ImportError::ArchiveImport(format!(
                    "{kind} {unique_id} was inserted but its storage id could not be read back"
                ))
            })?;
            context.record_storage_id(kind, &unique_id, id);
            outcome.new.push((import_id, id));
        }
        debug!(entity = %kind, count = outcome.new.len(), "stored new records");
        Ok(())
    }
}

/// Report matched records under their stored ids. Their foreign keys and dates
/// are still resolved, so a matched record pointing at an entity the run cannot
/// place fails the same way a new one would.
fn record_existing(
    context: &ImportContext,
    kind: EntityKind,
    descriptors: &BTreeMap<String, FieldDescriptor>,
    entries: &[ArchiveEntry],
    outcome: &mut EntityOutcome,
) -> Result<Vec<FieldMap>, ImportError> {
    let mut resolved = Vec::with_capacity(entries.len());
    for entry in entries {
        resolved.push(deserialize_fields(kind, entry, descriptors, context)?);
        let unique_id = entry_unique_id(kind, entry)?;
        let id = context.storage_id(kind, &unique_id).ok_or_else(|| {
            ImportError::ArchiveImport(format!("existing {kind} {unique_id} has no storage id"))
        })?;
        outcome.existing.push((entry.import_id, id));
    }
    Ok(resolved)
}

fn entry_unique_id(kind: EntityKind, entry: &ArchiveEntry) -> Result<String, ImportError> {
    let field = kind.unique_identifier();
    entry.fields.get(field).and_then(Value::as_str).map(str::to_string).ok_or_else(|| {
        ImportError::CorruptArchive(format!("{kind} record {} has no `{field}`", entry.import_id))
    })
}

/// Rewrite foreign keys from archive-local ids to storage ids and normalize
/// date fields to RFC 3339.
///
/// # Errors
/// [`ImportError::ArchiveImport`] for a foreign key that does not resolve and
/// [`ImportError::CorruptArchive`] for values of the wrong shape.
pub(crate) fn deserialize_fields(
    kind: EntityKind,
    entry: &ArchiveEntry,
    descriptors: &BTreeMap<String, FieldDescriptor>,
    context: &ImportContext,
) -> Result<FieldMap, ImportError> {
    let mut fields = entry.fields.clone();
    for (name, descriptor) in descriptors {
        let Some(value) = fields.get_mut(name) else {
            continue;
        };
        if value.is_null() {
            continue;
        }

        if let Some(required) = descriptor.requires.as_deref() {
            let required = EntityKind::parse(required).ok_or_else(|| {
                ImportError::ArchiveImport(format!("{kind}.{name} requires unknown model {required}"))
            })?;
            let import_id = value.as_i64().ok_or_else(|| {
                ImportError::CorruptArchive(format!(
                    "{kind} record {}: `{name}` must be an archive id, found {value}",
                    entry.import_id
                ))
            })?;
            *value = Value::from(context.resolve_foreign_key(required, import_id)?);
        } else if descriptor.is_date() {
            let parsed = value.as_str().and_then(parse_archive_date).ok_or_else(|| {
                ImportError::CorruptArchive(format!(
                    "{kind} record {}: `{name}` is not a timestamp: {value}",
                    entry.import_id
                ))
            })?;
            *value = Value::String(format_rfc3339(parsed)?);
        }
    }
    Ok(fields)
}
