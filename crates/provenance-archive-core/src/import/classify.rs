use std::collections::BTreeSet;

use serde_json::Value;
use tracing::debug;

use crate::entity::{EntityKind, FieldMap};
use crate::import::context::ImportContext;
use crate::import::{ImportOptions, DUPLICATE_SUFFIX_PREFIX, MAX_COMPUTERS, MAX_GROUPS};
use crate::merge::NewExtrasMode;
use crate::reader::{ArchiveEntry, ArchiveReader};
use crate::store::ImportStore;
use crate::ImportError;

const INTERNAL_EXTRAS_PREFIX: &str = "_aiida_";
const CODE_NODE_SUFFIX: &str = "code.Code.";
const PROCESS_NODE_PREFIX: &str = "process.";
const CHECKPOINTS_ATTRIBUTE: &str = "checkpoints";

/// Archived records of one entity type split by whether the store already
/// holds them.
#[derive(Debug, Clone, Default)]
pub(crate) struct Partition {
    pub existing: Vec<ArchiveEntry>,
    pub new: Vec<ArchiveEntry>,
}

/// Names claimed by new groups and computers earlier in the same run.
#[derive(Debug, Default)]
pub(crate) struct ClaimedNames {
    groups: BTreeSet<String>,
    computers: BTreeSet<String>,
}

impl ClaimedNames {
    /// Claims with the target group label already taken, so no archived group
    /// is stored under it.
    pub(crate) fn reserving_group(label: Option<&str>) -> Self {
        let mut claimed = Self::default();
        claimed.groups.extend(label.map(str::to_string));
        claimed
    }
}

/// Partition the archived records of `kind` and seed the context with the
/// storage ids of the matched ones. New records are prepared for insertion:
/// colliding names are suffixed and node payloads are sanitized.
///
/// # Errors
/// Propagates storage errors, and returns [`ImportError::Uniqueness`] when a
/// colliding name cannot be disambiguated.
pub(crate) fn classify(
    store: &mut dyn ImportStore,
    reader: &dyn ArchiveReader,
    context: &mut ImportContext,
    claimed: &mut ClaimedNames,
    kind: EntityKind,
    options: &ImportOptions,
) -> Result<Partition, ImportError> {
    let entries = reader.iter_entity_fields(kind.as_str(), None).collect::<Vec<_>>();
    if entries.is_empty() {
        return Ok(Partition::default());
    }

    let mut keyed = Vec::with_capacity(entries.len());
    for entry in entries {
        let unique_id = context.unique_id(kind, entry.import_id).map(str::to_string).ok_or_else(
            || {
                ImportError::ArchiveImport(format!(
                    "{kind} record {} was not registered before classification",
                    entry.import_id
                ))
            },
        )?;
        keyed.push((unique_id, entry));
    }

    let wanted = keyed.iter().map(|(unique_id, _)| unique_id.clone()).collect::<BTreeSet<_>>();
    let found = store.find_existing(kind, &wanted, options.batch_size)?;

    let mut partition = Partition::default();
    let mut new_ids = BTreeSet::new();
    for (unique_id, mut entry) in keyed {
        if let Some(id) = found.get(&unique_id) {
            context.record_storage_id(kind, &unique_id, *id);
            partition.existing.push(entry);
            continue;
        }
        if !new_ids.insert(unique_id.clone()) {
            return Err(ImportError::CorruptArchive(format!(
                "{kind} {unique_id} appears more than once in the archive"
            )));
        }
        match kind {
            EntityKind::Group => {
                disambiguate(store, kind, "label", &mut claimed.groups, &mut entry.fields)?;
            }
            EntityKind::Computer => {
                disambiguate(store, kind, "name", &mut claimed.computers, &mut entry.fields)?;
            }
            EntityKind::Node => {
                sanitize_extras(&mut entry.fields, options.extras_mode_new);
                strip_checkpoints(&mut entry.fields);
            }
            EntityKind::User | EntityKind::Log | EntityKind::Comment => {}
        }
        partition.new.push(entry);
    }

    debug!(
        entity = %kind,
        existing = partition.existing.len(),
        new = partition.new.len(),
        "classified archive records"
    );
    Ok(partition)
}

/// Give a new group or computer a name no stored or already-claimed record
/// uses, appending ` (Imported #N)` with N counting from zero.
fn disambiguate(
    store: &mut dyn ImportStore,
    kind: EntityKind,
    field: &str,
    claimed: &mut BTreeSet<String>,
    fields: &mut FieldMap,
) -> Result<(), ImportError> {
    let Some(Value::String(original)) = fields.get(field).cloned() else {
        return Err(ImportError::CorruptArchive(format!("new {kind} has no `{field}`")));
    };
    let ceiling = if kind == EntityKind::Group { MAX_GROUPS } else { MAX_COMPUTERS };

    let mut candidate = original.clone();
    let mut counter = 0;
    while claimed.contains(&candidate) || store.name_in_use(kind, &candidate)? {
        if counter == ceiling {
            return Err(ImportError::Uniqueness(format!(
                "a {kind} named `{original}` already exists and no free alternative was found \
                 after {ceiling} attempts"
            )));
        }
        candidate = format!("{original}{DUPLICATE_SUFFIX_PREFIX}{counter})");
        counter += 1;
    }

    if candidate != original {
        debug!(entity = %kind, from = %original, to = %candidate, "renamed colliding record");
        fields.insert(field.to_string(), Value::String(candidate.clone()));
    }
    claimed.insert(candidate);
    Ok(())
}

/// Repair the extras of a new node: non-object payloads become empty, internal
/// keys are dropped, and so is the `hidden` flag of code nodes.
pub(crate) fn sanitize_extras(fields: &mut FieldMap, mode: NewExtrasMode) {
    let is_code = fields
        .get("node_type")
        .and_then(Value::as_str)
        .is_some_and(|node_type| node_type.ends_with(CODE_NODE_SUFFIX));

    let mut extras = match fields.remove("extras") {
        Some(Value::Object(extras)) if mode == NewExtrasMode::Import => extras,
        _ => FieldMap::new(),
    };
    extras.retain(|key, _| !key.starts_with(INTERNAL_EXTRAS_PREFIX));
    if is_code {
        extras.remove("hidden");
    }
    fields.insert("extras".to_string(), Value::Object(extras));
}

/// Drop the `checkpoints` attribute of process nodes.
pub(crate) fn strip_checkpoints(fields: &mut FieldMap) {
    let is_process = fields
        .get("node_type")
        .and_then(Value::as_str)
        .is_some_and(|node_type| node_type.starts_with(PROCESS_NODE_PREFIX));
    if !is_process {
        return;
    }
    if let Some(Value::Object(attributes)) = fields.get_mut("attributes") {
        attributes.remove(CHECKPOINTS_ATTRIBUTE);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::entity::EntityRow;
    use crate::import::testing::{archive, node_uuid, sample_data, MemoryState, TestResult};

    fn object(value: Value) -> FieldMap {
        match value {
            Value::Object(map) => map,
            _ => FieldMap::new(),
        }
    }

    #[test]
    fn matched_records_seed_the_context() -> TestResult {
        let reader = archive(sample_data())?;
        let mut context = ImportContext::from_reader(&reader, &EntityKind::ALL)?;
        let mut store = MemoryState::default();
        store.insert_entities(
            &[EntityRow::from_fields(
                EntityKind::User,
                object(json!({"email": "alice@example.com"})),
            )?],
            10,
        )?;

        let partition = classify(
            &mut store,
            &reader,
            &mut context,
            &mut ClaimedNames::default(),
            EntityKind::User,
            &ImportOptions::default(),
        )?;
        assert_eq!(partition.existing.len(), 1);
        assert!(partition.new.is_empty());
        assert_eq!(context.storage_id(EntityKind::User, "alice@example.com"), Some(1));
        Ok(())
    }

    #[test]
    fn colliding_group_labels_get_counted_suffixes() -> TestResult {
        let reader = archive(json!({
            "export_data": {"Group": {
                "1": {"uuid": node_uuid(1), "label": "batch", "time": "2020-01-01T00:00:00", "user": 1},
                "2": {"uuid": node_uuid(2), "label": "batch", "time": "2020-01-01T00:00:00", "user": 1},
                "3": {"uuid": node_uuid(3), "label": "batch", "time": "2020-01-01T00:00:00", "user": 1}
            }}
        }))?;
        let mut context = ImportContext::from_reader(&reader, &EntityKind::ALL)?;
        let partition = classify(
            &mut MemoryState::default(),
            &reader,
            &mut context,
            &mut ClaimedNames::default(),
            EntityKind::Group,
            &ImportOptions::default(),
        )?;

        let labels = partition
            .new
            .iter()
            .filter_map(|entry| entry.fields.get("label")?.as_str().map(str::to_string))
            .collect::<Vec<_>>();
        assert_eq!(labels, vec!["batch", "batch (Imported #0)", "batch (Imported #1)"]);
        Ok(())
    }

    #[test]
    fn target_group_label_is_not_given_to_an_archived_group() -> TestResult {
        let reader = archive(json!({
            "export_data": {"Group": {
                "1": {"uuid": node_uuid(1), "label": "batch", "time": "2020-01-01T00:00:00", "user": 1}
            }}
        }))?;
        let mut context = ImportContext::from_reader(&reader, &EntityKind::ALL)?;
        let partition = classify(
            &mut MemoryState::default(),
            &reader,
            &mut context,
            &mut ClaimedNames::reserving_group(Some("batch")),
            EntityKind::Group,
            &ImportOptions::default(),
        )?;

        let label = partition.new.first().and_then(|entry| entry.fields.get("label"));
        assert_eq!(label, Some(&json!("batch (Imported #0)")));
        Ok(())
    }

    #[test]
    fn exhausted_name_suffixes_fail_with_uniqueness() {
        let mut claimed = BTreeSet::from(["cluster".to_string()]);
        claimed.extend((0..MAX_COMPUTERS).map(|n| format!("cluster (Imported #{n})")));
        let mut fields = object(json!({"name": "cluster"}));

        let result = disambiguate(
            &mut MemoryState::default(),
            EntityKind::Computer,
            "name",
            &mut claimed,
            &mut fields,
        );
        assert!(matches!(result, Err(ImportError::Uniqueness(_))));
    }

    #[test]
    fn new_nodes_lose_internal_extras_and_checkpoints() {
        let mut fields = object(json!({
            "node_type": "process.calculation.calcjob.CalcJobNode.",
            "attributes": {"checkpoints": "blob", "exit_status": 0},
            "extras": {"_aiida_hash": "abc", "tag": "run"}
        }));
        sanitize_extras(&mut fields, NewExtrasMode::Import);
        strip_checkpoints(&mut fields);
        assert_eq!(fields.get("extras"), Some(&json!({"tag": "run"})));
        assert_eq!(fields.get("attributes"), Some(&json!({"exit_status": 0})));
    }

    #[test]
    fn code_nodes_lose_hidden_and_data_keeps_checkpoints() {
        let mut code = object(json!({"node_type": "data.core.code.Code.", "extras": {"hidden": true, "x": 1}}));
        sanitize_extras(&mut code, NewExtrasMode::Import);
        assert_eq!(code.get("extras"), Some(&json!({"x": 1})));

        let mut data = object(json!({"node_type": "data.core.dict.Dict.", "attributes": {"checkpoints": 1}}));
        strip_checkpoints(&mut data);
        assert_eq!(data.get("attributes"), Some(&json!({"checkpoints": 1})));
    }

    #[test]
    fn extras_are_dropped_or_repaired() {
        let mut skipped = object(json!({"node_type": "data.", "extras": {"a": 1}}));
        sanitize_extras(&mut skipped, NewExtrasMode::None);
        assert_eq!(skipped.get("extras"), Some(&json!({})));

        let mut malformed = object(json!({"node_type": "data.", "extras": null}));
        sanitize_extras(&mut malformed, NewExtrasMode::Import);
        assert_eq!(malformed.get("extras"), Some(&json!({})));
    }
}
