use std::collections::BTreeSet;

use tracing::warn;
use uuid::Uuid;

use crate::entity::EntityKind;
use crate::reader::ArchiveReader;
use crate::ImportError;

/// Validate the archive's entity types and field dependencies and return the
/// order in which they are imported.
///
/// # Errors
/// [`ImportError::Validation`] for an entity type or dependency outside the
/// known set, [`ImportError::ArchiveImport`] when a type depends on one that is
/// scheduled later, and [`ImportError::CorruptArchive`] when the archive
/// identifies a type by a field other than its unique identifier.
pub(crate) fn import_order(reader: &dyn ArchiveReader) -> Result<Vec<EntityKind>, ImportError> {
    for name in reader.entity_names() {
        if EntityKind::parse(&name).is_none() {
            return Err(ImportError::Validation(format!("unknown model `{name}` in archive")));
        }
    }

    let metadata = reader.metadata();
    for (name, field) in &metadata.unique_identifiers {
        let Some(kind) = EntityKind::parse(name) else {
            return Err(ImportError::Validation(format!(
                "unknown model `{name}` in archive unique identifiers"
            )));
        };
        if field != kind.unique_identifier() {
            return Err(ImportError::CorruptArchive(format!(
                "{kind} is identified by `{field}` in the archive, expected `{}`",
                kind.unique_identifier()
            )));
        }
    }

    let order = EntityKind::ALL.to_vec();
    for (position, kind) in order.iter().enumerate() {
        let Some(fields) = metadata.all_fields_info.get(kind.as_str()) else {
            continue;
        };
        for (field, descriptor) in fields {
            let Some(required) = descriptor.requires.as_deref() else {
                continue;
            };
            let Some(dependency) = EntityKind::parse(required) else {
                return Err(ImportError::Validation(format!(
                    "field `{field}` of {kind} requires unknown model `{required}`"
                )));
            };
            let scheduled = order.iter().position(|candidate| *candidate == dependency);
            if scheduled.map_or(true, |index| index >= position) {
                return Err(ImportError::ArchiveImport(format!(
                    "Entity {kind} requires {dependency} but would be loaded first"
                )));
            }
        }
    }
    Ok(order)
}

/// Node UUIDs referenced by links or group memberships but absent from the
/// archive's nodes. References that are not UUIDs are not counted.
pub(crate) fn dangling_node_uuids(reader: &dyn ArchiveReader) -> BTreeSet<String> {
    let mut referenced = BTreeSet::new();
    for link in reader.iter_link_data() {
        referenced.insert(link.input);
        referenced.insert(link.output);
    }
    for group in reader.iter_group_uuids() {
        referenced.extend(group.node_uuids);
    }
    referenced.retain(|candidate| Uuid::parse_str(candidate).is_ok());

    for uuid in reader.iter_node_uuids() {
        referenced.remove(&uuid);
    }
    referenced
}

/// Fail on dangling references unless unknown nodes are to be skipped.
///
/// # Errors
/// Returns [`ImportError::DanglingLink`] listing the unknown node UUIDs.
pub(crate) fn check_dangling(
    reader: &dyn ArchiveReader,
    ignore_unknown_nodes: bool,
) -> Result<(), ImportError> {
    let dangling = dangling_node_uuids(reader);
    if dangling.is_empty() {
        return Ok(());
    }
    let listed = dangling.iter().map(String::as_str).collect::<Vec<_>>().join(", ");
    if ignore_unknown_nodes {
        warn!(count = dangling.len(), nodes = %listed, "skipping references to unknown nodes");
        return Ok(());
    }
    Err(ImportError::DanglingLink(format!(
        "the archive references nodes it does not contain: {listed}"
    )))
}
