use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::entity::EntityKind;
use crate::import::context::ImportContext;
use crate::import::ImportOptions;
use crate::reader::ArchiveReader;
use crate::store::ImportStore;
use crate::ImportError;

/// Attach archived group members to their groups, one batched call per group.
///
/// # Errors
/// [`ImportError::ArchiveImport`] when a group was not materialized and
/// [`ImportError::DanglingLink`] for unknown members unless they are skipped.
pub(crate) fn import_group_members(
    store: &mut dyn ImportStore,
    reader: &dyn ArchiveReader,
    context: &ImportContext,
    options: &ImportOptions,
) -> Result<(), ImportError> {
    for group in reader.iter_group_uuids() {
        if group.node_uuids.is_empty() {
            continue;
        }
        let group_id = context.storage_id(EntityKind::Group, &group.group_uuid).ok_or_else(|| {
            ImportError::ArchiveImport(format!(
                "group {} has members but was not imported",
                group.group_uuid
            ))
        })?;

        let mut members = BTreeSet::new();
        for uuid in &group.node_uuids {
            match context.storage_id(EntityKind::Node, uuid) {
                Some(id) => {
                    members.insert(id);
                }
                None if options.ignore_unknown_nodes => {
                    warn!(group = %group.group_uuid, node = %uuid, "skipping unknown group member");
                }
                None => {
                    return Err(ImportError::DanglingLink(format!(
                        "group {} lists node {uuid}, which is not in the archive",
                        group.group_uuid
                    )))
                }
            }
        }

        if !members.is_empty() {
            store.add_group_members(group_id, &members, options.batch_size)?;
            debug!(group = %group.group_uuid, count = members.len(), "attached group members");
        }
    }
    Ok(())
}
