//! The import run: pre-flight checks, classification, materialization, links
//! and group membership inside one transaction, then the import group in a
//! second one.
//!
//! A failure after the main transaction committed leaves the imported
//! entities in place without the import group. Concurrent runs against the
//! same store are not coordinated; callers must serialize them.

mod classify;
mod context;
mod groups;
mod links;
mod materialize;
mod order;
#[cfg(test)]
mod testing;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

pub use context::ImportContext;

use crate::entity::EntityKind;
use crate::merge::{CommentMode, ExtrasConflictResolver, ExtrasMode, NewExtrasMode};
use crate::reader::{ArchiveReader, JsonArchive};
use crate::store::{ImportBackend, ImportStore, RepositoryCopier, StorageId};
use crate::ImportError;
use classify::{classify, ClaimedNames};
use materialize::Materializer;

/// Most suffix attempts when a new group label collides.
pub const MAX_GROUPS: usize = 100;
/// Most suffix attempts when a new computer name collides.
pub const MAX_COMPUTERS: usize = 100;
/// Start of the suffix appended to colliding names: ` (Imported #N)`.
pub const DUPLICATE_SUFFIX_PREFIX: &str = " (Imported #";
/// Type string of the group collecting the nodes of one run.
pub const IMPORT_GROUP_TYPE: &str = "core.import";

const DEFAULT_BATCH_SIZE: usize = 1000;

/// Caller-tunable policies of one import run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ImportOptions {
    /// Label of the group that receives every imported node. A timestamped
    /// group is created when unset.
    pub target_group: Option<String>,
    pub ignore_unknown_nodes: bool,
    pub extras_mode_existing: ExtrasMode,
    pub extras_mode_new: NewExtrasMode,
    pub comment_mode: CommentMode,
    pub batch_size: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            target_group: None,
            ignore_unknown_nodes: false,
            extras_mode_existing: ExtrasMode::default(),
            extras_mode_new: NewExtrasMode::default(),
            comment_mode: CommentMode::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl ImportOptions {
    /// # Errors
    /// Returns [`ImportError::Validation`] for a zero batch size or an empty
    /// target group label.
    pub fn validate(&self) -> Result<(), ImportError> {
        if self.batch_size == 0 {
            return Err(ImportError::Validation("batch_size must be at least 1".to_string()));
        }
        if self.target_group.as_deref().is_some_and(|label| label.trim().is_empty()) {
            return Err(ImportError::Validation("target group label cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// `(archive-local id, storage id)` pairs of one entity type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityOutcome {
    pub new: Vec<(i64, StorageId)>,
    pub existing: Vec<(i64, StorageId)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportResult {
    pub entities: BTreeMap<EntityKind, EntityOutcome>,
    /// `(source, target)` storage ids of the links created by the run.
    pub links: Vec<(StorageId, StorageId)>,
}

impl ImportResult {
    #[must_use]
    pub fn new_count(&self, kind: EntityKind) -> usize {
        self.entities.get(&kind).map_or(0, |outcome| outcome.new.len())
    }

    #[must_use]
    pub fn existing_count(&self, kind: EntityKind) -> usize {
        self.entities.get(&kind).map_or(0, |outcome| outcome.existing.len())
    }

    /// Storage ids of every node the run created or matched.
    #[must_use]
    pub fn node_ids(&self) -> BTreeSet<StorageId> {
        self.entities
            .get(&EntityKind::Node)
            .map(|outcome| {
                outcome.new.iter().chain(&outcome.existing).map(|(_, id)| *id).collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportReport {
    pub result: ImportResult,
    /// Label of the group holding this run's nodes, if one was made or reused.
    pub group_label: Option<String>,
}

/// Import an extracted archive folder.
///
/// # Errors
/// See [`import_data`]; unreadable folders fail with
/// [`ImportError::CorruptArchive`].
pub fn import_archive(
    path: &Path,
    backend: &mut dyn ImportBackend,
    repository: &dyn RepositoryCopier,
    options: &ImportOptions,
    resolver: &mut dyn ExtrasConflictResolver,
) -> Result<ImportReport, ImportError> {
    options.validate()?;
    info!(path = %path.display(), "opening archive");
    let reader = JsonArchive::open(path)?;
    import_data(&reader, backend, repository, options, resolver)
}

/// Merge an archive into the store behind `backend`.
///
/// Every entity, link and membership is written in one transaction, so any
/// error leaves the store as it was. The import group is attached afterwards in
/// its own transaction.
///
/// # Errors
/// Any [`ImportError`]; none are retried.
pub fn import_data(
    reader: &dyn ArchiveReader,
    backend: &mut dyn ImportBackend,
    repository: &dyn RepositoryCopier,
    options: &ImportOptions,
    resolver: &mut dyn ExtrasConflictResolver,
) -> Result<ImportReport, ImportError> {
    options.validate()?;
    reader.check_version()?;
    info!(
        export_version = %reader.metadata().export_version,
        target_group = options.target_group.as_deref().unwrap_or("<auto>"),
        ignore_unknown_nodes = options.ignore_unknown_nodes,
        extras_mode_existing = %options.extras_mode_existing,
        extras_mode_new = options.extras_mode_new.as_str(),
        comment_mode = options.comment_mode.as_str(),
        "starting archive import"
    );

    let order = order::import_order(reader)?;
    order::check_dangling(reader, options.ignore_unknown_nodes)?;
    let mut context = ImportContext::from_reader(reader, &order)?;
    debug!(entities = ?order, links = reader.link_count(), "pre-flight checks passed");

    let mut materializer = Materializer { reader, repository, options, resolver };
    let mut result = ImportResult::default();
    backend.atomic(&mut |store| {
        result = run(store, reader, &mut context, &mut materializer, &order, options)?;
        Ok(())
    })?;

    let group_label =
        attach_import_group(backend, options, &result.node_ids(), OffsetDateTime::now_utc())?;

    for kind in &order {
        let (new, existing) = (result.new_count(*kind), result.existing_count(*kind));
        if new + existing > 0 {
            info!(entity = %kind, new, existing, "imported entities");
        }
    }
    info!(links = result.links.len(), group = group_label.as_deref().unwrap_or("<none>"), "import finished");

    Ok(ImportReport { result, group_label })
}

fn run(
    store: &mut dyn ImportStore,
    reader: &dyn ArchiveReader,
    context: &mut ImportContext,
    materializer: &mut Materializer<'_>,
    order: &[EntityKind],
    options: &ImportOptions,
) -> Result<ImportResult, ImportError> {
    let mut claimed = ClaimedNames::reserving_group(options.target_group.as_deref());
    let mut partitions = Vec::with_capacity(order.len());
    for kind in order {
        partitions.push((*kind, classify(store, reader, context, &mut claimed, *kind, options)?));
    }

    let mut result = ImportResult::default();
    for (kind, partition) in partitions {
        let outcome = materializer.materialize(store, context, kind, partition)?;
        if !(outcome.new.is_empty() && outcome.existing.is_empty()) {
            result.entities.insert(kind, outcome);
        }
    }

    result.links = links::import_links(store, reader, context, options)?;
    groups::import_group_members(store, reader, context, options)?;
    Ok(result)
}

/// Put the run's nodes into the target group, or into a fresh timestamped one
/// when no target is set and the run touched any node.
fn attach_import_group(
    backend: &mut dyn ImportBackend,
    options: &ImportOptions,
    node_ids: &BTreeSet<StorageId>,
    now: OffsetDateTime,
) -> Result<Option<String>, ImportError> {
    if options.target_group.is_none() && node_ids.is_empty() {
        return Ok(None);
    }

    let mut attached = None;
    backend.atomic(&mut |store| {
        let label = match &options.target_group {
            Some(target) => target.clone(),
            None => free_import_label(store, now)?,
        };
        let group_id = match store.find_group_by_label(&label)? {
            Some(id) => id,
            None => store.create_group(&Uuid::new_v4().to_string(), &label, IMPORT_GROUP_TYPE)?,
        };
        if !node_ids.is_empty() {
            store.add_group_members(group_id, node_ids, options.batch_size)?;
        }
        attached = Some(label);
        Ok(())
    })?;
    Ok(attached)
}

fn free_import_label(store: &mut dyn ImportStore, now: OffsetDateTime) -> Result<String, ImportError> {
    let base = now
        .format(format_description!("[year][month][day]-[hour][minute][second]"))
        .map_err(|err| ImportError::ArchiveImport(format!("failed to format group label: {err}")))?;
    if !store.name_in_use(EntityKind::Group, &base)? {
        return Ok(base);
    }
    for counter in 1..=MAX_GROUPS {
        let candidate = format!("{base}_{counter}");
        if !store.name_in_use(EntityKind::Group, &candidate)? {
            return Ok(candidate);
        }
    }
    Err(ImportError::Uniqueness(format!(
        "could not find a free import group label starting with {base}"
    )))
}
