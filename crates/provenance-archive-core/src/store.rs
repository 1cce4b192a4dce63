use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::entity::{EntityKind, EntityRow, FieldMap};
use crate::link::LinkType;
use crate::reader::ArchiveReader;
use crate::ImportError;

/// Identifier assigned by the store when a row is persisted.
pub type StorageId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingComment {
    pub id: StorageId,
    pub mtime: OffsetDateTime,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    pub uuid: String,
    pub node_type: String,
}

/// A link between two persisted nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkRow {
    pub input_id: StorageId,
    pub output_id: StorageId,
    pub label: String,
    pub link_type: LinkType,
}

/// Storage operations the import engine needs inside one transaction.
///
/// Every `batch_size` argument bounds how many keys or rows travel in one
/// statement; it never changes the outcome.
pub trait ImportStore {
    /// Storage ids of the rows of `kind` whose unique identifier is in `unique_ids`.
    ///
    /// # Errors
    /// Returns [`ImportError::Storage`] when the lookup fails.
    fn find_existing(
        &mut self,
        kind: EntityKind,
        unique_ids: &BTreeSet<String>,
        batch_size: usize,
    ) -> Result<BTreeMap<String, StorageId>, ImportError>;

    /// Whether a group label or computer name is already taken.
    ///
    /// # Errors
    /// Returns [`ImportError::Storage`] when the lookup fails.
    fn name_in_use(&mut self, kind: EntityKind, name: &str) -> Result<bool, ImportError>;

    /// Persist rows of one entity type in bulk.
    ///
    /// # Errors
    /// Returns [`ImportError::Storage`] when any insert fails.
    fn insert_entities(&mut self, rows: &[EntityRow], batch_size: usize)
        -> Result<(), ImportError>;

    /// Toggle automatic modification timestamps.
    ///
    /// # Errors
    /// Returns [`ImportError::Storage`] when the setting cannot be changed.
    fn set_auto_now(&mut self, enabled: bool) -> Result<(), ImportError>;

    /// Storage id and current extras of the nodes with the given UUIDs.
    ///
    /// # Errors
    /// Returns [`ImportError::Storage`] when the lookup fails.
    fn node_extras(
        &mut self,
        uuids: &BTreeSet<String>,
        batch_size: usize,
    ) -> Result<BTreeMap<String, (StorageId, FieldMap)>, ImportError>;

    /// # Errors
    /// Returns [`ImportError::Storage`] when the update fails.
    fn update_node_extras(&mut self, id: StorageId, extras: &FieldMap) -> Result<(), ImportError>;

    /// # Errors
    /// Returns [`ImportError::Storage`] when the lookup fails.
    fn find_comment(&mut self, uuid: &str) -> Result<Option<ExistingComment>, ImportError>;

    /// # Errors
    /// Returns [`ImportError::Storage`] when the update fails.
    fn update_comment(
        &mut self,
        id: StorageId,
        content: &str,
        mtime: OffsetDateTime,
    ) -> Result<(), ImportError>;

    /// # Errors
    /// Returns [`ImportError::Storage`] when links cannot be read.
    fn all_links(&mut self) -> Result<Vec<LinkRow>, ImportError>;

    /// # Errors
    /// Returns [`ImportError::Storage`] when the lookup fails.
    fn node_summaries(
        &mut self,
        ids: &BTreeSet<StorageId>,
        batch_size: usize,
    ) -> Result<BTreeMap<StorageId, NodeSummary>, ImportError>;

    /// # Errors
    /// Returns [`ImportError::Storage`] when any insert fails.
    fn insert_links(&mut self, links: &[LinkRow], batch_size: usize) -> Result<(), ImportError>;

    /// Add nodes to a group; nodes already in it are left alone.
    ///
    /// # Errors
    /// Returns [`ImportError::Storage`] when the membership rows cannot be written.
    fn add_group_members(
        &mut self,
        group_id: StorageId,
        node_ids: &BTreeSet<StorageId>,
        batch_size: usize,
    ) -> Result<(), ImportError>;

    /// # Errors
    /// Returns [`ImportError::Storage`] when the lookup fails.
    fn find_group_by_label(&mut self, label: &str) -> Result<Option<StorageId>, ImportError>;

    /// Create a group owned by the store's default user.
    ///
    /// # Errors
    /// Returns [`ImportError::Storage`] when the group cannot be created.
    fn create_group(
        &mut self,
        uuid: &str,
        label: &str,
        type_string: &str,
    ) -> Result<StorageId, ImportError>;
}

/// A store that can run import work atomically.
pub trait ImportBackend {
    /// Run `work` in one transaction: commit if it returns `Ok`, roll back
    /// every mutation otherwise.
    ///
    /// # Errors
    /// Returns the error of `work`, or [`ImportError::Storage`] when the
    /// transaction cannot be opened or committed.
    fn atomic(
        &mut self,
        work: &mut dyn FnMut(&mut dyn ImportStore) -> Result<(), ImportError>,
    ) -> Result<(), ImportError>;
}

/// Stages node repository payloads before their rows become visible.
pub trait RepositoryCopier {
    /// # Errors
    /// Any error aborts the import run.
    fn stage_nodes(&self, uuids: &[String], reader: &dyn ArchiveReader)
        -> Result<(), ImportError>;
}
