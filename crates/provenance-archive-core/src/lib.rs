//! Import engine for provenance-graph archives.
//!
//! An archive is a serialized graph of users, computers, nodes, groups, logs and
//! comments plus the typed links between nodes. [`import_archive`] merges one into
//! a live store through the [`ImportBackend`] port, deduplicating by unique
//! identifier and enforcing the link cardinality rules atomically.

mod entity;
mod import;
mod link;
mod merge;
mod reader;
mod store;

pub use entity::{
    CommentRow, ComputerRow, EntityKind, EntityRow, FieldDescriptor, FieldMap, GroupRow, LogRow,
    NodeRow, UserRow,
};
pub use import::{
    import_archive, import_data, EntityOutcome, ImportContext, ImportOptions, ImportReport,
    ImportResult, DUPLICATE_SUFFIX_PREFIX, IMPORT_GROUP_TYPE, MAX_COMPUTERS, MAX_GROUPS,
};
pub use link::{validate_link_label, Cardinality, LinkRecord, LinkRule, LinkType};
pub use merge::{
    merge_comment, merge_extras, CollisionPolicy, CommentMerge, CommentMode, ConflictChoice,
    ExtrasConflictResolver, ExtrasMode, LeaveExisting, NewExtrasMode,
};
pub use reader::{
    node_shard_path, ArchiveData, ArchiveEntry, ArchiveMetadata, ArchiveReader, GroupMembers,
    JsonArchive, SUPPORTED_EXPORT_VERSIONS,
};
pub use store::{
    ExistingComment, ImportBackend, ImportStore, LinkRow, NodeSummary, RepositoryCopier, StorageId,
};

/// Every way an import run can fail. All variants abort the run and roll back
/// the main transaction.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ImportError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),
    #[error("incompatible archive version: {0}")]
    IncompatibleVersion(String),
    #[error("dangling link: {0}")]
    DanglingLink(String),
    #[error("uniqueness error: {0}")]
    Uniqueness(String),
    #[error("archive import error: {0}")]
    ArchiveImport(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl ImportError {
    /// Stable snake-case name of the variant, for machine-readable output.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::CorruptArchive(_) => "corrupt_archive",
            Self::IncompatibleVersion(_) => "incompatible_version",
            Self::DanglingLink(_) => "dangling_link",
            Self::Uniqueness(_) => "uniqueness",
            Self::ArchiveImport(_) => "archive_import",
            Self::Storage(_) => "storage",
        }
    }
}
