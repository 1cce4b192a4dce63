use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::store::StorageId;
use crate::ImportError;

/// Flat field name to serialized value mapping, as stored in the archive.
pub type FieldMap = Map<String, Value>;

/// The fixed set of entity types an archive can carry.
///
/// Variant order is the import order: every type only references types declared
/// before it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EntityKind {
    User,
    Computer,
    Node,
    Group,
    Log,
    Comment,
}

impl EntityKind {
    pub const ALL: [Self; 6] =
        [Self::User, Self::Computer, Self::Node, Self::Group, Self::Log, Self::Comment];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Computer => "Computer",
            Self::Node => "Node",
            Self::Group => "Group",
            Self::Log => "Log",
            Self::Comment => "Comment",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "User" => Some(Self::User),
            "Computer" => Some(Self::Computer),
            "Node" => Some(Self::Node),
            "Group" => Some(Self::Group),
            "Log" => Some(Self::Log),
            "Comment" => Some(Self::Comment),
            _ => None,
        }
    }

    /// Name of the field that identifies a record across databases.
    #[must_use]
    pub fn unique_identifier(self) -> &'static str {
        match self {
            Self::User => "email",
            _ => "uuid",
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-field metadata shipped with the archive.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldDescriptor {
    /// Entity type this field points at, if it is a foreign key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convert_type: Option<String>,
}

impl FieldDescriptor {
    #[must_use]
    pub fn is_date(&self) -> bool {
        self.convert_type.as_deref() == Some("date")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRow {
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub institution: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComputerRow {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scheduler_type: String,
    #[serde(default)]
    pub transport_type: String,
    #[serde(default)]
    pub metadata: FieldMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRow {
    pub uuid: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: String,
    pub node_type: String,
    #[serde(default)]
    pub process_type: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub ctime: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub mtime: OffsetDateTime,
    pub user: StorageId,
    #[serde(default)]
    pub dbcomputer: Option<StorageId>,
    #[serde(default)]
    pub attributes: FieldMap,
    #[serde(default)]
    pub extras: FieldMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupRow {
    pub uuid: String,
    pub label: String,
    #[serde(default = "default_group_type")]
    pub type_string: String,
    #[serde(default)]
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    pub user: StorageId,
    #[serde(default)]
    pub extras: FieldMap,
}

fn default_group_type() -> String {
    "core".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogRow {
    pub uuid: String,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    #[serde(default)]
    pub loggername: String,
    #[serde(default)]
    pub levelname: String,
    pub dbnode: StorageId,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub metadata: FieldMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentRow {
    pub uuid: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ctime: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub mtime: OffsetDateTime,
    #[serde(default)]
    pub content: String,
    pub dbnode: StorageId,
    pub user: StorageId,
}

/// A record ready for persistence: every foreign key already points at a
/// storage id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "entity", content = "fields")]
pub enum EntityRow {
    User(UserRow),
    Computer(ComputerRow),
    Node(NodeRow),
    Group(GroupRow),
    Log(LogRow),
    Comment(CommentRow),
}

impl EntityRow {
    /// Build the typed row for `kind` from fields whose foreign keys and dates
    /// were already resolved.
    ///
    /// # Errors
    /// Returns [`ImportError::CorruptArchive`] when a required field is missing or
    /// has the wrong shape.
    pub fn from_fields(kind: EntityKind, fields: FieldMap) -> Result<Self, ImportError> {
        let value = Value::Object(fields);
        let row = match kind {
            EntityKind::User => serde_json::from_value(value).map(Self::User),
            EntityKind::Computer => serde_json::from_value(value).map(Self::Computer),
            EntityKind::Node => serde_json::from_value(value).map(Self::Node),
            EntityKind::Group => serde_json::from_value(value).map(Self::Group),
            EntityKind::Log => serde_json::from_value(value).map(Self::Log),
            EntityKind::Comment => serde_json::from_value(value).map(Self::Comment),
        };
        row.map_err(|err| ImportError::CorruptArchive(format!("malformed {kind} record: {err}")))
    }

    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::User(_) => EntityKind::User,
            Self::Computer(_) => EntityKind::Computer,
            Self::Node(_) => EntityKind::Node,
            Self::Group(_) => EntityKind::Group,
            Self::Log(_) => EntityKind::Log,
            Self::Comment(_) => EntityKind::Comment,
        }
    }

    #[must_use]
    pub fn unique_id(&self) -> &str {
        match self {
            Self::User(row) => &row.email,
            Self::Computer(row) => &row.uuid,
            Self::Node(row) => &row.uuid,
            Self::Group(row) => &row.uuid,
            Self::Log(row) => &row.uuid,
            Self::Comment(row) => &row.uuid,
        }
    }
}

/// Parse an archive timestamp. Accepts RFC 3339 and the naive
/// `YYYY-MM-DDTHH:MM:SS.ffffff` form, which is taken as UTC.
pub(crate) fn parse_archive_date(raw: &str) -> Option<OffsetDateTime> {
    if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(parsed);
    }
    let naive = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
    let plain = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    PrimitiveDateTime::parse(raw, naive)
        .or_else(|_| PrimitiveDateTime::parse(raw, plain))
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

pub(crate) fn format_rfc3339(value: OffsetDateTime) -> Result<String, ImportError> {
    value
        .format(&Rfc3339)
        .map_err(|err| ImportError::ArchiveImport(format!("failed to format timestamp: {err}")))
}
