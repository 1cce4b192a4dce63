use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::entity::FieldMap;
use crate::ImportError;

/// What to do with an extra present on both the stored and the imported node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Keep the stored value.
    Leave,
    /// Take the imported value.
    Update,
    /// Drop the key.
    Delete,
    /// Ask an [`ExtrasConflictResolver`] when the values differ.
    Ask,
}

/// Three-letter extras policy for nodes that already exist.
///
/// Letter one: `k` keeps or `n` drops stored keys the archive does not mention.
/// Letter two: `c` creates or `n` ignores imported keys the store lacks.
/// Letter three: `l`, `u`, `d` or `a`, see [`CollisionPolicy`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(try_from = "String", into = "String")]
pub struct ExtrasMode {
    pub keep_existing: bool,
    pub create_new: bool,
    pub collision: CollisionPolicy,
}

impl Default for ExtrasMode {
    fn default() -> Self {
        Self { keep_existing: true, create_new: true, collision: CollisionPolicy::Leave }
    }
}

impl FromStr for ExtrasMode {
    type Err = ImportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            ImportError::Validation(format!(
                "unknown extras_mode_existing value: {value}, expected three letters from \
                 [k|n][c|n][l|u|d|a]"
            ))
        };
        let letters = value.chars().collect::<Vec<_>>();
        let [first, second, third] = letters.as_slice() else {
            return Err(invalid());
        };
        let keep_existing = match first {
            'k' => true,
            'n' => false,
            _ => return Err(invalid()),
        };
        let create_new = match second {
            'c' => true,
            'n' => false,
            _ => return Err(invalid()),
        };
        let collision = match third {
            'l' => CollisionPolicy::Leave,
            'u' => CollisionPolicy::Update,
            'd' => CollisionPolicy::Delete,
            'a' => CollisionPolicy::Ask,
            _ => return Err(invalid()),
        };
        Ok(Self { keep_existing, create_new, collision })
    }
}

impl Display for ExtrasMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let first = if self.keep_existing { 'k' } else { 'n' };
        let second = if self.create_new { 'c' } else { 'n' };
        let third = match self.collision {
            CollisionPolicy::Leave => 'l',
            CollisionPolicy::Update => 'u',
            CollisionPolicy::Delete => 'd',
            CollisionPolicy::Ask => 'a',
        };
        write!(f, "{first}{second}{third}")
    }
}

impl TryFrom<String> for ExtrasMode {
    type Error = ImportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExtrasMode> for String {
    fn from(value: ExtrasMode) -> Self {
        value.to_string()
    }
}

/// Whether extras of newly created nodes are imported.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum NewExtrasMode {
    #[default]
    Import,
    None,
}

impl NewExtrasMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::None => "none",
        }
    }
}

impl FromStr for NewExtrasMode {
    type Err = ImportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "import" => Ok(Self::Import),
            "none" => Ok(Self::None),
            other => Err(ImportError::Validation(format!(
                "unknown extras_mode_new value: {other}, should be either 'import' or 'none'"
            ))),
        }
    }
}

/// Policy for comments whose UUID already exists in the store.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CommentMode {
    /// Keep whichever version was modified last.
    #[default]
    Newest,
    /// Always replace the stored content.
    Overwrite,
}

impl CommentMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Newest => "newest",
            Self::Overwrite => "overwrite",
        }
    }
}

impl FromStr for CommentMode {
    type Err = ImportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "newest" => Ok(Self::Newest),
            "overwrite" => Ok(Self::Overwrite),
            other => Err(ImportError::Validation(format!(
                "unknown comment_mode value: {other}, should be either 'newest' or 'overwrite'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConflictChoice {
    KeepExisting,
    UseImported,
    Drop,
}

/// Decides colliding extras under [`CollisionPolicy::Ask`].
///
/// An error aborts the run and rolls back the import.
pub trait ExtrasConflictResolver {
    fn resolve(
        &mut self,
        key: &str,
        existing: &Value,
        imported: &Value,
    ) -> Result<ConflictChoice, ImportError>;
}

/// Resolver that never replaces a stored value.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeaveExisting;

impl ExtrasConflictResolver for LeaveExisting {
    fn resolve(
        &mut self,
        _key: &str,
        _existing: &Value,
        _imported: &Value,
    ) -> Result<ConflictChoice, ImportError> {
        Ok(ConflictChoice::KeepExisting)
    }
}

/// Merge imported extras into the stored extras of one node.
///
/// Stored keys keep their order; imported-only keys are appended. Fails only
/// when the resolver does.
pub fn merge_extras(
    existing: &FieldMap,
    imported: &FieldMap,
    mode: ExtrasMode,
    resolver: &mut dyn ExtrasConflictResolver,
) -> Result<FieldMap, ImportError> {
    let mut merged = FieldMap::new();

    for (key, old_value) in existing {
        let Some(new_value) = imported.get(key) else {
            if mode.keep_existing {
                merged.insert(key.clone(), old_value.clone());
            }
            continue;
        };

        let choice = match mode.collision {
            CollisionPolicy::Leave => ConflictChoice::KeepExisting,
            CollisionPolicy::Update => ConflictChoice::UseImported,
            CollisionPolicy::Delete => ConflictChoice::Drop,
            CollisionPolicy::Ask if old_value == new_value => ConflictChoice::KeepExisting,
            CollisionPolicy::Ask => resolver.resolve(key, old_value, new_value)?,
        };
        match choice {
            ConflictChoice::KeepExisting => {
                merged.insert(key.clone(), old_value.clone());
            }
            ConflictChoice::UseImported => {
                merged.insert(key.clone(), new_value.clone());
            }
            ConflictChoice::Drop => {}
        }
    }

    if mode.create_new {
        for (key, new_value) in imported {
            if !existing.contains_key(key) {
                merged.insert(key.clone(), new_value.clone());
            }
        }
    }

    Ok(merged)
}

/// Outcome of reconciling an imported comment with the stored one.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CommentMerge {
    /// Stored comment stays as is.
    Unchanged,
    /// Stored content and mtime are replaced by the imported ones.
    Overwrite,
    /// Stored comment is newer and differs; the imported one becomes a new
    /// comment under a fresh UUID.
    Promote,
}

#[must_use]
pub fn merge_comment(
    mode: CommentMode,
    existing_mtime: OffsetDateTime,
    existing_content: &str,
    imported_mtime: OffsetDateTime,
    imported_content: &str,
) -> CommentMerge {
    match mode {
        CommentMode::Overwrite => CommentMerge::Overwrite,
        CommentMode::Newest => {
            if existing_mtime > imported_mtime && existing_content != imported_content {
                CommentMerge::Promote
            } else if imported_mtime > existing_mtime {
                CommentMerge::Overwrite
            } else {
                CommentMerge::Unchanged
            }
        }
    }
}
