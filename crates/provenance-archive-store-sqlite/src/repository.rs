use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use provenance_archive_core::{node_shard_path, ArchiveReader, ImportError, RepositoryCopier};
use tracing::debug;
use walkdir::WalkDir;

use crate::storage_error;

/// Node file repository laid out as `<root>/<uuid[0:2]>/<uuid[2:4]>/<uuid[4:]>`.
#[derive(Debug, Clone)]
pub struct FsRepository {
    root: PathBuf,
}

impl FsRepository {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn node_path(&self, uuid: &str) -> PathBuf {
        self.root.join(node_shard_path(uuid))
    }
}

impl RepositoryCopier for FsRepository {
    fn stage_nodes(&self, uuids: &[String], reader: &dyn ArchiveReader) -> Result<(), ImportError> {
        let mut staged = 0_usize;
        for uuid in uuids {
            let Some(source) = reader.node_repository(uuid) else {
                continue;
            };
            if !source.is_dir() {
                return Err(ImportError::CorruptArchive(format!(
                    "unable to find the repository folder of node {uuid} at {}",
                    source.display()
                )));
            }
            replace_tree(&source, &self.node_path(uuid)).map_err(storage_error)?;
            staged += 1;
        }
        debug!(staged, root = %self.root.display(), "staged node repositories");
        Ok(())
    }
}

/// Copy `source` over `destination`. Only nodes new to the store are staged,
/// so a folder already at `destination` is left over from a rolled-back run.
fn replace_tree(source: &Path, destination: &Path) -> Result<()> {
    let partial = destination.with_extension("partial");
    if partial.exists() {
        fs::remove_dir_all(&partial)
            .with_context(|| format!("failed to clear {}", partial.display()))?;
    }
    copy_tree(source, &partial)?;
    if destination.exists() {
        debug!(path = %destination.display(), "replacing stale node repository");
        fs::remove_dir_all(destination)
            .with_context(|| format!("failed to remove {}", destination.display()))?;
    }
    fs::rename(&partial, destination).with_context(|| {
        format!("failed to move {} to {}", partial.display(), destination.display())
    })
}

fn copy_tree(source: &Path, destination: &Path) -> Result<()> {
    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.with_context(|| format!("failed to walk {}", source.display()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .with_context(|| format!("{} escaped {}", entry.path().display(), source.display()))?;
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::copy(entry.path(), &target).with_context(|| {
                format!("failed to copy {} to {}", entry.path().display(), target.display())
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use provenance_archive_core::{ArchiveData, ArchiveMetadata, JsonArchive};

    use super::*;

    const UUID: &str = "12345678-0000-4000-8000-000000000001";

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_nanos());
        std::env::temp_dir().join(format!("{prefix}-{}-{nanos}", std::process::id()))
    }

    fn archive_with_node_folder(root: &Path) -> Result<JsonArchive> {
        fs::create_dir_all(root)?;
        fs::write(
            root.join("metadata.json"),
            serde_json::to_vec(&ArchiveMetadata::current())?,
        )?;
        fs::write(root.join("data.json"), serde_json::to_vec(&ArchiveData::default())?)?;
        let folder = root.join("nodes").join(node_shard_path(UUID));
        fs::create_dir_all(folder.join("path"))?;
        fs::write(folder.join("path").join("aiida.in"), b"&control /")?;
        Ok(JsonArchive::open(root)?)
    }

    #[test]
    fn node_folders_are_copied_into_the_sharded_layout() -> Result<()> {
        let base = unique_temp_dir("parc-repository");
        let archive = archive_with_node_folder(&base.join("archive"))?;
        let repository = FsRepository::new(base.join("repo"));

        repository.stage_nodes(&[UUID.to_string()], &archive)?;
        let copied = repository.node_path(UUID).join("path").join("aiida.in");
        assert_eq!(fs::read(&copied)?, b"&control /");

        fs::remove_dir_all(&base)?;
        Ok(())
    }

    #[test]
    fn leftover_node_folders_are_replaced() -> Result<()> {
        let base = unique_temp_dir("parc-repository-leftover");
        let archive = archive_with_node_folder(&base.join("archive"))?;
        let repository = FsRepository::new(base.join("repo"));

        let stale = repository.node_path(UUID).join("stale.txt");
        fs::create_dir_all(repository.node_path(UUID))?;
        fs::write(&stale, b"from a failed run")?;

        repository.stage_nodes(&[UUID.to_string()], &archive)?;
        assert!(!stale.exists());
        let copied = repository.node_path(UUID).join("path").join("aiida.in");
        assert_eq!(fs::read(&copied)?, b"&control /");
        assert!(!repository.node_path(UUID).with_extension("partial").exists());

        repository.stage_nodes(&[UUID.to_string()], &archive)?;
        assert_eq!(fs::read(&copied)?, b"&control /");

        fs::remove_dir_all(&base)?;
        Ok(())
    }

    #[test]
    fn missing_node_folder_is_a_corrupt_archive() -> Result<()> {
        let base = unique_temp_dir("parc-repository-missing");
        let archive = archive_with_node_folder(&base.join("archive"))?;
        let repository = FsRepository::new(base.join("repo"));

        let result =
            repository.stage_nodes(&["abcdef00-0000-4000-8000-000000000002".to_string()], &archive);
        assert!(matches!(result, Err(ImportError::CorruptArchive(_))));

        fs::remove_dir_all(&base)?;
        Ok(())
    }
}
