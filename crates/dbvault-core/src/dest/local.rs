//! Local filesystem backend
//!
//! Artifacts live under `<root>/<target_folder>/<filename>`. Writes go to a
//! `.tmp` sibling first and are renamed into place, so a crashed upload
//! never leaves a half-written artifact under its final name.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;

use super::StorageAdapter;
use crate::error::{Error, Result};
use crate::models::{ArtifactInfo, StoredArtifact};
use crate::pipeline::filename;

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, backup_id: &str) -> Result<PathBuf> {
        // backup_id is a relative key; keep it inside the root
        let rel = Path::new(backup_id);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::Permanent(format!(
                "invalid local backup id: {}",
                backup_id
            )));
        }
        Ok(self.root.join(rel))
    }

    async fn collect_dir(
        &self,
        dir: &Path,
        key_prefix: &str,
        out: &mut Vec<ArtifactInfo>,
    ) -> Result<()> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            // Only surface files this service wrote
            let created_at = match filename::parse(&name) {
                Ok(parsed) => parsed.timestamp,
                Err(_) => continue,
            };
            let key = if key_prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", key_prefix, name)
            };
            out.push(ArtifactInfo {
                id: key,
                name,
                size: meta.len(),
                created_at,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for LocalBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn put(&self, key: &str, source: &Path, _size: u64) -> Result<StoredArtifact> {
        let final_path = self.artifact_path(key)?;
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = final_path.with_extension(format!(
            "{}.tmp",
            final_path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("part")
        ));
        fs::copy(source, &tmp_path).await?;
        fs::rename(&tmp_path, &final_path).await?;

        Ok(StoredArtifact {
            backup_id: key.to_string(),
            created_at: Utc::now(),
        })
    }

    async fn list(&self, prefix: Option<&str>, limit: Option<usize>) -> Result<Vec<ArtifactInfo>> {
        let mut artifacts = Vec::new();
        match prefix {
            Some(folder) => {
                self.collect_dir(&self.root.join(folder), folder, &mut artifacts)
                    .await?;
            }
            None => {
                // Loose files in the root plus one level of target folders
                let root = self.root.clone();
                self.collect_dir(&root, "", &mut artifacts).await?;
                let mut entries = match fs::read_dir(&self.root).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Ok(artifacts);
                    }
                    Err(e) => return Err(e.into()),
                };
                while let Some(entry) = entries.next_entry().await? {
                    if entry.metadata().await?.is_dir() {
                        if let Ok(folder) = entry.file_name().into_string() {
                            self.collect_dir(&entry.path(), &folder, &mut artifacts)
                                .await?;
                        }
                    }
                }
            }
        }

        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.name.cmp(&a.name)));
        if let Some(limit) = limit {
            artifacts.truncate(limit);
        }
        Ok(artifacts)
    }

    async fn get(&self, backup_id: &str, _name: &str, dest: &Path) -> Result<()> {
        let path = self.artifact_path(backup_id)?;
        if !path.exists() {
            return Err(Error::Permanent(format!("backup not found: {}", backup_id)));
        }
        fs::copy(&path, dest).await?;
        Ok(())
    }

    async fn delete(&self, backup_id: &str, _name: &str) -> Result<()> {
        let path = self.artifact_path(backup_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::Permanent(format!(
                "backup not found: {}",
                backup_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn test_connection(&self) -> Result<String> {
        fs::create_dir_all(&self.root).await?;
        let probe = self.root.join(".dbvault-probe");
        fs::write(&probe, b"ok").await?;
        fs::remove_file(&probe).await?;
        Ok(format!("writable: {}", self.root.display()))
    }
}
