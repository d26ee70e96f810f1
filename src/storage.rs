use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::config::THUMBNAIL_EXTENSION;
use crate::naming::SessionId;

/// 磁盘布局：公开成品、分片暂存、缩略图与隔离区。
#[derive(Clone, Debug)]
pub struct Storage {
    public: PathBuf,
    scratch: PathBuf,
    thumbnails: PathBuf,
    quarantine: PathBuf,
}

impl Storage {
    pub fn new(public: PathBuf, scratch: PathBuf, thumbnails: PathBuf, quarantine: PathBuf) -> Self {
        Self {
            public,
            scratch,
            thumbnails,
            quarantine,
        }
    }

    #[cfg(test)]
    pub fn under(root: &Path) -> Self {
        Self::new(
            root.join("storage"),
            root.join("chunks"),
            root.join("thumbnails"),
            root.join("reported"),
        )
    }

    pub async fn ensure_dirs(&self) -> io::Result<()> {
        for dir in [
            &self.public,
            &self.scratch,
            &self.thumbnails,
            &self.quarantined_public(),
            &self.quarantined_thumbnails(),
        ] {
            fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn public_root(&self) -> &Path {
        &self.public
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch
    }

    pub fn quarantined_public(&self) -> PathBuf {
        self.quarantine.join("storage")
    }

    pub fn quarantined_thumbnails(&self) -> PathBuf {
        self.quarantine.join("thumbnails")
    }

    pub fn artifact_path(&self, file_name: &str) -> PathBuf {
        self.public.join(file_name)
    }

    pub fn thumbnail_path(&self, session_id: &SessionId) -> PathBuf {
        self.thumbnails
            .join(format!("{}.{THUMBNAIL_EXTENSION}", session_id.as_str()))
    }

    /// 查找会话对应的公开成品（按 `{id}_` 前缀匹配，跳过符号链接）。
    pub async fn find_artifact(&self, session_id: &SessionId) -> io::Result<Option<PathBuf>> {
        Ok(self.find_artifacts(session_id).await?.into_iter().next())
    }

    pub async fn find_artifacts(&self, session_id: &SessionId) -> io::Result<Vec<PathBuf>> {
        let prefix = session_id.artifact_prefix();
        let mut dir = match fs::read_dir(&self.public).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut found = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(&prefix) {
                continue;
            }
            let metadata = fs::symlink_metadata(entry.path()).await?;
            if metadata.is_file() {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }
}
