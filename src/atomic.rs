//! 临时写入与原子落盘的辅助方法。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// 同目录临时文件，完成后通过 rename/link 一次性出现在目标路径。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn new(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target path"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_name = format!(".{base}.tmp.{}", Uuid::new_v4());
        let temp_path = parent.join(temp_name);
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes).await
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 同步并原子替换目标文件（目标已存在时覆盖）。
    pub async fn finalize(self) -> io::Result<()> {
        let Self {
            target,
            temp_path,
            file,
        } = self;
        discard_on_err(file.sync_all().await, &temp_path).await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&target).await.is_ok() {
                    if let Err(err) = fs::rename(&temp_path, &target).await {
                        let _ = fs::remove_file(&temp_path).await;
                        return Err(err);
                    }
                } else {
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(err);
                }
            }
            #[cfg(not(windows))]
            {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err);
            }
        }

        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }

    /// 同步并发布到目标路径；目标已存在时返回 `AlreadyExists` 且不覆盖。
    pub async fn finalize_new(self) -> io::Result<()> {
        let Self {
            target,
            temp_path,
            file,
        } = self;
        discard_on_err(file.sync_all().await, &temp_path).await?;
        drop(file);

        let linked = fs::hard_link(&temp_path, &target).await;
        let _ = fs::remove_file(&temp_path).await;
        linked?;

        if let Some(parent) = target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }
}

/// 出错时删除临时文件，原样返回结果。
async fn discard_on_err<T>(result: io::Result<T>, temp_path: &Path) -> io::Result<T> {
    if result.is_err() {
        let _ = fs::remove_file(temp_path).await;
    }
    result
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}
