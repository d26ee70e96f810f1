//! 举报后的隔离：把成品与缩略图移出公开目录。

use serde::Serialize;
use std::io;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

use crate::atomic::AtomicFile;
use crate::naming::SessionId;
use crate::storage::Storage;

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuarantineOutcome {
    /// 被移入隔离区的成品文件名。
    pub files: Vec<String>,
    pub derivative_moved: bool,
}

impl QuarantineOutcome {
    /// 没有任何文件可隔离（可能已被先前的举报移走）。
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && !self.derivative_moved
    }
}

/// 隔离会话的成品与缩略图；重复调用或缩略图缺失都不是错误。
///
/// 先移走成品再移缩略图：后台生成在成品消失后会撤回自己写出的缩略图。
pub async fn quarantine(storage: &Storage, session_id: &SessionId) -> io::Result<QuarantineOutcome> {
    let mut outcome = QuarantineOutcome::default();

    let quarantined_public = storage.quarantined_public();
    for artifact in storage.find_artifacts(session_id).await? {
        let Some(name) = artifact.file_name() else {
            continue;
        };
        if move_if_present(&artifact, &quarantined_public.join(name)).await? {
            outcome.files.push(name.to_string_lossy().into_owned());
        }
    }

    let thumbnail = storage.thumbnail_path(session_id);
    if let Some(name) = thumbnail.file_name() {
        let destination = storage.quarantined_thumbnails().join(name);
        outcome.derivative_moved = move_if_present(&thumbnail, &destination).await?;
    }

    if outcome.is_empty() {
        info!(session_id = %session_id, "nothing to quarantine");
    } else {
        info!(
            session_id = %session_id,
            files = ?outcome.files,
            derivative_moved = outcome.derivative_moved,
            "upload quarantined"
        );
    }
    Ok(outcome)
}

/// 单文件原子移动；源不存在返回 `false`。跨文件系统时退化为复制后删除源。
async fn move_if_present(source: &Path, destination: &Path) -> io::Result<bool> {
    match fs::rename(source, destination).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            copy_across_devices(source, destination).await
        }
        Err(err) => Err(err),
    }
}

async fn copy_across_devices(source: &Path, destination: &Path) -> io::Result<bool> {
    let mut input = match fs::File::open(source).await {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    let mut atomic = AtomicFile::new(destination).await?;
    if let Err(err) = tokio::io::copy(&mut input, atomic.file_mut()).await {
        atomic.cleanup().await;
        return Err(err);
    }
    atomic.finalize().await?;
    if let Err(err) = fs::remove_file(source).await {
        warn!(path = ?source, error = %err, "failed to remove source after quarantine copy");
    }
    Ok(true)
}
