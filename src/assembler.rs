//! 按序号顺序合并分片为成品文件，同时计算摘要。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{error, info};

use crate::atomic::AtomicFile;
use crate::chunk_store::ChunkStore;
use crate::digest::{ContentDigest, ContentHasher};
use crate::naming::SessionId;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub struct AssembledArtifact {
    pub path: PathBuf,
    pub digest: ContentDigest,
}

#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    /// 登记表认为齐全但暂存区缺少分片：登记表与暂存区失步。
    #[error("chunk {index} is missing from scratch storage")]
    MissingChunk { index: u64 },
    #[error("artifact {0:?} already exists")]
    AlreadyExists(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 把 `0..expected_total` 号分片依次写入 `destination`。
///
/// 每次只在内存中保留一个缓冲区；成品通过临时文件发布，失败时不会留下短文件。
/// 成功后整段删除会话暂存目录，删除失败只记日志。
pub async fn assemble(
    store: &ChunkStore,
    session_id: &SessionId,
    expected_total: u64,
    destination: &Path,
) -> Result<AssembledArtifact, AssembleError> {
    let mut atomic = AtomicFile::new(destination).await?;
    let digest = match stream_chunks(store, session_id, expected_total, &mut atomic).await {
        Ok(digest) => digest,
        Err(err) => {
            atomic.cleanup().await;
            if let AssembleError::MissingChunk { index } = &err {
                error!(session_id = %session_id, index, expected_total, "chunk missing at assembly");
            }
            return Err(err);
        }
    };

    atomic.finalize_new().await.map_err(|err| {
        if err.kind() == io::ErrorKind::AlreadyExists {
            AssembleError::AlreadyExists(destination.to_path_buf())
        } else {
            AssembleError::Io(err)
        }
    })?;

    store.remove_session(session_id).await;
    info!(
        session_id = %session_id,
        path = ?destination,
        size = digest.size,
        digest = %digest.sha3_256,
        "upload assembled"
    );
    Ok(AssembledArtifact {
        path: destination.to_path_buf(),
        digest,
    })
}

async fn stream_chunks(
    store: &ChunkStore,
    session_id: &SessionId,
    expected_total: u64,
    atomic: &mut AtomicFile,
) -> Result<ContentDigest, AssembleError> {
    let mut hasher = ContentHasher::new();
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    for index in 0..expected_total {
        let path = store.chunk_path(session_id, index);
        let mut part = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(AssembleError::MissingChunk { index });
            }
            Err(err) => return Err(err.into()),
        };
        loop {
            let read = part.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            atomic.write_all(&buffer[..read]).await?;
        }
    }
    Ok(hasher.finish())
}
