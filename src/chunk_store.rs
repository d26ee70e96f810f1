//! 分片暂存区：每个会话一个目录，每个分片一个文件。

use axum::body::Bytes;
use futures_util::stream::{Stream, StreamExt};
use std::fmt::Display;
use std::io;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, warn};

use crate::atomic::AtomicFile;
use crate::naming::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum ChunkWriteError {
    #[error("chunk exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("failed to read chunk body: {0}")]
    Body(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug)]
pub struct ChunkStore {
    root: PathBuf,
    max_chunk_size: u64,
}

impl ChunkStore {
    pub fn new(root: PathBuf, max_chunk_size: u64) -> Self {
        Self {
            root,
            max_chunk_size,
        }
    }

    pub fn session_dir(&self, session_id: &SessionId) -> PathBuf {
        self.root.join(session_id.as_str())
    }

    pub fn chunk_path(&self, session_id: &SessionId, chunk_index: u64) -> PathBuf {
        self.session_dir(session_id).join(chunk_index.to_string())
    }

    /// 把分片内容流式写入 `{scratch}/{session}/{index}`。
    ///
    /// 写入先落到同目录临时文件再 rename，重复投递不会让合并读到半截内容。
    /// 失败时临时文件被删除，返回错误，调用方不得登记该分片。
    pub async fn write_chunk<S, E>(
        &self,
        session_id: &SessionId,
        chunk_index: u64,
        body: S,
    ) -> Result<u64, ChunkWriteError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).await?;
        let target = self.chunk_path(session_id, chunk_index);

        let mut atomic = AtomicFile::new(&target).await?;
        let written = match copy_limited(&mut atomic, body, self.max_chunk_size).await {
            Ok(written) => written,
            Err(err) => {
                atomic.cleanup().await;
                return Err(err);
            }
        };
        atomic.finalize().await?;

        debug!(
            session_id = %session_id,
            chunk_index,
            bytes = written,
            "chunk saved"
        );
        Ok(written)
    }

    /// 删除会话暂存目录；失败只记录日志。
    pub async fn remove_session(&self, session_id: &SessionId) {
        let dir = self.session_dir(session_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(session_id = %session_id, path = ?dir, error = %err, "failed to remove chunk dir");
            }
        }
    }
}

async fn copy_limited<S, E>(atomic: &mut AtomicFile, body: S, limit: u64) -> Result<u64, ChunkWriteError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    futures_util::pin_mut!(body);
    let mut total_written: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|err| ChunkWriteError::Body(err.to_string()))?;
        if chunk.is_empty() {
            continue;
        }
        total_written += chunk.len() as u64;
        if limit > 0 && total_written > limit {
            return Err(ChunkWriteError::TooLarge { limit });
        }
        atomic.write_all(&chunk).await?;
    }
    Ok(total_written)
}

#[cfg(test)]
pub(crate) fn body_of(bytes: &'static [u8]) -> impl Stream<Item = Result<Bytes, std::convert::Infallible>> {
    futures_util::stream::iter(vec![Ok(Bytes::from_static(bytes))])
}
