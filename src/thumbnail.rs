//! 缩略图生成：成品合并后的尽力而为处理，失败只记录日志。

use image::{DynamicImage, ImageFormat, ImageReader};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

use crate::atomic::AtomicFile;
use crate::naming::SessionId;
use crate::storage::Storage;

#[derive(Debug, thiserror::Error)]
pub enum ThumbnailError {
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("thumbnail task failed: {0}")]
    Task(String),
    #[error("artifact removed while rendering thumbnail")]
    Withdrawn,
}

#[derive(Debug)]
pub struct ThumbnailConfig {
    /// 缩略图边界框边长（像素），保持宽高比缩放到框内。
    pub bounds: u32,
    /// 小写、带前导点的扩展名白名单。
    pub extensions: Vec<String>,
    /// 会话没有缩略图时返回的占位图。
    pub placeholder: Option<PathBuf>,
}

#[derive(Debug)]
pub struct ThumbnailPipeline {
    storage: Storage,
    config: ThumbnailConfig,
}

impl ThumbnailPipeline {
    pub fn new(storage: Storage, config: ThumbnailConfig) -> Self {
        Self { storage, config }
    }

    pub fn placeholder(&self) -> Option<&Path> {
        self.config.placeholder.as_deref()
    }

    /// 按文件名扩展名判断是否需要生成缩略图。
    pub fn is_candidate(&self, file_name: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        self.config
            .extensions
            .iter()
            .any(|extension| lower.ends_with(extension.as_str()))
    }

    /// 解码成品、缩放并以 WebP 原子写入缩略图目录。
    pub async fn generate(
        &self,
        artifact: &Path,
        session_id: &SessionId,
    ) -> Result<PathBuf, ThumbnailError> {
        let source = artifact.to_path_buf();
        let bounds = self.config.bounds;
        let encoded = tokio::task::spawn_blocking(move || render_thumbnail(&source, bounds))
            .await
            .map_err(|err| ThumbnailError::Task(err.to_string()))??;

        self.publish(&encoded, artifact, session_id).await
    }

    /// 原子写入缩略图；写完后成品已不在（被举报隔离）则删除缩略图。
    async fn publish(
        &self,
        encoded: &[u8],
        artifact: &Path,
        session_id: &SessionId,
    ) -> Result<PathBuf, ThumbnailError> {
        if !fs::try_exists(artifact).await? {
            return Err(ThumbnailError::Withdrawn);
        }
        let target = self.storage.thumbnail_path(session_id);
        let mut atomic = AtomicFile::new(&target).await?;
        if let Err(err) = atomic.write_all(encoded).await {
            atomic.cleanup().await;
            return Err(err.into());
        }
        atomic.finalize().await?;

        if !fs::try_exists(artifact).await? {
            match fs::remove_file(&target).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            return Err(ThumbnailError::Withdrawn);
        }
        debug!(session_id = %session_id, bytes = encoded.len(), "thumbnail written");
        Ok(target)
    }

    /// 对白名单内的成品生成缩略图，吞掉并记录所有错误。
    pub async fn maybe_generate(&self, artifact: &Path, session_id: &SessionId) -> bool {
        let Some(name) = artifact.file_name().map(|name| name.to_string_lossy()) else {
            return false;
        };
        if !self.is_candidate(&name) {
            return false;
        }
        match self.generate(artifact, session_id).await {
            Ok(_) => true,
            Err(ThumbnailError::Withdrawn) => {
                debug!(session_id = %session_id, "artifact gone, thumbnail discarded");
                false
            }
            Err(err) => {
                warn!(session_id = %session_id, path = ?artifact, error = %err, "could not generate thumbnail");
                false
            }
        }
    }

    /// 在后台任务中生成缩略图，不阻塞上传响应。
    pub fn spawn(self: &Arc<Self>, artifact: PathBuf, session_id: SessionId) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            pipeline.maybe_generate(&artifact, &session_id).await;
        });
    }
}

fn render_thumbnail(source: &Path, bounds: u32) -> Result<Vec<u8>, ThumbnailError> {
    let image = ImageReader::open(source)?.with_guessed_format()?.decode()?;
    let image = if image.width() > bounds || image.height() > bounds {
        image.thumbnail(bounds, bounds)
    } else {
        image
    };
    let rgba = DynamicImage::ImageRgba8(image.to_rgba8());
    let mut encoded = Cursor::new(Vec::new());
    rgba.write_to(&mut encoded, ImageFormat::WebP)?;
    Ok(encoded.into_inner())
}
