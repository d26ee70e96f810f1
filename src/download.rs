//! 成品下载与缩略图读取处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use httpdate::fmt_http_date;
use std::io;
use std::path::Path as FsPath;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::config::THUMBNAIL_EXTENSION;
use crate::error::ApiError;
use crate::etag::{etag_from_metadata, not_modified};
use crate::naming::SessionId;
use crate::storage::Storage;
use crate::thumbnail::ThumbnailPipeline;

/// 只读访问公开成品与缩略图。
pub struct DownloadService {
    storage: Storage,
    thumbnails: Arc<ThumbnailPipeline>,
    downloads_enabled: bool,
}

impl DownloadService {
    pub fn new(storage: Storage, thumbnails: Arc<ThumbnailPipeline>, downloads_enabled: bool) -> Self {
        Self {
            storage,
            thumbnails,
            downloads_enabled,
        }
    }
}

/// `GET /download/{session_id}`：按会话标识下载成品。
pub async fn download_file(
    Path(session_id): Path<String>,
    request_headers: HeaderMap,
    Extension(downloads): Extension<Arc<DownloadService>>,
) -> Result<Response, ApiError> {
    if !downloads.downloads_enabled {
        return Err(ApiError::Forbidden("downloads are disabled".into()));
    }
    let session_id = SessionId::parse(&session_id)?;
    let Some(path) = downloads.storage.find_artifact(&session_id).await? else {
        return Err(ApiError::NotFound("file not found".into()));
    };
    let download_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .map(|name| {
            name.strip_prefix(&session_id.artifact_prefix())
                .map(str::to_string)
                .unwrap_or(name)
        });
    info!(session_id = %session_id, path = ?path, "download file");
    serve_file(&path, &request_headers, download_name.as_deref()).await
}

/// `GET /thumbnail/{session_id}`：缩略图缺失时退回占位图。
pub async fn get_thumbnail(
    Path(name): Path<String>,
    request_headers: HeaderMap,
    Extension(downloads): Extension<Arc<DownloadService>>,
) -> Result<Response, ApiError> {
    let raw = name
        .strip_suffix(&format!(".{THUMBNAIL_EXTENSION}"))
        .unwrap_or(&name);
    let session_id = SessionId::parse(raw)?;
    let thumbnail = downloads.storage.thumbnail_path(&session_id);
    if is_regular_file(&thumbnail).await? {
        return serve_file(&thumbnail, &request_headers, None).await;
    }
    if let Some(placeholder) = downloads.thumbnails.placeholder()
        && is_regular_file(placeholder).await?
    {
        debug!(session_id = %session_id, "serving placeholder thumbnail");
        return serve_file(placeholder, &request_headers, None).await;
    }
    Err(ApiError::NotFound("thumbnail not found".into()))
}

async fn is_regular_file(path: &FsPath) -> Result<bool, ApiError> {
    match fs::symlink_metadata(path).await {
        Ok(metadata) => Ok(metadata.is_file()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(ApiError::Internal(err.to_string())),
    }
}

/// 流式返回文件，附带 ETag 与 Last-Modified；`download_name` 存在时作为附件下载。
async fn serve_file(
    path: &FsPath,
    request_headers: &HeaderMap,
    download_name: Option<&str>,
) -> Result<Response, ApiError> {
    let file = File::open(path)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let etag = etag_from_metadata(&metadata);

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::ETAG,
        HeaderValue::from_str(&etag).map_err(|_| ApiError::Internal("failed to build headers".into()))?,
    );
    if let Ok(modified) = metadata.modified() {
        response_headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(modified))
                .map_err(|_| ApiError::Internal("failed to build headers".into()))?,
        );
    }
    if not_modified(request_headers, &etag) {
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    let mime = mime_guess::from_path(path).first_or_octet_stream();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid MIME type".into()))?,
    );
    response_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::Internal("failed to build headers".into()))?,
    );
    if let Some(name) = download_name {
        response_headers.insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_str(&format!("attachment; filename=\"{name}\""))
                .map_err(|_| ApiError::Internal("failed to build headers".into()))?,
        );
    }

    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}
