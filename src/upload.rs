//! 分片上传处理器：落盘、登记、合并与整文件上传。

use axum::body::Bytes;
use axum::extract::{Extension, Multipart};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use axum_extra::extract::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};
use futures_util::stream::{Stream, StreamExt};
use serde::Serialize;
use std::fmt::Display;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::assembler::{AssembleError, assemble};
use crate::atomic::AtomicFile;
use crate::chunk_store::ChunkStore;
use crate::digest::{ContentDigest, ContentHasher};
use crate::error::ApiError;
use crate::naming::{SessionId, artifact_file_name};
use crate::registry::UploadRegistry;
use crate::storage::Storage;
use crate::thumbnail::ThumbnailPipeline;
use crate::token::{TokenValidator, authorize};

const CHUNK_ACK: &str = "Chunk upload successful";

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub max_chunk_size: u64,
    pub max_chunks: u64,
    pub max_file_size: u64,
}

/// 一个分片请求的元数据。
#[derive(Debug, Clone)]
pub struct ChunkMeta {
    pub session_id: SessionId,
    pub chunk_index: u64,
    pub total_chunks: u64,
    pub file_name: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct UploadReceipt {
    #[serde(flatten)]
    pub digest: ContentDigest,
    /// 整文件上传时服务端生成的会话标识。
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    ChunkAccepted,
    Completed(UploadReceipt),
}

impl IntoResponse for UploadOutcome {
    fn into_response(self) -> Response {
        match self {
            UploadOutcome::ChunkAccepted => (StatusCode::OK, CHUNK_ACK).into_response(),
            UploadOutcome::Completed(receipt) => JsonResponse(receipt).into_response(),
        }
    }
}

/// 分片与整文件上传的核心流程。
pub struct UploadService {
    storage: Storage,
    chunks: ChunkStore,
    registry: Arc<UploadRegistry>,
    thumbnails: Arc<ThumbnailPipeline>,
    config: UploadConfig,
}

impl UploadService {
    pub fn new(
        storage: Storage,
        registry: Arc<UploadRegistry>,
        thumbnails: Arc<ThumbnailPipeline>,
        config: UploadConfig,
    ) -> Self {
        let chunks = ChunkStore::new(storage.scratch_root().to_path_buf(), config.max_chunk_size);
        Self {
            storage,
            chunks,
            registry,
            thumbnails,
            config,
        }
    }

    /// 接收一个分片：先落盘，成功后再登记；认领到合并的调用方负责合并与收尾。
    pub async fn submit_chunk<S, E>(&self, meta: &ChunkMeta, body: S) -> Result<UploadOutcome, ApiError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let ChunkMeta {
            session_id,
            chunk_index,
            total_chunks,
            file_name,
        } = meta;
        if self.config.max_chunks > 0 && *total_chunks > self.config.max_chunks {
            return Err(ApiError::BadRequest("upload chunk count exceeds limit".into()));
        }
        self.registry
            .precheck(session_id, *chunk_index, *total_chunks)
            .await?;

        self.chunks
            .write_chunk(session_id, *chunk_index, body)
            .await?;

        let registration = self
            .registry
            .register(session_id, *chunk_index, *total_chunks, file_name)
            .await?;
        if !registration.accepted_now {
            debug!(session_id = %session_id, chunk_index, "duplicate chunk delivery");
        }
        if !registration.is_complete {
            debug!(
                session_id = %session_id,
                received = registration.received,
                expected = registration.expected_total,
                "chunk registered"
            );
            return Ok(UploadOutcome::ChunkAccepted);
        }

        let destination = self
            .storage
            .artifact_path(&artifact_file_name(session_id, &registration.file_name));
        match assemble(
            &self.chunks,
            session_id,
            registration.expected_total,
            &destination,
        )
        .await
        {
            Ok(artifact) => {
                self.registry.finish(session_id).await;
                info!(session_id = %session_id, file_name = %registration.file_name, "upload complete");
                self.thumbnails.spawn(artifact.path, session_id.clone());
                Ok(UploadOutcome::Completed(UploadReceipt {
                    digest: artifact.digest,
                    uuid: None,
                }))
            }
            Err(err @ AssembleError::AlreadyExists(_)) => {
                warn!(session_id = %session_id, "artifact already exists, dropping chunks");
                self.registry.finish(session_id).await;
                self.chunks.remove_session(session_id).await;
                Err(err.into())
            }
            Err(err) => {
                self.registry.release(session_id).await;
                Err(err.into())
            }
        }
    }

    /// 不分片上传：绕过登记表，直接以新生成的标识落盘，摘要算法与分片上传一致。
    pub async fn submit_whole_file<S, E>(&self, file_name: &str, body: S) -> Result<UploadOutcome, ApiError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let session_id = SessionId::generate();
        let destination = self
            .storage
            .artifact_path(&artifact_file_name(&session_id, file_name));
        let mut atomic = AtomicFile::new(&destination).await?;
        let digest = match hash_into(&mut atomic, body, self.config.max_file_size).await {
            Ok(digest) => digest,
            Err(err) => {
                atomic.cleanup().await;
                return Err(err);
            }
        };
        atomic.finalize_new().await?;

        info!(
            session_id = %session_id,
            file_name,
            size = digest.size,
            digest = %digest.sha3_256,
            "whole file upload complete"
        );
        self.thumbnails.spawn(destination, session_id.clone());
        Ok(UploadOutcome::Completed(UploadReceipt {
            digest,
            uuid: Some(session_id.to_string()),
        }))
    }

    /// 清理空闲超过 `ttl` 的会话暂存目录，并遗忘对应登记。
    ///
    /// 已登记的会话按最后一次分片到达时间判断，没有登记的孤立目录按目录修改时间判断。
    pub async fn reap_stale(&self, ttl: Duration) -> io::Result<u64> {
        if ttl.is_zero() {
            return Ok(0);
        }
        let mut removed = 0;
        for session_id in self.registry.stale_sessions(ttl).await {
            if self.reap_session(&session_id, ttl).await {
                removed += 1;
                info!(session_id = %session_id, "forgot stale upload session");
            }
        }

        let mut dir = match fs::read_dir(self.storage.scratch_root()).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(removed),
            Err(err) => return Err(err),
        };
        let now = SystemTime::now();
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let Ok(age) = metadata
                .modified()
                .and_then(|modified| now.duration_since(modified).map_err(io::Error::other))
            else {
                continue;
            };
            if age < ttl {
                continue;
            }
            let name = entry.file_name();
            let Ok(session_id) = SessionId::parse(&name.to_string_lossy()) else {
                continue;
            };
            if self.reap_session(&session_id, ttl).await {
                removed += 1;
                info!(path = ?entry.path(), "removed stale chunk dir");
            }
        }
        Ok(removed)
    }

    /// 登记表先拒绝该会话的新分片，再删除暂存目录。
    async fn reap_session(&self, session_id: &SessionId, ttl: Duration) -> bool {
        if !self.registry.begin_reap(session_id, ttl).await {
            return false;
        }
        self.chunks.remove_session(session_id).await;
        self.registry.end_reap(session_id).await;
        true
    }
}

async fn hash_into<S, E>(atomic: &mut AtomicFile, body: S, limit: u64) -> Result<ContentDigest, ApiError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    futures_util::pin_mut!(body);
    let mut hasher = ContentHasher::new();
    let mut total_written: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|err| ApiError::BadRequest(err.to_string()))?;
        if chunk.is_empty() {
            continue;
        }
        total_written += chunk.len() as u64;
        if limit > 0 && total_written > limit {
            return Err(ApiError::PayloadTooLarge("upload size exceeds limit".into()));
        }
        hasher.update(&chunk);
        atomic.write_all(&chunk).await?;
    }
    Ok(hasher.finish())
}

/// Dropzone 在文件之前发送的分片字段。
#[derive(Default)]
struct ChunkFields {
    uuid: Option<String>,
    index: Option<String>,
    total: Option<String>,
}

impl ChunkFields {
    /// 没有 `dzuuid` 时返回 `None`，表示整文件上传。
    fn into_meta(self, file_name: String) -> Result<Option<ChunkMeta>, ApiError> {
        let Some(uuid) = self.uuid else {
            return Ok(None);
        };
        let session_id = SessionId::parse(&uuid)?;
        let index = self.index.ok_or_else(|| {
            ApiError::BadRequest("Not all required fields supplied, missing dzchunkindex".into())
        })?;
        let total = self.total.ok_or_else(|| {
            ApiError::BadRequest(
                "Not all required fields supplied, missing dztotalchunkcount".into(),
            )
        })?;
        let parse = |value: &str| {
            value.trim().parse::<u64>().map_err(|_| {
                ApiError::BadRequest("Values provided were not in expected format".into())
            })
        };
        Ok(Some(ChunkMeta {
            session_id,
            chunk_index: parse(&index)?,
            total_chunks: parse(&total)?,
            file_name,
        }))
    }
}

/// `POST /upload`：校验令牌后解析 multipart，分派到分片或整文件流程。
pub async fn upload_file(
    Extension(uploads): Extension<Arc<UploadService>>,
    Extension(tokens): Extension<Arc<dyn TokenValidator>>,
    headers: HeaderMap,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut multipart: Multipart,
) -> Result<UploadOutcome, ApiError> {
    authorize(
        tokens.as_ref(),
        &headers,
        bearer.as_ref().map(|TypedHeader(auth)| auth),
    )?;

    let mut fields = ChunkFields::default();
    let mut outcome = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "dzuuid" | "dzchunkindex" | "dztotalchunkcount" if outcome.is_some() => {
                warn!(field = name, "chunk field after file ignored");
            }
            "dzuuid" | "dzchunkindex" | "dztotalchunkcount" => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| ApiError::BadRequest(err.body_text()))?;
                match name.as_str() {
                    "dzuuid" => fields.uuid = Some(value),
                    "dzchunkindex" => fields.index = Some(value),
                    _ => fields.total = Some(value),
                }
            }
            "file" => {
                if outcome.is_some() {
                    return Err(ApiError::BadRequest("only one file per request".into()));
                }
                let file_name = field.file_name().unwrap_or_default().to_string();
                let meta = std::mem::take(&mut fields).into_meta(file_name.clone())?;
                outcome = Some(match meta {
                    Some(meta) => uploads.submit_chunk(&meta, field).await?,
                    None => uploads.submit_whole_file(&file_name, field).await?,
                });
            }
            _ => {}
        }
    }

    outcome.ok_or_else(|| ApiError::BadRequest("No file provided".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::body_of;
    use crate::config::{DEFAULT_THUMBNAIL_SIZE, DEFAULT_THUMBNAIL_TYPES, parse_extension_list};
    use crate::digest::sha3_hex;
    use crate::thumbnail::ThumbnailConfig;
    use crate::token::{TOKEN_HEADER, UploadTokens};
    use axum::body::Body as AxumBody;
    use axum::extract::FromRequest;
    use axum::http::{HeaderValue, Request, header};
    use tempfile::tempdir;

    struct Harness {
        _temp: tempfile::TempDir,
        storage: Storage,
        registry: Arc<UploadRegistry>,
        thumbnails: Arc<ThumbnailPipeline>,
        uploads: Arc<UploadService>,
    }

    async fn harness() -> Harness {
        let temp = tempdir().expect("tempdir");
        let storage = Storage::under(temp.path());
        storage.ensure_dirs().await.expect("ensure dirs");
        let registry = Arc::new(UploadRegistry::new());
        let thumbnails = Arc::new(ThumbnailPipeline::new(
            storage.clone(),
            ThumbnailConfig {
                bounds: DEFAULT_THUMBNAIL_SIZE,
                extensions: parse_extension_list(DEFAULT_THUMBNAIL_TYPES),
                placeholder: None,
            },
        ));
        let uploads = Arc::new(UploadService::new(
            storage.clone(),
            registry.clone(),
            thumbnails.clone(),
            UploadConfig {
                max_chunk_size: 1024,
                max_chunks: 16,
                max_file_size: 1024,
            },
        ));
        Harness {
            _temp: temp,
            storage,
            registry,
            thumbnails,
            uploads,
        }
    }

    fn meta(session: &str, index: u64, total: u64, file_name: &str) -> ChunkMeta {
        ChunkMeta {
            session_id: SessionId::parse(session).expect("id"),
            chunk_index: index,
            total_chunks: total,
            file_name: file_name.to_string(),
        }
    }

    fn public_files(storage: &Storage) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(storage.public_root())
            .expect("list")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn receipt(outcome: UploadOutcome) -> UploadReceipt {
        match outcome {
            UploadOutcome::Completed(receipt) => receipt,
            UploadOutcome::ChunkAccepted => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn out_of_order_chunks_assemble_in_index_order() {
        let h = harness().await;
        let payloads: [&'static [u8]; 3] = [b"AA", b"BB", b"CC"];

        for index in [2u64, 0] {
            let outcome = h
                .uploads
                .submit_chunk(&meta("S", index, 3, "file.bin"), body_of(payloads[index as usize]))
                .await
                .unwrap_or_else(|_| panic!("chunk {index} failed"));
            assert_eq!(outcome, UploadOutcome::ChunkAccepted);
        }
        let done = h
            .uploads
            .submit_chunk(&meta("S", 1, 3, "file.bin"), body_of(payloads[1]))
            .await
            .unwrap_or_else(|_| panic!("final chunk failed"));

        let receipt = receipt(done);
        assert_eq!(receipt.digest.size, 6);
        assert_eq!(receipt.digest.sha3_256, sha3_hex(b"AABBCC"));
        assert_eq!(receipt.uuid, None);
        assert_eq!(
            std::fs::read(h.storage.artifact_path("S_file.bin")).expect("read"),
            b"AABBCC"
        );
        assert!(!h.storage.scratch_root().join("S").exists());
    }

    #[tokio::test]
    async fn every_arrival_order_yields_same_artifact() {
        let orders: [[u64; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        let payloads: [&'static [u8]; 3] = [b"one-", b"two-", b"three"];
        for (round, order) in orders.iter().enumerate() {
            let h = harness().await;
            let session = format!("perm{round}");
            let mut receipts = Vec::new();
            for &index in order {
                let outcome = h
                    .uploads
                    .submit_chunk(&meta(&session, index, 3, "p.txt"), body_of(payloads[index as usize]))
                    .await
                    .unwrap_or_else(|_| panic!("chunk failed"));
                if let UploadOutcome::Completed(receipt) = outcome {
                    receipts.push(receipt);
                }
            }
            assert_eq!(receipts.len(), 1, "order {order:?}");
            assert_eq!(receipts[0].digest.sha3_256, sha3_hex(b"one-two-three"));
            assert_eq!(
                std::fs::read(h.storage.artifact_path(&format!("{session}_p.txt"))).expect("read"),
                b"one-two-three"
            );
        }
    }

    #[tokio::test]
    async fn redelivered_chunks_never_trigger_a_second_assembly() {
        let h = harness().await;
        for _ in 0..3 {
            let outcome = h
                .uploads
                .submit_chunk(&meta("dup", 0, 2, "d.bin"), body_of(b"x"))
                .await
                .unwrap_or_else(|_| panic!("chunk failed"));
            assert_eq!(outcome, UploadOutcome::ChunkAccepted);
        }
        let done = h
            .uploads
            .submit_chunk(&meta("dup", 1, 2, "d.bin"), body_of(b"y"))
            .await
            .unwrap_or_else(|_| panic!("final chunk failed"));
        assert_eq!(receipt(done).digest.size, 2);

        let late = h
            .uploads
            .submit_chunk(&meta("dup", 1, 2, "d.bin"), body_of(b"y"))
            .await;
        assert!(matches!(late, Err(ApiError::Conflict(_))));
        assert_eq!(public_files(&h.storage), vec!["dup_d.bin".to_string()]);
        assert!(!h.storage.scratch_root().join("dup").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_final_chunks_assemble_once() {
        for round in 0..20 {
            let h = harness().await;
            let session = format!("race{round}");
            for index in 0..2u64 {
                h.uploads
                    .submit_chunk(&meta(&session, index, 4, "r.bin"), body_of(b"ab"))
                    .await
                    .unwrap_or_else(|_| panic!("chunk failed"));
            }

            let mut handles = Vec::new();
            for index in [2u64, 3] {
                let uploads = h.uploads.clone();
                let meta = meta(&session, index, 4, "r.bin");
                handles.push(tokio::spawn(async move {
                    uploads.submit_chunk(&meta, body_of(b"cd")).await.ok()
                }));
            }
            let mut completions = 0;
            for handle in handles {
                match handle.await.expect("join") {
                    Some(UploadOutcome::Completed(receipt)) => {
                        completions += 1;
                        assert_eq!(receipt.digest.sha3_256, sha3_hex(b"ababcdcd"));
                    }
                    Some(UploadOutcome::ChunkAccepted) => {}
                    None => panic!("chunk submission failed"),
                }
            }
            assert_eq!(completions, 1, "round {round}");
            assert_eq!(public_files(&h.storage).len(), 1);
        }
    }

    #[tokio::test]
    async fn failed_chunk_write_is_not_registered() {
        let h = harness().await;
        let broken = futures_util::stream::iter(vec![Ok(Bytes::from_static(b"A")), Err("reset")]);
        let result = h
            .uploads
            .submit_chunk(&meta("flaky", 0, 1, "f.bin"), broken)
            .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
        assert!(h.registry.stale_sessions(Duration::ZERO).await.is_empty());

        let oversized = h
            .uploads
            .submit_chunk(&meta("flaky", 0, 1, "f.bin"), futures_util::stream::iter(vec![
                Ok::<_, std::convert::Infallible>(Bytes::from(vec![0u8; 2048])),
            ]))
            .await;
        assert!(matches!(oversized, Err(ApiError::PayloadTooLarge(_))));

        let done = h
            .uploads
            .submit_chunk(&meta("flaky", 0, 1, "f.bin"), body_of(b"AA"))
            .await
            .unwrap_or_else(|_| panic!("retry failed"));
        assert_eq!(receipt(done).digest.sha3_256, sha3_hex(b"AA"));
    }

    #[tokio::test]
    async fn failed_assembly_releases_claim_for_retry() {
        let h = harness().await;
        let id = SessionId::parse("lost").expect("id");
        h.uploads
            .submit_chunk(&meta("lost", 0, 2, "l.bin"), body_of(b"AA"))
            .await
            .unwrap_or_else(|_| panic!("chunk failed"));
        std::fs::remove_file(h.storage.scratch_root().join("lost").join("0")).expect("remove chunk");

        let result = h
            .uploads
            .submit_chunk(&meta("lost", 1, 2, "l.bin"), body_of(b"BB"))
            .await;
        assert!(matches!(result, Err(ApiError::Inconsistent(_))));
        assert!(public_files(&h.storage).is_empty());

        let retried = h
            .uploads
            .submit_chunk(&meta("lost", 0, 2, "l.bin"), body_of(b"AA"))
            .await
            .unwrap_or_else(|_| panic!("retry failed"));
        assert_eq!(receipt(retried).digest.sha3_256, sha3_hex(b"AABB"));
        assert!(h.registry.stale_sessions(Duration::ZERO).await.is_empty());
        assert!(!h.storage.scratch_root().join(id.as_str()).exists());
    }

    #[tokio::test]
    async fn inconsistent_declarations_are_rejected_before_writing() {
        let h = harness().await;
        h.uploads
            .submit_chunk(&meta("shape", 0, 3, "s.bin"), body_of(b"A"))
            .await
            .unwrap_or_else(|_| panic!("chunk failed"));

        let mismatch = h
            .uploads
            .submit_chunk(&meta("shape", 1, 5, "s.bin"), body_of(b"B"))
            .await;
        assert!(matches!(mismatch, Err(ApiError::BadRequest(_))));
        let out_of_range = h
            .uploads
            .submit_chunk(&meta("shape", 3, 3, "s.bin"), body_of(b"B"))
            .await;
        assert!(matches!(out_of_range, Err(ApiError::BadRequest(_))));
        let too_many = h
            .uploads
            .submit_chunk(&meta("many", 0, 17, "s.bin"), body_of(b"B"))
            .await;
        assert!(matches!(too_many, Err(ApiError::BadRequest(_))));
        assert!(!h.storage.scratch_root().join("shape").join("1").exists());
    }

    #[tokio::test]
    async fn thumbnail_failure_does_not_affect_response() {
        let h = harness().await;
        let id = SessionId::parse("pic").expect("id");
        let done = h
            .uploads
            .submit_chunk(&meta("pic", 0, 1, "photo.png"), body_of(b"not really a png"))
            .await
            .unwrap_or_else(|_| panic!("upload failed"));
        let receipt = receipt(done);
        assert_eq!(receipt.digest.sha3_256, sha3_hex(b"not really a png"));
        assert_eq!(receipt.digest.size, 16);

        let artifact = h.storage.artifact_path("pic_photo.png");
        assert!(artifact.exists());
        assert!(!h.thumbnails.maybe_generate(&artifact, &id).await);
        assert!(!h.storage.thumbnail_path(&id).exists());
        assert_eq!(
            std::fs::read_dir(h.storage.thumbnail_path(&id).parent().expect("thumbnail dir"))
                .expect("list")
                .count(),
            0
        );
    }

    #[tokio::test]
    async fn whole_file_bypasses_registry() {
        let h = harness().await;
        let done = h
            .uploads
            .submit_whole_file("photo.png", body_of(b"whole"))
            .await
            .unwrap_or_else(|_| panic!("upload failed"));
        let receipt = receipt(done);
        let uuid = receipt.uuid.expect("generated id");
        assert_eq!(receipt.digest.sha3_256, sha3_hex(b"whole"));
        assert_eq!(receipt.digest.size, 5);
        assert_eq!(public_files(&h.storage), vec![format!("{uuid}_photo.png")]);
        assert!(h.registry.stale_sessions(Duration::ZERO).await.is_empty());
    }

    #[tokio::test]
    async fn whole_file_respects_size_limit() {
        let h = harness().await;
        let big = futures_util::stream::iter(vec![Ok::<_, std::convert::Infallible>(Bytes::from(
            vec![1u8; 4096],
        ))]);
        let result = h.uploads.submit_whole_file("big.bin", big).await;
        assert!(matches!(result, Err(ApiError::PayloadTooLarge(_))));
        assert!(public_files(&h.storage).is_empty());
    }

    #[tokio::test]
    async fn reaper_removes_abandoned_sessions() {
        let h = harness().await;
        h.uploads
            .submit_chunk(&meta("abandoned", 0, 2, "a.bin"), body_of(b"A"))
            .await
            .unwrap_or_else(|_| panic!("chunk failed"));
        assert_eq!(h.uploads.reap_stale(Duration::ZERO).await.expect("reap"), 0);
        assert!(h.storage.scratch_root().join("abandoned").exists());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = h
            .uploads
            .reap_stale(Duration::from_millis(10))
            .await
            .expect("reap");
        assert_eq!(removed, 1);
        assert!(!h.storage.scratch_root().join("abandoned").exists());
        assert!(h.registry.stale_sessions(Duration::ZERO).await.is_empty());
    }

    #[tokio::test]
    async fn reaper_spares_sessions_with_recent_chunks() {
        let h = harness().await;
        h.uploads
            .submit_chunk(&meta("slow", 0, 3, "s.bin"), body_of(b"AA"))
            .await
            .unwrap_or_else(|_| panic!("chunk failed"));
        tokio::time::sleep(Duration::from_millis(120)).await;
        h.uploads
            .submit_chunk(&meta("slow", 1, 3, "s.bin"), body_of(b"BB"))
            .await
            .unwrap_or_else(|_| panic!("chunk failed"));

        let removed = h
            .uploads
            .reap_stale(Duration::from_millis(80))
            .await
            .expect("reap");
        assert_eq!(removed, 0);
        assert!(h.storage.scratch_root().join("slow").exists());

        let done = h
            .uploads
            .submit_chunk(&meta("slow", 2, 3, "s.bin"), body_of(b"CC"))
            .await
            .unwrap_or_else(|_| panic!("final chunk failed"));
        assert_eq!(receipt(done).digest.sha3_256, sha3_hex(b"AABBCC"));
    }

    #[tokio::test]
    async fn reaper_removes_orphaned_scratch_dirs() {
        let h = harness().await;
        let orphan = h.storage.scratch_root().join("orphan");
        std::fs::create_dir_all(&orphan).expect("create orphan");
        std::fs::write(orphan.join("0"), b"x").expect("write chunk");

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = h
            .uploads
            .reap_stale(Duration::from_millis(10))
            .await
            .expect("reap");
        assert_eq!(removed, 1);
        assert!(!orphan.exists());
    }

    #[test]
    fn receipt_serializes_flat_digest() {
        let chunked = UploadReceipt {
            digest: ContentDigest {
                sha3_256: "ab".into(),
                size: 2,
            },
            uuid: None,
        };
        assert_eq!(
            serde_json::to_value(&chunked).expect("json"),
            serde_json::json!({ "sha3_256": "ab", "size": 2 })
        );

        let whole = UploadReceipt {
            uuid: Some("generated".into()),
            ..chunked
        };
        assert_eq!(
            serde_json::to_value(&whole).expect("json")["uuid"],
            "generated"
        );
    }

    const BOUNDARY: &str = "chunkdrop-test-boundary";

    fn multipart_request(token: Option<&str>, parts: &[(&str, Option<&str>, &[u8])]) -> Request<AxumBody> {
        let mut body = Vec::new();
        for (name, file_name, data) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match file_name {
                Some(file_name) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        let mut builder = Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            );
        if let Some(token) = token {
            builder = builder.header(TOKEN_HEADER, HeaderValue::from_str(token).expect("token"));
        }
        builder.body(AxumBody::from(body)).expect("request")
    }

    async fn call_upload(
        h: &Harness,
        tokens: &Arc<UploadTokens>,
        request: Request<AxumBody>,
    ) -> Result<UploadOutcome, ApiError> {
        let headers = request.headers().clone();
        let multipart = Multipart::from_request(request, &())
            .await
            .expect("multipart request");
        let validator: Arc<dyn TokenValidator> = tokens.clone();
        upload_file(
            Extension(h.uploads.clone()),
            Extension(validator),
            headers,
            None,
            multipart,
        )
        .await
    }

    fn test_tokens() -> Arc<UploadTokens> {
        Arc::new(UploadTokens::with_secret(b"upload-test", Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn handler_rejects_missing_token() {
        let h = harness().await;
        let tokens = test_tokens();
        let request = multipart_request(None, &[("file", Some("a.bin"), b"data")]);
        let result = call_upload(&h, &tokens, request).await;
        assert!(matches!(result, Err(ApiError::Forbidden(_))));
        assert!(public_files(&h.storage).is_empty());
    }

    #[tokio::test]
    async fn handler_runs_chunked_flow() {
        let h = harness().await;
        let tokens = test_tokens();
        let token = tokens.issue().unwrap_or_else(|_| panic!("issue failed")).token;

        let first = multipart_request(
            Some(&token),
            &[
                ("dzuuid", None, b"web"),
                ("dzchunkindex", None, b"1"),
                ("dztotalchunkcount", None, b"2"),
                ("file", Some("doc.txt"), b"world"),
            ],
        );
        let outcome = call_upload(&h, &tokens, first)
            .await
            .unwrap_or_else(|_| panic!("first chunk failed"));
        assert_eq!(outcome, UploadOutcome::ChunkAccepted);

        let second = multipart_request(
            Some(&token),
            &[
                ("dzuuid", None, b"web"),
                ("dzchunkindex", None, b"0"),
                ("dztotalchunkcount", None, b"2"),
                ("file", Some("doc.txt"), b"hello "),
            ],
        );
        let outcome = call_upload(&h, &tokens, second)
            .await
            .unwrap_or_else(|_| panic!("second chunk failed"));
        assert_eq!(receipt(outcome).digest.sha3_256, sha3_hex(b"hello world"));
        assert_eq!(
            std::fs::read(h.storage.artifact_path("web_doc.txt")).expect("read"),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn handler_validates_fields() {
        let h = harness().await;
        let tokens = test_tokens();
        let token = tokens.issue().unwrap_or_else(|_| panic!("issue failed")).token;

        let non_numeric = multipart_request(
            Some(&token),
            &[
                ("dzuuid", None, b"bad"),
                ("dzchunkindex", None, b"one"),
                ("dztotalchunkcount", None, b"2"),
                ("file", Some("a.bin"), b"x"),
            ],
        );
        assert!(matches!(
            call_upload(&h, &tokens, non_numeric).await,
            Err(ApiError::BadRequest(_))
        ));

        let missing_total = multipart_request(
            Some(&token),
            &[
                ("dzuuid", None, b"bad"),
                ("dzchunkindex", None, b"0"),
                ("file", Some("a.bin"), b"x"),
            ],
        );
        assert!(matches!(
            call_upload(&h, &tokens, missing_total).await,
            Err(ApiError::BadRequest(_))
        ));

        let traversal = multipart_request(
            Some(&token),
            &[
                ("dzuuid", None, b"../escape"),
                ("dzchunkindex", None, b"0"),
                ("dztotalchunkcount", None, b"1"),
                ("file", Some("a.bin"), b"x"),
            ],
        );
        assert!(matches!(
            call_upload(&h, &tokens, traversal).await,
            Err(ApiError::BadRequest(_))
        ));

        let no_file = multipart_request(Some(&token), &[("dzuuid", None, b"bad")]);
        assert!(matches!(
            call_upload(&h, &tokens, no_file).await,
            Err(ApiError::BadRequest(_))
        ));
        assert!(public_files(&h.storage).is_empty());
        assert_eq!(
            std::fs::read_dir(h.storage.scratch_root()).expect("list").count(),
            0
        );
    }

    #[tokio::test]
    async fn handler_takes_whole_file_path_without_dzuuid() {
        let h = harness().await;
        let tokens = test_tokens();
        let token = tokens.issue().unwrap_or_else(|_| panic!("issue failed")).token;
        let request = multipart_request(Some(&token), &[("file", Some("photo.png"), b"pixels")]);

        let receipt = receipt(
            call_upload(&h, &tokens, request)
                .await
                .unwrap_or_else(|_| panic!("upload failed")),
        );
        assert_eq!(receipt.digest.sha3_256, sha3_hex(b"pixels"));
        let uuid = receipt.uuid.expect("generated id");
        assert_eq!(public_files(&h.storage), vec![format!("{uuid}_photo.png")]);
    }
}
