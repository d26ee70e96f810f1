//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_HTTP_PORT: u16 = 16273;
pub const DEFAULT_HTTPS_PORT: u16 = 16274;
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_MAX_CHUNKS: u64 = 8192;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024 * 1024;
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 64;
pub const DEFAULT_THUMBNAIL_TYPES: &str =
    ".apng,.bmp,.gif,.jfif,.jpeg,.jpg,.png,.tga,.tif,.tiff,.webp";
pub const DEFAULT_SCRATCH_TTL_SECS: u64 = 0;
pub const SCRATCH_REAP_INTERVAL_SECS: u64 = 900;
pub const COMPLETED_RETENTION_SECS: u64 = 24 * 60 * 60;
pub const COMPLETED_CAPACITY: usize = 65_536;
pub const THUMBNAIL_EXTENSION: &str = "webp";
pub const MIN_REPORT_TEXT_LEN: u64 = 10;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "chunkdrop", version = VERSION_INFO, about = "Chunked file drop server")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "CHUNKDROP_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "CHUNKDROP_HTTP_PORT",
        default_value_t = DEFAULT_HTTP_PORT,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "CHUNKDROP_HTTPS_PORT",
        default_value_t = DEFAULT_HTTPS_PORT,
        help = "HTTPS port (only used when a TLS cert and key are given)"
    )]
    pub https_port: u16,
    #[arg(long, env = "CHUNKDROP_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(long, env = "CHUNKDROP_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(
        short = 's',
        long,
        env = "CHUNKDROP_STORAGE_DIR",
        default_value = ".chunkdrop/storage",
        help = "Directory for completed uploads"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'c',
        long,
        env = "CHUNKDROP_CHUNK_DIR",
        default_value = ".chunkdrop/chunks",
        help = "Scratch directory for in-flight chunks"
    )]
    pub chunk_dir: String,
    #[arg(
        short = 't',
        long,
        env = "CHUNKDROP_THUMBNAIL_DIR",
        default_value = ".chunkdrop/thumbnails",
        help = "Directory for generated thumbnails"
    )]
    pub thumbnail_dir: String,
    #[arg(
        short = 'r',
        long,
        env = "CHUNKDROP_REPORTED_DIR",
        default_value = ".chunkdrop/reported",
        help = "Quarantine directory for reported uploads"
    )]
    pub reported_dir: String,
    #[arg(
        long,
        env = "CHUNKDROP_DEFAULT_THUMBNAIL",
        help = "Placeholder served when an upload has no thumbnail"
    )]
    pub default_thumbnail: Option<String>,
    #[arg(
        short = 'd',
        long,
        env = "CHUNKDROP_DISABLE_DOWNLOADS",
        default_value_t = false,
        help = "Refuse all downloads"
    )]
    pub disable_downloads: bool,
    #[arg(
        long,
        env = "CHUNKDROP_TOKEN_TTL_SECS",
        default_value_t = DEFAULT_TOKEN_TTL_SECS,
        help = "Upload token lifetime in seconds"
    )]
    pub token_ttl_secs: u64,
    #[arg(
        long,
        env = "CHUNKDROP_MAX_CHUNK_SIZE",
        default_value_t = DEFAULT_MAX_CHUNK_SIZE,
        help = "Max size of a single chunk in bytes"
    )]
    pub max_chunk_size: u64,
    #[arg(
        long,
        env = "CHUNKDROP_MAX_CHUNKS",
        default_value_t = DEFAULT_MAX_CHUNKS,
        help = "Max chunks per upload (0 to disable)"
    )]
    pub max_chunks: u64,
    #[arg(
        long,
        env = "CHUNKDROP_MAX_FILE_SIZE",
        default_value_t = DEFAULT_MAX_FILE_SIZE,
        help = "Max size of an unchunked upload in bytes (0 to disable)"
    )]
    pub max_file_size: u64,
    #[arg(
        long,
        env = "CHUNKDROP_THUMBNAIL_SIZE",
        default_value_t = DEFAULT_THUMBNAIL_SIZE,
        help = "Thumbnail bounding box edge in pixels"
    )]
    pub thumbnail_size: u32,
    #[arg(
        long,
        env = "CHUNKDROP_THUMBNAIL_TYPES",
        default_value = DEFAULT_THUMBNAIL_TYPES,
        help = "Comma separated file extensions that get a thumbnail"
    )]
    pub thumbnail_types: String,
    #[arg(
        long,
        env = "CHUNKDROP_SCRATCH_TTL_SECS",
        default_value_t = DEFAULT_SCRATCH_TTL_SECS,
        help = "Remove abandoned chunk directories older than this (0 to disable)"
    )]
    pub scratch_ttl_secs: u64,
    #[arg(
        long,
        env = "CHUNKDROP_CORS_ORIGINS",
        help = "Comma separated CORS origins"
    )]
    pub cors_origins: Option<String>,
}

/// 解析逗号分隔的扩展名列表，统一为小写并补齐前导点。
pub fn parse_extension_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let lower = item.to_ascii_lowercase();
            if lower.starts_with('.') {
                lower
            } else {
                format!(".{lower}")
            }
        })
        .collect()
}
