//! Chunkdrop server binary.
//!
//! Accepts chunked uploads, assembles each session's chunks into one artifact
//! named after the session id, reports its SHA3-256 digest, renders
//! thumbnails in the background and serves downloads.
//! The main entry point builds the Axum router and starts the listeners.

mod assembler;
mod atomic;
mod background;
mod chunk_store;
mod config;
mod digest;
mod download;
mod error;
mod etag;
mod http;
mod logging;
mod naming;
mod quarantine;
mod registry;
mod report;
mod storage;
mod thumbnail;
mod tls;
mod token;
mod upload;
mod version;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::middleware;
use axum::routing::{get, post};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::background::spawn_background_tasks;
use crate::config::{Args, parse_extension_list};
use crate::download::DownloadService;
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::registry::UploadRegistry;
use crate::storage::Storage;
use crate::thumbnail::{ThumbnailConfig, ThumbnailPipeline};
use crate::token::{TokenValidator, UploadTokens};
use crate::upload::{UploadConfig, UploadService};

shadow!(build);

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Storage::new(
        PathBuf::from(&args.storage_dir),
        PathBuf::from(&args.chunk_dir),
        PathBuf::from(&args.thumbnail_dir),
        PathBuf::from(&args.reported_dir),
    );
    storage.ensure_dirs().await?;

    let thumbnails = Arc::new(ThumbnailPipeline::new(
        storage.clone(),
        ThumbnailConfig {
            bounds: args.thumbnail_size,
            extensions: parse_extension_list(&args.thumbnail_types),
            placeholder: args.default_thumbnail.as_ref().map(PathBuf::from),
        },
    ));
    let uploads = Arc::new(UploadService::new(
        storage.clone(),
        Arc::new(UploadRegistry::new()),
        thumbnails.clone(),
        UploadConfig {
            max_chunk_size: args.max_chunk_size,
            max_chunks: args.max_chunks,
            max_file_size: args.max_file_size,
        },
    ));
    let downloads = Arc::new(DownloadService::new(
        storage.clone(),
        thumbnails,
        !args.disable_downloads,
    ));
    let tokens = Arc::new(UploadTokens::new(Duration::from_secs(args.token_ttl_secs)));
    let validator: Arc<dyn TokenValidator> = tokens.clone();
    let uploads_for_tasks = uploads.clone();

    let mut app = Router::new()
        .route(
            "/upload",
            post(upload::upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/download/{session_id}", get(download::download_file))
        .route("/thumbnail/{session_id}", get(download::get_thumbnail))
        .route("/report", post(report::report_upload))
        .route("/api/token", get(token::issue_token))
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(uploads))
        .layer(Extension(downloads))
        .layer(Extension(validator))
        .layer(Extension(tokens))
        .layer(Extension(Arc::new(storage)));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let https_addr = SocketAddr::new(host, args.https_port);
    let tls_config = tls::build_rustls_config(&args).await?;
    let handle = Handle::new();

    spawn_background_tasks(uploads_for_tasks, Duration::from_secs(args.scratch_ttl_secs));

    info!("Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(
            app.clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        );

    match tls_config {
        Some(tls_config) => {
            info!("Starting HTTPS server at {}", https_addr);
            let https_server = axum_server::bind_rustls(https_addr, tls_config)
                .handle(handle.clone())
                .serve(app.into_make_service_with_connect_info::<SocketAddr>());
            tokio::select! {
                result = http_server => result?,
                result = https_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
        None => {
            tokio::select! {
                result = http_server => result?,
                _ = shutdown_signal(handle) => {}
            }
        }
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
