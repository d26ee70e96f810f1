//! TLS 证书加载：只有同时提供证书与私钥时才启用 HTTPS。

use axum_server::tls_rustls::RustlsConfig;
use std::io;
use std::path::Path;
use tracing::info;

use crate::config::Args;

/// 读取 PEM 证书与私钥；未配置时返回 `None`，只配置其一视为错误。
pub async fn build_rustls_config(args: &Args) -> io::Result<Option<RustlsConfig>> {
    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            let config = RustlsConfig::from_pem_file(Path::new(cert), Path::new(key)).await?;
            info!(cert = %cert, "loaded TLS certificate");
            Ok(Some(config))
        }
        (None, None) => Ok(None),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "both --tls-cert and --tls-key are required for HTTPS",
        )),
    }
}
