//! 上传凭证：带过期时间的签名令牌，上传路径只通过 `TokenValidator` 使用它。

use axum::extract::Extension;
use axum::http::HeaderMap;
use axum::response::Json as JsonResponse;
use axum_extra::headers::{Authorization, authorization::Bearer};
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::ApiError;

pub const TOKEN_HEADER: &str = "token";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenRejection {
    #[error("missing upload token")]
    Missing,
    #[error("upload token is invalid")]
    Invalid,
    #[error("upload token expired, please reload the page")]
    Expired,
}

/// 凭证校验的窄接口。
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<(), TokenRejection>;
}

#[derive(Debug, Serialize, Deserialize)]
struct UploadClaims {
    exp: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: String,
}

/// HS256 令牌签发与校验，密钥在进程启动时随机生成。
pub struct UploadTokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl UploadTokens {
    pub fn new(ttl: Duration) -> Self {
        let mut secret = [0u8; 64];
        rand::rng().fill_bytes(&mut secret);
        Self::with_secret(&secret, ttl)
    }

    pub fn with_secret(secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    pub fn issue(&self) -> Result<IssuedToken, ApiError> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|_| ApiError::Internal("token ttl out of range".into()))?;
        let expires: DateTime<Utc> = Utc::now() + ttl;
        self.issue_until(expires)
    }

    fn issue_until(&self, expires: DateTime<Utc>) -> Result<IssuedToken, ApiError> {
        let claims = UploadClaims {
            exp: expires.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        Ok(IssuedToken {
            token,
            expires_at: expires.to_rfc3339(),
        })
    }
}

impl TokenValidator for UploadTokens {
    fn validate(&self, token: &str) -> Result<(), TokenRejection> {
        match decode::<UploadClaims>(token, &self.decoding, &self.validation) {
            Ok(_) => Ok(()),
            Err(err) => match err.kind() {
                JwtErrorKind::ExpiredSignature => Err(TokenRejection::Expired),
                _ => {
                    debug!(error = %err, "rejected upload token");
                    Err(TokenRejection::Invalid)
                }
            },
        }
    }
}

/// 从 `token` 头或 `Authorization: Bearer` 头取出令牌并校验。
pub fn authorize(
    validator: &dyn TokenValidator,
    headers: &HeaderMap,
    bearer: Option<&Authorization<Bearer>>,
) -> Result<(), TokenRejection> {
    let token = headers
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| bearer.map(|auth| auth.token()))
        .ok_or(TokenRejection::Missing)?;
    validator.validate(token)
}

/// 签发新的上传令牌。
pub async fn issue_token(
    Extension(tokens): Extension<Arc<UploadTokens>>,
) -> Result<JsonResponse<IssuedToken>, ApiError> {
    Ok(JsonResponse(tokens.issue()?))
}
