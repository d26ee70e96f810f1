//! 举报处理器：校验举报内容后隔离对应上传。

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, FromRequest, Json, Request};
use axum::response::Json as JsonResponse;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::config::MIN_REPORT_TEXT_LEN;
use crate::error::ApiError;
use crate::naming::SessionId;
use crate::quarantine::{QuarantineOutcome, quarantine};
use crate::storage::Storage;

#[derive(Debug, Deserialize, Validate)]
pub struct ReportRequest {
    #[validate(email(message = "invalid email address"))]
    pub email: String,
    pub uuid: String,
    #[serde(alias = "supportingText")]
    #[validate(custom(function = "supporting_text_long_enough"))]
    pub supporting_text: String,
}

fn supporting_text_long_enough(value: &str) -> Result<(), ValidationError> {
    if (value.trim().chars().count() as u64) < MIN_REPORT_TEXT_LEN {
        return Err(ValidationError::new("supporting_text_too_short").with_message(
            format!("supporting text must be at least {MIN_REPORT_TEXT_LEN} characters").into(),
        ));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct ReportResponse {
    pub quarantined: bool,
    #[serde(flatten)]
    pub outcome: QuarantineOutcome,
}

/// 反序列化 JSON 后立即执行 `Validate`，失败映射为 400。
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Validate,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|err| ApiError::BadRequest(err.body_text()))?;
        value.validate().map_err(validation_message)?;
        Ok(ValidatedJson(value))
    }
}

fn validation_message(errors: ValidationErrors) -> ApiError {
    let mut messages: Vec<String> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, field_errors)| {
            field_errors.iter().map(move |err| {
                err.message
                    .as_ref()
                    .map(|message| format!("{field}: {message}"))
                    .unwrap_or_else(|| format!("{field}: invalid value"))
            })
        })
        .collect();
    messages.sort();
    ApiError::BadRequest(messages.join("; "))
}

/// `POST /report`：把被举报会话的成品与缩略图移入隔离区。
pub async fn report_upload(
    Extension(storage): Extension<Arc<Storage>>,
    ValidatedJson(report): ValidatedJson<ReportRequest>,
) -> Result<JsonResponse<ReportResponse>, ApiError> {
    let session_id = SessionId::parse(&report.uuid)?;
    info!(
        session_id = %session_id,
        reporter = %report.email,
        supporting_text = %report.supporting_text.trim(),
        "upload reported"
    );
    let outcome = quarantine(&storage, &session_id).await?;
    Ok(JsonResponse(ReportResponse {
        quarantined: !outcome.is_empty(),
        outcome,
    }))
}
