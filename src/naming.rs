//! 会话标识校验与文件名清洗。

use std::fmt;

const MAX_SESSION_ID_LEN: usize = 64;
const FALLBACK_FILE_NAME: &str = "upload";

/// 客户端提供的上传会话标识，构造时即完成字符集与长度校验。
///
/// 会话标识会被用作路径片段，因此只允许 `[A-Za-z0-9_-]`。
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionIdError {
    #[error("session id is required")]
    Empty,
    #[error("session id is too long")]
    TooLong,
    #[error("session id contains invalid characters")]
    InvalidCharacter,
}

impl SessionId {
    pub fn parse(value: &str) -> Result<Self, SessionIdError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(SessionIdError::Empty);
        }
        if value.len() > MAX_SESSION_ID_LEN {
            return Err(SessionIdError::TooLong);
        }
        if !value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(SessionIdError::InvalidCharacter);
        }
        Ok(Self(value.to_string()))
    }

    /// 为不分片上传生成新的标识。
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 成品文件名前缀，保证一个标识不会前缀匹配到另一个标识。
    pub fn artifact_prefix(&self) -> String {
        format!("{}_", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 把不可信的原始文件名清洗成安全的单段文件名。
pub fn sanitize_filename(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .filter(char::is_ascii)
        .collect();
    let joined = replaced.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    let trimmed = kept.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// 组合成品文件名：`{session_id}_{sanitized}`。
pub fn artifact_file_name(session_id: &SessionId, original_name: &str) -> String {
    format!(
        "{}{}",
        session_id.artifact_prefix(),
        sanitize_filename(original_name)
    )
}
