//! The `{code, result, message}` response envelope shared by every endpoint.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ApiError;

pub const SUCCESS_CODE: i64 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub code: i64,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Envelope {
    pub fn fail(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            result: Value::Null,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }

    /// User-facing failure reason.
    ///
    /// Most endpoints put it in `message`, a few put it in `result`; both are
    /// accepted, `message` first.
    pub fn failure_message(&self) -> Option<String> {
        let from_message = self
            .message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty());

        let from_result = self
            .result
            .as_str()
            .map(str::trim)
            .filter(|m| !m.is_empty());

        from_message.or(from_result).map(str::to_string)
    }

    /// Unwrap `result` as `T`, or turn a non-success code into
    /// [`ApiError::Remote`].
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        if !self.is_success() {
            return Err(ApiError::Remote {
                code: self.code,
                message: self.failure_message(),
            });
        }
        Ok(serde_json::from_value(self.result)?)
    }
}
