use std::error::Error as _;

use thiserror::Error;

/// Why a transfer failed. Cancellation is never an error.
///
/// Cloneable so the same value can be handed to every `error` handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DownloadError {
    #[error("下載失敗: HTTP {status} ({url})")]
    HttpStatus { status: u16, url: String },
    #[error("response for {0} has no body")]
    MissingBody(String),
    #[error("下載請求失敗: {0}")]
    Transport(String),
    #[error("創建 HTTP 客戶端失敗: {0}")]
    Client(String),
    #[error("download {0} is already active")]
    AlreadyActive(String),
}

impl DownloadError {
    pub(crate) fn transport(err: reqwest::Error) -> Self {
        // Keep the whole source chain; reqwest's top-level message alone is
        // usually just "error sending request".
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::Transport(message)
    }
}
