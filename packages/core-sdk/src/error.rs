use thiserror::Error;

/**
 * \brief 错误分类，用于调用方区分配置、网络与协议问题。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Network,
    Protocol,
    Parse,
    Cancelled,
}

/**
 * \brief 生成与探测过程中的错误。
 */
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Unknown provider type: {0}")]
    UnknownProviderType(String),

    #[error("Unknown provider alias: {0}")]
    AliasNotFound(String),

    #[error("No API key configured for alias: {0}")]
    MissingApiKey(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Failed to encode image: {0}")]
    ImageEncoding(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout")]
    Timeout,

    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("No content in response")]
    EmptyResponse,

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    #[error("Failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Request cancelled")]
    Cancelled,
}

impl LlmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LlmError::UnknownProviderType(_)
            | LlmError::AliasNotFound(_)
            | LlmError::MissingApiKey(_)
            | LlmError::Unsupported(_)
            | LlmError::ImageEncoding(_)
            | LlmError::InvalidRequest(_) => ErrorKind::Configuration,
            LlmError::Network(_) | LlmError::Timeout => ErrorKind::Network,
            LlmError::Api { .. } | LlmError::EmptyResponse | LlmError::InvalidResponse(_) => {
                ErrorKind::Protocol
            }
            LlmError::Parse(_) => ErrorKind::Parse,
            LlmError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Network(err.to_string())
        }
    }
}
