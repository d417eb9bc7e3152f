/*!
 * \brief 各 Provider 响应体的类型化解析；不符合形状的数据以 `LlmError` 值返回。
 */

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::trace;

use crate::error::LlmError;
use crate::models::ProviderKind;

/**
 * \brief 各 Provider 共用的 `{"error": {...}}` 结构；Ollama 直接返回字符串。
 */
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorField {
    Detailed {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        code: Option<Value>,
    },
    Plain(String),
}

impl ErrorField {
    fn message(&self) -> Option<&str> {
        match self {
            ErrorField::Detailed { message, .. } => message.as_deref(),
            ErrorField::Plain(text) => Some(text.as_str()),
        }
    }

    /** \brief 响应体内携带的错误：数字 code 视为 HTTP 状态码。 */
    fn into_error(self) -> LlmError {
        let status = match &self {
            ErrorField::Detailed { code, .. } => code
                .as_ref()
                .and_then(Value::as_u64)
                .and_then(|c| u16::try_from(c).ok()),
            ErrorField::Plain(_) => None,
        };
        let message = self
            .message()
            .filter(|m| !m.is_empty())
            .unwrap_or("Provider reported an error")
            .to_string();
        match status {
            Some(status) => LlmError::Api { status, message },
            None => LlmError::InvalidResponse(message),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<ErrorField>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorEnvelope {
    Single(ErrorBody),
    Batch(Vec<ErrorBody>),
}

// ---------------------------------------------------------------- Gemini

#[derive(Debug, Default, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    error: Option<ErrorField>,
}

impl GeminiResponse {
    fn first_text(self) -> Result<Option<String>, LlmError> {
        if let Some(err) = self.error {
            return Err(err.into_error());
        }
        Ok(self
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().next())
            .and_then(|p| p.text))
    }
}

/** \brief Gemini 完整响应可能被包在单元素数组里。 */
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiEnvelope {
    Single(GeminiResponse),
    Batch(Vec<GeminiResponse>),
}

impl GeminiEnvelope {
    fn into_first(self) -> Option<GeminiResponse> {
        match self {
            GeminiEnvelope::Single(r) => Some(r),
            GeminiEnvelope::Batch(list) => list.into_iter().next(),
        }
    }
}

// ---------------------------------------------------------------- OpenAI

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    message: Option<OpenAiMessage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    error: Option<ErrorField>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChunkChoice {
    #[serde(default)]
    delta: Option<OpenAiDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChunk {
    #[serde(default)]
    choices: Vec<OpenAiChunkChoice>,
    #[serde(default)]
    error: Option<ErrorField>,
}

// ---------------------------------------------------------------- Anthropic

#[derive(Debug, Deserialize)]
struct AnthropicTextDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    ContentBlockDelta { delta: AnthropicTextDelta },
    Error { error: ErrorField },
    #[serde(other)]
    Other,
}

// ---------------------------------------------------------------- models

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiModelEntry {
    Name(String),
    Object {
        #[serde(default)]
        name: Option<String>,
    },
}

/**
 * \brief 解析非流式完整响应，返回正文。正文为空或缺失时返回 `EmptyResponse`。
 */
pub fn parse_complete(kind: ProviderKind, body: &str) -> Result<String, LlmError> {
    let text = match kind {
        ProviderKind::Gemini => parse_gemini_complete(body)?,
        _ => {
            let resp: OpenAiResponse = serde_json::from_str(body)?;
            if let Some(err) = resp.error {
                return Err(err.into_error());
            }
            resp.choices
                .into_iter()
                .next()
                .and_then(|c| c.message)
                .and_then(|m| m.content)
        }
    };
    match text {
        Some(text) if !text.is_empty() => Ok(text),
        _ => Err(LlmError::EmptyResponse),
    }
}

fn parse_gemini_complete(body: &str) -> Result<Option<String>, LlmError> {
    let envelope: GeminiEnvelope = serde_json::from_str(body)?;
    match envelope.into_first() {
        Some(resp) => resp.first_text(),
        None => Ok(None),
    }
}

/**
 * \brief 解析一条 SSE 负载中的增量文本。
 * \details Anthropic 先按事件类型解析，不匹配时回退为 OpenAI chunk 结构。
 *          `Ok(None)` 表示该事件不含文本；`Err(Parse)` 表示负载本身非法。
 */
pub fn parse_sse_payload(kind: ProviderKind, payload: &str) -> Result<Option<String>, LlmError> {
    if kind == ProviderKind::Anthropic {
        if let Ok(event) = serde_json::from_str::<AnthropicEvent>(payload) {
            match event {
                AnthropicEvent::ContentBlockDelta { delta } => return Ok(delta.text),
                AnthropicEvent::Error { error } => return Err(error.into_error()),
                AnthropicEvent::Other => {
                    trace!("Ignoring non-text Anthropic event");
                    return Ok(None);
                }
            }
        }
    }

    let chunk: OpenAiChunk = serde_json::from_str(payload)?;
    if let Some(err) = chunk.error {
        return Err(err.into_error());
    }
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .filter(|t| !t.is_empty()))
}

/**
 * \brief 解析 Gemini 伪流式中的一个完整 JSON 对象。
 */
pub fn parse_gemini_chunk(object: &str) -> Result<Option<String>, LlmError> {
    let resp: GeminiResponse = serde_json::from_str(object)?;
    Ok(resp.first_text()?.filter(|t| !t.is_empty()))
}

/**
 * \brief 非 2xx 响应的错误信息：优先取 `error.message`；
 *        JSON 但无错误字段时为 `HTTP <status>`；非 JSON 时附带状态原因。
 */
pub fn extract_error_message(status: u16, body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => {
            let first = match envelope {
                ErrorEnvelope::Single(b) => b.error,
                ErrorEnvelope::Batch(list) => list.into_iter().find_map(|b| b.error),
            };
            first
                .as_ref()
                .and_then(ErrorField::message)
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", status))
        }
        Err(_) => {
            let reason = StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("");
            format!("HTTP {}: {}", status, reason)
        }
    }
}

/**
 * \brief 解析模型列表。非法或空条目被跳过；整体结构不符时返回错误。
 */
pub fn parse_model_list(kind: ProviderKind, value: &Value) -> Result<Vec<String>, LlmError> {
    match kind {
        ProviderKind::Gemini => {
            let entries = value
                .get("models")
                .and_then(Value::as_array)
                .ok_or_else(|| LlmError::InvalidResponse("missing `models` array".into()))?;
            Ok(entries
                .iter()
                .filter_map(|entry| {
                    let name = match serde_json::from_value::<GeminiModelEntry>(entry.clone()) {
                        Ok(GeminiModelEntry::Name(name)) => name,
                        Ok(GeminiModelEntry::Object { name: Some(name) }) => name,
                        _ => {
                            trace!("Skipping invalid model entry: {}", entry);
                            return None;
                        }
                    };
                    let id = name.strip_prefix("models/").unwrap_or(&name).to_string();
                    (!id.is_empty()).then_some(id)
                })
                .collect())
        }
        _ => {
            let entries = value
                .get("data")
                .and_then(Value::as_array)
                .ok_or_else(|| LlmError::InvalidResponse("missing `data` array".into()))?;
            Ok(entries
                .iter()
                .filter_map(|entry| entry.get("id").and_then(Value::as_str))
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect())
        }
    }
}
