use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};
use tracing::trace;

use crate::config::EngineConfig;
use crate::error::LlmError;
use crate::models::{ConversationMessage, EncodedImage, MessageRole, ProviderAlias, ProviderKind};
use crate::registry;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/**
 * \brief 响应的传输形态，决定使用哪种规整器。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /** \brief 一次性完整 JSON */
    Complete,
    /** \brief Server-Sent-Events（OpenAI / Anthropic） */
    Sse,
    /** \brief 连续的 JSON 对象（Gemini 伪流式） */
    JsonObjects,
}

/**
 * \brief 构造请求所需的输入。
 */
#[derive(Debug, Clone, Copy)]
pub struct RequestInput<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub history: &'a [ConversationMessage],
    pub images: &'a [EncodedImage],
    /** \brief 实际使用的 API Key（可能来自调用方覆盖） */
    pub api_key: &'a str,
    /** \brief 调用方是否需要增量输出 */
    pub stream: bool,
}

/**
 * \brief 构造完成的请求：URL、头部与 JSON 请求体。
 */
#[derive(Debug, Clone)]
pub struct BuiltRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Value,
    pub transport: Transport,
}

/**
 * \brief 根据别名与输入生成对应 Provider 的请求，不修改任何状态。
 */
pub fn build_request(
    alias: &ProviderAlias,
    input: &RequestInput<'_>,
    config: &EngineConfig,
) -> Result<BuiltRequest, LlmError> {
    let kind = alias.provider_type;
    if !input.images.is_empty() && !kind.supports_images() {
        return Err(LlmError::Unsupported(format!(
            "image attachments are not supported for provider type {}",
            kind
        )));
    }

    let type_info = registry::type_for(kind);
    let streaming = input.stream && type_info.supports_streaming && input.images.is_empty();

    match kind {
        ProviderKind::Gemini => build_gemini(alias, input, config, streaming),
        ProviderKind::OpenAI | ProviderKind::Anthropic | ProviderKind::Ollama => {
            build_chat_completions(alias, input, config, streaming)
        }
    }
}

fn build_gemini(
    alias: &ProviderAlias,
    input: &RequestInput<'_>,
    config: &EngineConfig,
    streaming: bool,
) -> Result<BuiltRequest, LlmError> {
    let url = gemini_generate_url(&alias.base_url, input.model, streaming);

    let mut contents = gemini_contents(input.history);
    let mut parts: Vec<Value> = input
        .images
        .iter()
        .map(|image| {
            json!({
                "inline_data": {
                    "mime_type": image.mime_type,
                    "data": BASE64.encode(&image.bytes),
                }
            })
        })
        .collect();
    parts.push(json!({ "text": input.prompt }));
    contents.push(json!({ "role": "user", "parts": parts }));

    let mut body = json!({
        "contents": contents,
        "generationConfig": {
            "temperature": config.temperature,
            "maxOutputTokens": config.max_tokens,
        }
    });
    if alias.enable_thinking {
        body["systemInstruction"] = json!({
            "parts": [{ "text": config.thinking_instruction }]
        });
        body["generationConfig"]["candidateCount"] = json!(1);
    }

    let mut headers = auth_headers(ProviderKind::Gemini, input.api_key)?;
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    Ok(BuiltRequest {
        url,
        headers,
        body,
        transport: if streaming {
            Transport::JsonObjects
        } else {
            Transport::Complete
        },
    })
}

fn build_chat_completions(
    alias: &ProviderAlias,
    input: &RequestInput<'_>,
    config: &EngineConfig,
    streaming: bool,
) -> Result<BuiltRequest, LlmError> {
    let url = format!("{}/chat/completions", alias.base_url.trim_end_matches('/'));

    let mut messages = chat_messages(input.history);
    if input.images.is_empty() {
        messages.push(json!({ "role": "user", "content": input.prompt }));
    } else {
        let mut content: Vec<Value> = input
            .images
            .iter()
            .map(|image| {
                json!({
                    "type": "image_url",
                    "image_url": { "url": data_uri(image) }
                })
            })
            .collect();
        content.push(json!({ "type": "text", "text": input.prompt }));
        messages.push(json!({ "role": "user", "content": content }));
    }

    let mut body = json!({
        "model": input.model,
        "messages": messages,
        "temperature": config.temperature,
        "max_tokens": config.max_tokens,
    });
    if streaming {
        body["stream"] = json!(true);
    }

    let mut headers = auth_headers(alias.provider_type, input.api_key)?;
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if alias.provider_type == ProviderKind::Anthropic {
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
    }

    Ok(BuiltRequest {
        url,
        headers,
        body,
        transport: if streaming {
            Transport::Sse
        } else {
            Transport::Complete
        },
    })
}

/**
 * \brief 按 Provider 类型生成认证头；Key 为空时不设置。
 */
pub fn auth_headers(kind: ProviderKind, api_key: &str) -> Result<HeaderMap, LlmError> {
    let mut headers = HeaderMap::new();
    if api_key.is_empty() {
        return Ok(headers);
    }
    let type_info = registry::type_for(kind);
    let name = HeaderName::from_static(auth_header_name(type_info.auth_header));
    let value = HeaderValue::from_str(&type_info.auth_value(api_key))
        .map_err(|e| LlmError::InvalidRequest(format!("invalid API key header: {}", e)))?;
    headers.insert(name, value);
    Ok(headers)
}

// HeaderName::from_static requires lowercase names.
fn auth_header_name(header: &'static str) -> &'static str {
    match header {
        "Authorization" => "authorization",
        other => other,
    }
}

/**
 * \brief 模型列表地址：Gemini 的基地址本身就是列表端点，其余追加 /models。
 */
pub fn models_url(alias: &ProviderAlias) -> String {
    match alias.provider_type {
        ProviderKind::Gemini => alias.base_url.clone(),
        _ => format!("{}/models", alias.base_url.trim_end_matches('/')),
    }
}

/**
 * \brief 去掉 Gemini 模型 id 的 `models/` 前缀。
 */
pub fn gemini_model_id(model: &str) -> &str {
    model.strip_prefix("models/").unwrap_or(model)
}

pub fn gemini_generate_url(base_url: &str, model: &str, streaming: bool) -> String {
    let method = if streaming {
        "streamGenerateContent"
    } else {
        "generateContent"
    };
    format!(
        "{}/{}:{}",
        base_url.trim_end_matches('/'),
        gemini_model_id(model),
        method
    )
}

/**
 * \brief 历史消息转为 Gemini 轮次（bot → model）。
 */
pub fn gemini_contents(history: &[ConversationMessage]) -> Vec<Value> {
    history
        .iter()
        .filter_map(|msg| {
            let role = match msg.role {
                MessageRole::User => "user",
                MessageRole::Bot => "model",
                other => {
                    trace!("Skipping message with unsupported role: {}", other);
                    return None;
                }
            };
            Some(json!({ "role": role, "parts": [{ "text": msg.text }] }))
        })
        .collect()
}

/**
 * \brief 历史消息转为 chat/completions 消息，并合并连续的同角色消息。
 * \details 每段连续同角色消息只保留一条，位于该段首位置，内容取该段最新一条。
 */
pub fn chat_messages(history: &[ConversationMessage]) -> Vec<Value> {
    let mut collapsed: Vec<(&'static str, &str)> = Vec::new();
    for msg in history {
        let role = match msg.role {
            MessageRole::User => "user",
            MessageRole::Bot => "assistant",
            other => {
                trace!("Skipping message with unsupported role: {}", other);
                continue;
            }
        };
        match collapsed.last_mut() {
            Some(last) if last.0 == role => {
                trace!("Collapsing duplicate role: {}", role);
                last.1 = msg.text.as_str();
            }
            _ => collapsed.push((role, msg.text.as_str())),
        }
    }
    collapsed
        .into_iter()
        .map(|(role, text)| json!({ "role": role, "content": text }))
        .collect()
}

fn data_uri(image: &EncodedImage) -> String {
    format!("data:{};base64,{}", image.mime_type, BASE64.encode(&image.bytes))
}
