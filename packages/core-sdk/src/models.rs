use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/**
 * \brief Provider 协议族，对应注册表中的四种固定类型。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
    Gemini,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Ollama => "ollama",
        }
    }

    /**
     * \brief 是否允许在没有 API Key 的情况下发起请求（本地 Ollama）。
     */
    pub fn requires_api_key(self) -> bool {
        !matches!(self, ProviderKind::Ollama)
    }

    /**
     * \brief 是否支持图片 + 文本的多模态请求。
     */
    pub fn supports_images(self) -> bool {
        matches!(self, ProviderKind::OpenAI | ProviderKind::Gemini)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(ProviderKind::OpenAI),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "gemini" => Ok(ProviderKind::Gemini),
            "ollama" => Ok(ProviderKind::Ollama),
            other => Err(other.to_string()),
        }
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

/**
 * \brief 用户定义的 Provider 别名配置。
 * \details 序列化字段名与历史配置 JSON 保持一致，便于直接载入旧数据。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAlias {
    /** \brief 显示名称；旧配置可能缺失，载入时以别名 id 补齐 */
    #[serde(rename = "name", default)]
    pub display_name: String,
    /** \brief Provider 类型 */
    #[serde(rename = "type")]
    pub provider_type: ProviderKind,
    /** \brief API 基地址；缺失时载入为类型默认地址 */
    #[serde(rename = "url", default)]
    pub base_url: String,
    /** \brief API Key（明文，与配置一同保存） */
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default)]
    pub description: String,
    /** \brief 探测超时（毫秒），生成请求使用其三倍 */
    #[serde(rename = "timeout", default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(rename = "favoriteModel", default)]
    pub favorite_model: String,
    #[serde(rename = "enableThinking", default)]
    pub enable_thinking: bool,
    /** \brief 默认别名受保护：不可删除，身份字段不可修改 */
    #[serde(rename = "isDefault", default)]
    pub is_default: bool,
}

/**
 * \brief 新建别名时的可选字段，缺省值取自 Provider 类型。
 */
#[derive(Debug, Clone, Default)]
pub struct AliasConfig {
    pub display_name: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub port: Option<String>,
    pub description: Option<String>,
    pub timeout_ms: Option<u64>,
    pub favorite_model: Option<String>,
    pub enable_thinking: bool,
}

/**
 * \brief 别名更新字段；None 或空字符串表示保持原值。
 */
#[derive(Debug, Clone, Default)]
pub struct AliasUpdate {
    pub display_name: Option<String>,
    pub base_url: Option<String>,
    pub description: Option<String>,
    pub timeout_ms: Option<u64>,
    pub api_key: Option<String>,
    pub favorite_model: Option<String>,
    pub enable_thinking: Option<bool>,
}

/**
 * \brief 别名可用性状态（仅运行期，不持久化）。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    #[default]
    Unchecked,
    Checking,
    Available,
    NoKey,
    Timeout,
    Error,
}

impl Availability {
    pub fn as_str(self) -> &'static str {
        match self {
            Availability::Unchecked => "unchecked",
            Availability::Checking => "checking",
            Availability::Available => "available",
            Availability::NoKey => "no_key",
            Availability::Timeout => "timeout",
            Availability::Error => "error",
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/**
 * \brief 与别名一一对应的运行期状态。
 */
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AliasRuntimeState {
    pub availability: Availability,
    pub cached_models: Vec<String>,
}

/**
 * \brief 消息角色，与本地消息表中的取值一致。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Bot,
    Error,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Bot => "bot",
            MessageRole::Error => "error",
            MessageRole::System => "system",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "bot" => Ok(MessageRole::Bot),
            "error" => Ok(MessageRole::Error),
            "system" => Ok(MessageRole::System),
            other => Err(other.to_string()),
        }
    }
}

/**
 * \brief 作为生成输入的历史消息（只读）。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub text: String,
}

impl ConversationMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            text: text.into(),
        }
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Bot,
            text: text.into(),
        }
    }
}

/**
 * \brief 外部图片编码器的输出：原始字节与 MIME 类型。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/**
 * \brief 图片编码协作方。引用的含义（路径、URL 等）由宿主应用决定。
 */
pub trait ImageEncoder: Send + Sync {
    fn encode(&self, image_ref: &str) -> anyhow::Result<EncodedImage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_deserializes_legacy_blob_fields() {
        let json = r#"{
            "name": "Work",
            "type": "openai",
            "url": "https://api.example.com/v1",
            "api_key": "sk-1",
            "port": "",
            "description": "",
            "timeout": 5000,
            "favoriteModel": "gpt-4o",
            "isDefault": false
        }"#;
        let alias: ProviderAlias = serde_json::from_str(json).unwrap();
        assert_eq!(alias.display_name, "Work");
        assert_eq!(alias.provider_type, ProviderKind::OpenAI);
        assert_eq!(alias.timeout_ms, 5000);
        assert!(!alias.enable_thinking);
    }

    #[test]
    fn test_alias_defaults_missing_optional_fields() {
        let json = r#"{"name": "Legacy", "type": "gemini", "url": "https://x"}"#;
        let alias: ProviderAlias = serde_json::from_str(json).unwrap();
        assert_eq!(alias.timeout_ms, 10_000);
        assert!(alias.api_key.is_empty());
        assert!(!alias.is_default);
    }

    #[test]
    fn test_provider_kind_round_trips_through_str() {
        for kind in [
            ProviderKind::OpenAI,
            ProviderKind::Anthropic,
            ProviderKind::Gemini,
            ProviderKind::Ollama,
        ] {
            assert_eq!(kind.as_str().parse::<ProviderKind>(), Ok(kind));
        }
        assert!("mistral".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_availability_strings() {
        assert_eq!(Availability::NoKey.as_str(), "no_key");
        assert_eq!(
            serde_json::to_string(&Availability::Timeout).unwrap(),
            "\"timeout\""
        );
        assert_eq!(Availability::default(), Availability::Unchecked);
    }
}
