use crate::models::ProviderKind;

/**
 * \brief Provider 类型描述：线协议约定与默认值，运行期只读。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderType {
    pub kind: ProviderKind,
    pub display_name: &'static str,
    pub default_base_url: &'static str,
    pub default_models: &'static [&'static str],
    pub auth_header: &'static str,
    pub auth_prefix: Option<&'static str>,
    pub supports_streaming: bool,
}

impl ProviderType {
    pub fn id(&self) -> &'static str {
        self.kind.as_str()
    }

    /**
     * \brief 首个默认模型，作为新别名的收藏模型。
     */
    pub fn first_default_model(&self) -> &'static str {
        self.default_models.first().copied().unwrap_or_default()
    }

    /**
     * \brief 拼接认证头的值（带可选前缀）。
     */
    pub fn auth_value(&self, api_key: &str) -> String {
        match self.auth_prefix {
            Some(prefix) => format!("{}{}", prefix, api_key),
            None => api_key.to_string(),
        }
    }
}

static PROVIDER_TYPES: [ProviderType; 4] = [
    ProviderType {
        kind: ProviderKind::OpenAI,
        display_name: "OpenAI Compatible",
        default_base_url: "https://api.openai.com/v1",
        default_models: &["gpt-4o", "gpt-4o-mini", "gpt-4-turbo", "gpt-3.5-turbo"],
        auth_header: "Authorization",
        auth_prefix: Some("Bearer "),
        supports_streaming: true,
    },
    ProviderType {
        kind: ProviderKind::Anthropic,
        display_name: "Anthropic Claude",
        default_base_url: "https://api.anthropic.com/v1",
        default_models: &[
            "claude-3-5-sonnet-20241022",
            "claude-3-5-haiku-20241022",
            "claude-3-opus-20240229",
        ],
        auth_header: "Authorization",
        auth_prefix: Some("Bearer "),
        supports_streaming: true,
    },
    // Gemini has no SSE; streaming goes through JSON-object scanning.
    ProviderType {
        kind: ProviderKind::Gemini,
        display_name: "Google Gemini",
        default_base_url: "https://generativelanguage.googleapis.com/v1beta/models",
        default_models: &["gemini-2.0-flash-exp", "gemini-1.5-flash", "gemini-1.5-pro"],
        auth_header: "x-goog-api-key",
        auth_prefix: None,
        supports_streaming: true,
    },
    ProviderType {
        kind: ProviderKind::Ollama,
        display_name: "Ollama Local",
        default_base_url: "http://localhost:11434/v1",
        default_models: &["llama3.2", "mistral", "codellama"],
        auth_header: "Authorization",
        auth_prefix: Some("Bearer "),
        supports_streaming: true,
    },
];

/**
 * \brief 列出全部 Provider 类型。
 */
pub fn list_types() -> &'static [ProviderType] {
    &PROVIDER_TYPES
}

/**
 * \brief 按 id 查找 Provider 类型，未知 id 返回 None。
 */
pub fn get_type(id: &str) -> Option<&'static ProviderType> {
    PROVIDER_TYPES.iter().find(|t| t.id() == id)
}

pub fn type_for(kind: ProviderKind) -> &'static ProviderType {
    match kind {
        ProviderKind::OpenAI => &PROVIDER_TYPES[0],
        ProviderKind::Anthropic => &PROVIDER_TYPES[1],
        ProviderKind::Gemini => &PROVIDER_TYPES[2],
        ProviderKind::Ollama => &PROVIDER_TYPES[3],
    }
}
