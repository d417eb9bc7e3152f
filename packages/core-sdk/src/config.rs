use std::time::Duration;

use tracing::warn;

const THINKING_INSTRUCTION: &str = "Think through the problem step by step. Write out your \
reasoning before giving the final answer, and keep the reasoning visible in the reply.";

/**
 * \brief addAlias 遇到已存在 id 时的处理策略。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /** \brief 覆盖已有别名（历史行为） */
    #[default]
    Upsert,
    /** \brief 拒绝重复 id */
    Reject,
}

/**
 * \brief 引擎级配置。
 */
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub temperature: f64,
    pub max_tokens: u32,
    /** \brief 别名未设置超时时的探测超时 */
    pub probe_timeout: Duration,
    /** \brief 别名未设置超时时的生成超时 */
    pub generation_timeout: Duration,
    /** \brief 生成超时 = 别名超时 × 该系数 */
    pub generation_timeout_factor: u32,
    pub duplicate_policy: DuplicatePolicy,
    /** \brief 探测成功后是否在后台刷新模型列表 */
    pub auto_refresh_models: bool,
    pub thinking_instruction: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
            probe_timeout: Duration::from_secs(10),
            generation_timeout: Duration::from_secs(30),
            generation_timeout_factor: 3,
            duplicate_policy: DuplicatePolicy::Upsert,
            auto_refresh_models: true,
            thinking_instruction: THINKING_INSTRUCTION.to_string(),
        }
    }
}

impl EngineConfig {
    /**
     * \brief 以环境变量覆盖默认配置。
     */
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * \brief 以任意键值来源覆盖默认配置，解析失败的值保持默认。
     */
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("SAILOR_TEMPERATURE") {
            match raw.trim().parse::<f64>() {
                Ok(v) => config.temperature = v,
                Err(_) => warn!("ignoring invalid SAILOR_TEMPERATURE: {}", raw),
            }
        }
        if let Some(raw) = lookup("SAILOR_MAX_TOKENS") {
            match raw.trim().parse::<u32>() {
                Ok(v) => config.max_tokens = v,
                Err(_) => warn!("ignoring invalid SAILOR_MAX_TOKENS: {}", raw),
            }
        }
        if let Some(raw) = lookup("SAILOR_DUPLICATE_ALIASES") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "reject" => config.duplicate_policy = DuplicatePolicy::Reject,
                "upsert" => config.duplicate_policy = DuplicatePolicy::Upsert,
                _ => warn!("ignoring invalid SAILOR_DUPLICATE_ALIASES: {}", raw),
            }
        }
        if let Some(raw) = lookup("SAILOR_AUTO_REFRESH_MODELS") {
            match parse_flag(&raw) {
                Some(v) => config.auto_refresh_models = v,
                None => warn!("ignoring invalid SAILOR_AUTO_REFRESH_MODELS: {}", raw),
            }
        }

        config
    }

    /**
     * \brief 探测超时：别名超时，未设置时取默认值。
     */
    pub fn probe_timeout_for(&self, alias_timeout_ms: u64) -> Duration {
        if alias_timeout_ms == 0 {
            self.probe_timeout
        } else {
            Duration::from_millis(alias_timeout_ms)
        }
    }

    /**
     * \brief 生成超时：别名超时 × 系数，未设置时取默认值。
     */
    pub fn generation_timeout_for(&self, alias_timeout_ms: u64) -> Duration {
        if alias_timeout_ms == 0 {
            self.generation_timeout
        } else {
            Duration::from_millis(alias_timeout_ms) * self.generation_timeout_factor
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
