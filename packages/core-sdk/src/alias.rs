use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, error, info, trace};

use crate::config::DuplicatePolicy;
use crate::models::{AliasConfig, AliasRuntimeState, AliasUpdate, Availability, ProviderAlias};
use crate::registry;

/**
 * \brief 别名存储：别名配置与其运行期状态同生同灭。
 * \details 生命周期为 构造 → 载入 → 修改 → 序列化 → 丢弃；每个实例相互独立。
 */
#[derive(Debug, Default)]
pub struct AliasStore {
    aliases: BTreeMap<String, ProviderAlias>,
    runtime: HashMap<String, AliasRuntimeState>,
    policy: DuplicatePolicy,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl AliasStore {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            aliases: BTreeMap::new(),
            runtime: HashMap::new(),
            policy,
        }
    }

    /**
     * \brief 新增别名；类型未知时返回 false。缺省字段取 Provider 类型默认值。
     */
    pub fn add_alias(&mut self, id: &str, provider_type: &str, config: AliasConfig) -> bool {
        let Some(type_info) = registry::get_type(provider_type) else {
            error!("Invalid provider type: {}", provider_type);
            return false;
        };
        if self.aliases.contains_key(id) && self.policy == DuplicatePolicy::Reject {
            error!("Provider alias already exists: {}", id);
            return false;
        }

        let alias = ProviderAlias {
            display_name: non_empty(config.display_name).unwrap_or_else(|| id.to_string()),
            provider_type: type_info.kind,
            base_url: non_empty(config.base_url)
                .unwrap_or_else(|| type_info.default_base_url.to_string()),
            api_key: config.api_key.unwrap_or_default(),
            port: non_empty(config.port),
            description: config.description.unwrap_or_default(),
            timeout_ms: config.timeout_ms.filter(|t| *t > 0).unwrap_or(10_000),
            favorite_model: non_empty(config.favorite_model)
                .unwrap_or_else(|| type_info.first_default_model().to_string()),
            enable_thinking: config.enable_thinking,
            is_default: false,
        };

        debug!(
            "Added provider alias: {} ({}) with favorite model: {}",
            id, alias.display_name, alias.favorite_model
        );
        self.aliases.insert(id.to_string(), alias);
        self.runtime.insert(id.to_string(), AliasRuntimeState::default());
        true
    }

    /**
     * \brief 删除别名及其运行期状态；默认别名不可删除。
     */
    pub fn remove_alias(&mut self, id: &str) -> bool {
        match self.aliases.get(id) {
            Some(alias) if !alias.is_default => {
                self.aliases.remove(id);
                self.runtime.remove(id);
                debug!("Removed provider alias: {}", id);
                true
            }
            _ => false,
        }
    }

    /**
     * \brief 更新别名。默认别名只接受凭据、收藏模型与思考模式的修改。
     */
    pub fn update_alias(&mut self, id: &str, update: AliasUpdate) -> bool {
        let Some(alias) = self.aliases.get_mut(id) else {
            error!("Alias not found for update: {}", id);
            return false;
        };

        if !alias.is_default {
            if let Some(name) = non_empty(update.display_name) {
                alias.display_name = name;
            }
            if let Some(url) = non_empty(update.base_url) {
                alias.base_url = url;
            }
            if let Some(description) = non_empty(update.description) {
                alias.description = description;
            }
            if let Some(timeout) = update.timeout_ms.filter(|t| *t > 0) {
                alias.timeout_ms = timeout;
            }
        }

        if let Some(key) = non_empty(update.api_key) {
            alias.api_key = key;
        }
        if let Some(model) = non_empty(update.favorite_model) {
            alias.favorite_model = model;
        }
        if let Some(thinking) = update.enable_thinking {
            alias.enable_thinking = thinking;
        }

        debug!("Updated provider alias: {}", id);
        true
    }

    pub fn set_favorite_model(&mut self, id: &str, model: &str) -> bool {
        match self.aliases.get_mut(id) {
            Some(alias) => {
                alias.favorite_model = model.to_string();
                trace!("Set favorite model for {}: {}", id, model);
                true
            }
            None => false,
        }
    }

    /**
     * \brief 收藏模型；别名不存在时返回空字符串。
     */
    pub fn favorite_model(&self, id: &str) -> String {
        self.aliases
            .get(id)
            .map(|a| a.favorite_model.clone())
            .unwrap_or_default()
    }

    pub fn set_thinking_mode(&mut self, id: &str, enabled: bool) -> bool {
        match self.aliases.get_mut(id) {
            Some(alias) => {
                alias.enable_thinking = enabled;
                trace!("Set thinking mode for {}: {}", id, enabled);
                true
            }
            None => false,
        }
    }

    /**
     * \brief 思考模式开关；别名不存在时返回 false。
     */
    pub fn thinking_mode(&self, id: &str) -> bool {
        self.aliases
            .get(id)
            .map(|a| a.enable_thinking)
            .unwrap_or(false)
    }

    /**
     * \brief 标记或取消受保护的默认别名。
     */
    pub fn set_default_flag(&mut self, id: &str, is_default: bool) -> bool {
        match self.aliases.get_mut(id) {
            Some(alias) => {
                alias.is_default = is_default;
                true
            }
            None => false,
        }
    }

    pub fn get_alias(&self, id: &str) -> Option<&ProviderAlias> {
        self.aliases.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.aliases.contains_key(id)
    }

    pub fn alias_ids(&self) -> Vec<String> {
        self.aliases.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /**
     * \brief 可用性状态；未知别名视为 unchecked。
     */
    pub fn availability(&self, id: &str) -> Availability {
        self.runtime
            .get(id)
            .map(|s| s.availability)
            .unwrap_or_default()
    }

    /**
     * \brief 更新可用性；别名已被删除时忽略，保证状态与别名同步。
     */
    pub fn set_availability(&mut self, id: &str, availability: Availability) {
        if let Some(state) = self.runtime.get_mut(id) {
            state.availability = availability;
        }
    }

    pub fn models(&self, id: &str) -> Vec<String> {
        self.runtime
            .get(id)
            .map(|s| s.cached_models.clone())
            .unwrap_or_default()
    }

    /**
     * \brief 整体替换模型缓存（不做增量合并）。
     */
    pub fn set_models(&mut self, id: &str, models: Vec<String>) {
        if let Some(state) = self.runtime.get_mut(id) {
            state.cached_models = models;
        }
    }

    pub fn runtime_state(&self, id: &str) -> Option<&AliasRuntimeState> {
        self.runtime.get(id)
    }

    /**
     * \brief 导出全部别名配置为 JSON（运行期状态不导出）。
     */
    pub fn serialize(&self) -> Result<String> {
        serde_json::to_string(&self.aliases).context("serialize provider aliases failed")
    }

    /**
     * \brief 从 JSON 整体替换别名映射，并重置所有运行期状态。
     * \details 单条记录类型未知或字段非法时跳过该条。返回载入的别名数量。
     */
    pub fn deserialize(&mut self, json: &str) -> Result<usize> {
        let raw: BTreeMap<String, Value> =
            serde_json::from_str(json).context("parse provider aliases failed")?;

        let mut aliases = BTreeMap::new();
        for (id, value) in raw {
            match serde_json::from_value::<ProviderAlias>(value) {
                Ok(mut alias) => {
                    if alias.display_name.is_empty() {
                        alias.display_name = id.clone();
                    }
                    if alias.base_url.is_empty() {
                        alias.base_url = registry::type_for(alias.provider_type)
                            .default_base_url
                            .to_string();
                    }
                    aliases.insert(id, alias);
                }
                Err(err) => error!("Skipping invalid provider alias {}: {}", id, err),
            }
        }

        self.runtime = aliases
            .keys()
            .map(|id| (id.clone(), AliasRuntimeState::default()))
            .collect();
        self.aliases = aliases;
        info!("Loaded {} provider aliases", self.aliases.len());
        Ok(self.aliases.len())
    }
}
