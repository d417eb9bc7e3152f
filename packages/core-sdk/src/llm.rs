use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::{stream, try_stream};
use futures_util::future::join_all;
use futures_util::{Stream, StreamExt};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::alias::AliasStore;
use crate::config::EngineConfig;
use crate::error::LlmError;
use crate::models::{
    Availability, ConversationMessage, EncodedImage, ImageEncoder, ProviderAlias, ProviderKind,
};
use crate::registry;
use crate::request::{auth_headers, build_request, models_url, BuiltRequest, RequestInput, Transport};
use crate::response::{
    extract_error_message, parse_complete, parse_gemini_chunk, parse_model_list, parse_sse_payload,
};
use crate::stream::{JsonObjectScanner, SseData, SseDecoder};

/** \brief 旧版配置临时别名的基础超时（毫秒） */
const LEGACY_TIMEOUT_MS: u64 = 30_000;

pub type GenerationStream = Pin<Box<dyn Stream<Item = GenerationEvent> + Send>>;

/**
 * \brief 一次生成调用的输入，仅在一次 HTTP 交互期间存在。
 */
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub alias_id: String,
    /** \brief 为空时依次取别名的常用模型、类型的首个默认模型 */
    pub model: Option<String>,
    pub prompt: String,
    pub history: Vec<ConversationMessage>,
    /** \brief 交给 ImageEncoder 的图片引用 */
    pub images: Vec<String>,
    /** \brief 调用方需要增量输出 */
    pub streaming: bool,
    /** \brief 别名未保存 Key 时使用 */
    pub api_key: Option<String>,
    pub cancel: Option<CancellationToken>,
}

impl GenerationRequest {
    pub fn new(alias_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            alias_id: alias_id.into(),
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_history(mut self, history: Vec<ConversationMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn streaming(mut self, enabled: bool) -> Self {
        self.streaming = enabled;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/**
 * \brief 生成结果事件。`Done` 或 `Failed` 总是最后一个事件。
 * \details 流式路径以若干 `Delta` 加 `Done("")` 结束；非流式路径只有一个携带全文的 `Done`。
 */
#[derive(Debug)]
pub enum GenerationEvent {
    Delta(String),
    Done(String),
    Failed(LlmError),
}

/**
 * \brief 回调式消费生成结果。
 */
pub trait GenerationSink: Send {
    fn on_delta(&mut self, _text: &str) {}
    fn on_complete(&mut self, text: &str);
    fn on_error(&mut self, error: &LlmError);
}

/**
 * \brief 别名不存在时的外部配置来源（按 Provider 类型 id 查询）。
 */
pub trait LegacyConfigSource: Send + Sync {
    fn legacy_config(&self, provider_type: &str) -> Option<LegacyProviderConfig>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyProviderConfig {
    pub base_url: String,
    pub api_key: String,
}

impl LegacyConfigSource for HashMap<String, LegacyProviderConfig> {
    fn legacy_config(&self, provider_type: &str) -> Option<LegacyProviderConfig> {
        self.get(provider_type).cloned()
    }
}

/**
 * \brief 可用性探测结果。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub available: bool,
    pub availability: Availability,
    pub message: String,
}

impl ProbeOutcome {
    fn available() -> Self {
        Self {
            available: true,
            availability: Availability::Available,
            message: "Available".to_string(),
        }
    }

    fn failed(availability: Availability, message: impl Into<String>) -> Self {
        Self {
            available: false,
            availability,
            message: message.into(),
        }
    }
}

/**
 * \brief 探测 HTTP 状态分类：认证失败同样说明服务可达，0 表示没有响应。
 */
pub fn classify_status(status: u16) -> Availability {
    match status {
        200 | 401 | 403 => Availability::Available,
        0 => Availability::Timeout,
        _ => Availability::Error,
    }
}

/**
 * \brief 探测进行期间持有。探测 future 在完成前被丢弃时，把 checking 状态恢复为探测前的值。
 */
struct CheckingGuard<'a> {
    store: &'a RwLock<AliasStore>,
    alias_id: &'a str,
    previous: Availability,
    armed: bool,
}

impl CheckingGuard<'_> {
    fn finish(mut self, availability: Availability) {
        self.store.write().set_availability(self.alias_id, availability);
        self.armed = false;
    }
}

impl Drop for CheckingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut store = self.store.write();
        if store.availability(self.alias_id) == Availability::Checking {
            debug!("Availability check dropped for alias: {}", self.alias_id);
            store.set_availability(self.alias_id, self.previous);
        }
    }
}

struct PreparedCall {
    alias_id: String,
    kind: ProviderKind,
    model: String,
    request: BuiltRequest,
    timeout: Duration,
}

/**
 * \brief 多 Provider 引擎句柄，克隆开销很小，可在任务间共享。
 * \details 别名存储由读写锁保护；锁从不跨越 await 持有。
 */
#[derive(Clone)]
pub struct LlmEngine {
    client: reqwest::Client,
    store: Arc<RwLock<AliasStore>>,
    config: Arc<EngineConfig>,
    legacy: Option<Arc<dyn LegacyConfigSource>>,
    image_encoder: Option<Arc<dyn ImageEncoder>>,
}

impl LlmEngine {
    pub fn new(config: EngineConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: EngineConfig) -> Self {
        let store = AliasStore::new(config.duplicate_policy);
        Self {
            client,
            store: Arc::new(RwLock::new(store)),
            config: Arc::new(config),
            legacy: None,
            image_encoder: None,
        }
    }

    pub fn with_legacy_source(mut self, source: Arc<dyn LegacyConfigSource>) -> Self {
        self.legacy = Some(source);
        self
    }

    pub fn with_image_encoder(mut self, encoder: Arc<dyn ImageEncoder>) -> Self {
        self.image_encoder = Some(encoder);
        self
    }

    pub fn store(&self) -> &Arc<RwLock<AliasStore>> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------ probing

    /**
     * \brief 检查别名可达性并记录状态；成功时在后台刷新模型列表。
     */
    pub async fn check_availability(&self, alias_id: &str) -> ProbeOutcome {
        let (alias, previous) = {
            let mut store = self.store.write();
            let Some(alias) = store.get_alias(alias_id).cloned() else {
                error!("Alias not found: {}", alias_id);
                return ProbeOutcome::failed(Availability::Error, "Alias not found.");
            };
            if store.availability(alias_id) == Availability::Checking {
                debug!("Availability check already running for alias: {}", alias_id);
                return ProbeOutcome::failed(Availability::Checking, "Check already in progress");
            }
            if alias.api_key.is_empty() && alias.provider_type.requires_api_key() {
                info!("No API key for alias: {}", alias_id);
                store.set_availability(alias_id, Availability::NoKey);
                return ProbeOutcome::failed(Availability::NoKey, "No API key configured");
            }
            let previous = store.availability(alias_id);
            store.set_availability(alias_id, Availability::Checking);
            (alias, previous)
        };
        let guard = CheckingGuard {
            store: &self.store,
            alias_id,
            previous,
            armed: true,
        };

        let outcome = self.probe(alias_id, &alias).await;
        guard.finish(outcome.availability);

        if outcome.available && self.config.auto_refresh_models {
            let engine = self.clone();
            let id = alias_id.to_string();
            tokio::spawn(async move {
                if let Err(err) = engine.refresh_models(&id).await {
                    info!("Failed to fetch models for alias {}: {}", id, err);
                }
            });
        }
        outcome
    }

    async fn probe(&self, alias_id: &str, alias: &ProviderAlias) -> ProbeOutcome {
        let headers = match auth_headers(alias.provider_type, &alias.api_key) {
            Ok(headers) => headers,
            Err(err) => {
                error!("Failed to check availability for alias {}: {}", alias_id, err);
                return ProbeOutcome::failed(Availability::Error, err.to_string());
            }
        };
        let url = models_url(alias);
        trace!("Sending availability check to: {}", url);

        let result = self
            .client
            .get(&url)
            .headers(headers)
            .timeout(self.config.probe_timeout_for(alias.timeout_ms))
            .send()
            .await;

        match result {
            Ok(resp) => {
                let status = resp.status().as_u16();
                match classify_status(status) {
                    Availability::Available => {
                        info!("Alias available: {} (status: {})", alias_id, status);
                        ProbeOutcome::available()
                    }
                    other => {
                        info!("Alias unavailable: {} (status: {})", alias_id, status);
                        ProbeOutcome::failed(other, format!("HTTP {}", status))
                    }
                }
            }
            Err(err) if err.is_timeout() => {
                info!("Availability check timeout for alias: {}", alias_id);
                ProbeOutcome::failed(Availability::Timeout, "Timeout")
            }
            Err(err) if err.is_builder() => {
                error!("Failed to check availability for alias {}: {}", alias_id, err);
                ProbeOutcome::failed(Availability::Error, err.to_string())
            }
            Err(err) => {
                info!("Alias timeout/network error: {} ({})", alias_id, err);
                ProbeOutcome::failed(Availability::Timeout, "Network error")
            }
        }
    }

    /**
     * \brief 并发检查全部别名，所有结果到齐后一次性返回。
     */
    pub async fn check_all(&self) -> BTreeMap<String, ProbeOutcome> {
        let ids = self.store.read().alias_ids();
        self.check_aliases(&ids).await
    }

    pub async fn check_aliases(&self, ids: &[String]) -> BTreeMap<String, ProbeOutcome> {
        if ids.is_empty() {
            return BTreeMap::new();
        }
        info!("Checking availability for {} aliases", ids.len());
        let results = join_all(ids.iter().map(|id| async move {
            (id.clone(), self.check_availability(id).await)
        }))
        .await;
        info!("Completed availability check for all aliases");
        results.into_iter().collect()
    }

    /**
     * \brief 拉取模型列表；列表非空时整体替换缓存。没有 Key 的别名直接跳过。
     */
    pub async fn refresh_models(&self, alias_id: &str) -> Result<Vec<String>, LlmError> {
        let alias = self
            .store
            .read()
            .get_alias(alias_id)
            .cloned()
            .ok_or_else(|| LlmError::AliasNotFound(alias_id.to_string()))?;
        if alias.api_key.is_empty() {
            trace!("Skipping model fetch for alias without API key: {}", alias_id);
            return Ok(self.store.read().models(alias_id));
        }

        let url = models_url(&alias);
        info!(
            "Starting model fetch for alias: {} (type: {})",
            alias_id, alias.provider_type
        );
        let resp = self
            .client
            .get(&url)
            .headers(auth_headers(alias.provider_type, &alias.api_key)?)
            .timeout(self.config.probe_timeout_for(alias.timeout_ms))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: extract_error_message(status.as_u16(), &body),
            });
        }

        let value: serde_json::Value = serde_json::from_str(&body)?;
        let models = parse_model_list(alias.provider_type, &value)?;
        if models.is_empty() {
            info!("No models found for alias: {}", alias_id);
        } else {
            info!("Fetched {} models for alias: {}", models.len(), alias_id);
            self.store.write().set_models(alias_id, models.clone());
        }
        Ok(models)
    }

    // ------------------------------------------------------------ generation

    /**
     * \brief 发起生成并以事件流返回结果；所有失败都以 `Failed` 事件结束流。
     */
    pub fn generate(&self, request: GenerationRequest) -> GenerationStream {
        let engine = self.clone();
        Box::pin(stream! {
            let cancel = request.cancel.clone().unwrap_or_default();
            let (kind, transport, resp) = match engine.open(&request, &cancel).await {
                Ok(parts) => parts,
                Err(err) => {
                    error!("Generation failed for alias {}: {}", request.alias_id, err);
                    yield GenerationEvent::Failed(err);
                    return;
                }
            };

            let events = body_events(kind, transport, resp, cancel);
            futures_util::pin_mut!(events);
            while let Some(item) = events.next().await {
                match item {
                    Ok(event) => {
                        yield event;
                    }
                    Err(err) => {
                        error!("Generation failed for alias {}: {}", request.alias_id, err);
                        yield GenerationEvent::Failed(err);
                        return;
                    }
                }
            }
        })
    }

    /**
     * \brief 以回调方式驱动一次生成，完成或失败回调恰好调用一次。
     */
    pub async fn generate_with<S>(&self, request: GenerationRequest, sink: &mut S)
    where
        S: GenerationSink + ?Sized,
    {
        let mut events = self.generate(request);
        while let Some(event) = events.next().await {
            match event {
                GenerationEvent::Delta(text) => sink.on_delta(&text),
                GenerationEvent::Done(text) => sink.on_complete(&text),
                GenerationEvent::Failed(err) => sink.on_error(&err),
            }
        }
    }

    /**
     * \brief 后台执行生成，结束后交还 sink。
     */
    pub fn spawn_generate<S>(&self, request: GenerationRequest, mut sink: S) -> JoinHandle<S>
    where
        S: GenerationSink + 'static,
    {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.generate_with(request, &mut sink).await;
            sink
        })
    }

    /**
     * \brief 收集完整回复文本。
     */
    pub async fn generate_text(&self, request: GenerationRequest) -> Result<String, LlmError> {
        let mut events = self.generate(request);
        let mut text = String::new();
        while let Some(event) = events.next().await {
            match event {
                GenerationEvent::Delta(delta) => text.push_str(&delta),
                GenerationEvent::Done(full) => {
                    text.push_str(&full);
                    return Ok(text);
                }
                GenerationEvent::Failed(err) => return Err(err),
            }
        }
        Err(LlmError::EmptyResponse)
    }

    async fn open(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<(ProviderKind, Transport, reqwest::Response), LlmError> {
        let call = self.prepare(request)?;
        let BuiltRequest {
            url,
            headers,
            body,
            transport,
        } = call.request;

        info!(
            "Generating with alias {} (type: {}, model: {})",
            call.alias_id, call.kind, call.model
        );
        debug!("POST {} ({:?})", url, transport);
        trace!("Request body: {}", body);

        let send = self
            .client
            .post(&url)
            .headers(headers)
            .json(&body)
            .timeout(call.timeout)
            .send();
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            resp = send => resp?,
        };

        let status = resp.status();
        if !status.is_success() {
            let text = read_text(resp, cancel).await.unwrap_or_default();
            error!("Generation HTTP error {} for alias {}", status, call.alias_id);
            trace!("Error body: {}", text);
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: extract_error_message(status.as_u16(), &text),
            });
        }
        Ok((call.kind, transport, resp))
    }

    fn prepare(&self, request: &GenerationRequest) -> Result<PreparedCall, LlmError> {
        let alias = self.resolve_alias(request)?;
        let kind = alias.provider_type;

        let model = request
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .or_else(|| Some(alias.favorite_model.clone()).filter(|m| !m.is_empty()))
            .unwrap_or_else(|| registry::type_for(kind).first_default_model().to_string());

        let api_key = if alias.api_key.is_empty() {
            request.api_key.clone().unwrap_or_default()
        } else {
            alias.api_key.clone()
        };
        if api_key.is_empty() && kind.requires_api_key() {
            return Err(LlmError::MissingApiKey(request.alias_id.clone()));
        }
        debug!("API key length: {}", api_key.len());

        if !request.images.is_empty() && !kind.supports_images() {
            return Err(LlmError::Unsupported(format!(
                "image attachments are not supported for provider type {}",
                kind
            )));
        }
        let images = self.encode_images(&request.images)?;

        let input = RequestInput {
            model: &model,
            prompt: &request.prompt,
            history: &request.history,
            images: &images,
            api_key: &api_key,
            stream: request.streaming,
        };
        let built = build_request(&alias, &input, &self.config)?;

        Ok(PreparedCall {
            alias_id: request.alias_id.clone(),
            kind,
            model,
            request: built,
            timeout: self.config.generation_timeout_for(alias.timeout_ms),
        })
    }

    fn resolve_alias(&self, request: &GenerationRequest) -> Result<ProviderAlias, LlmError> {
        if let Some(alias) = self.store.read().get_alias(&request.alias_id).cloned() {
            return Ok(alias);
        }
        let Some(source) = &self.legacy else {
            return Err(LlmError::AliasNotFound(request.alias_id.clone()));
        };

        let type_info = registry::get_type(&request.alias_id)
            .ok_or_else(|| LlmError::UnknownProviderType(request.alias_id.clone()))?;
        info!("Using legacy configuration for provider: {}", type_info.id());
        let legacy = source.legacy_config(type_info.id()).unwrap_or_default();

        Ok(ProviderAlias {
            display_name: format!("Legacy {}", type_info.id()),
            provider_type: type_info.kind,
            base_url: Some(legacy.base_url)
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| type_info.default_base_url.to_string()),
            api_key: request
                .api_key
                .clone()
                .filter(|k| !k.is_empty())
                .unwrap_or(legacy.api_key),
            port: None,
            description: String::new(),
            timeout_ms: LEGACY_TIMEOUT_MS,
            favorite_model: type_info.first_default_model().to_string(),
            enable_thinking: false,
            is_default: false,
        })
    }

    fn encode_images(&self, refs: &[String]) -> Result<Vec<EncodedImage>, LlmError> {
        if refs.is_empty() {
            return Ok(Vec::new());
        }
        let encoder = self
            .image_encoder
            .as_ref()
            .ok_or_else(|| LlmError::ImageEncoding("no image encoder configured".to_string()))?;
        refs.iter()
            .map(|image_ref| {
                encoder
                    .encode(image_ref)
                    .map_err(|e| LlmError::ImageEncoding(format!("{}: {:#}", image_ref, e)))
            })
            .collect()
    }
}

fn body_events(
    kind: ProviderKind,
    transport: Transport,
    resp: reqwest::Response,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<GenerationEvent, LlmError>> + Send {
    try_stream! {
        match transport {
            Transport::Complete => {
                let text = read_text(resp, &cancel).await?;
                let content = parse_complete(kind, &text)?;
                trace!("Generated {} characters", content.len());
                yield GenerationEvent::Done(content);
            }
            Transport::Sse => {
                let mut body = Box::pin(resp.bytes_stream());
                let mut decoder = SseDecoder::new();
                while let Some(chunk) = next_chunk(&mut body, &cancel).await? {
                    for data in decoder.push(&chunk) {
                        if let Some(text) = sse_delta(kind, &data)? {
                            yield GenerationEvent::Delta(text);
                        }
                    }
                    if decoder.is_done() {
                        trace!("Stream completed");
                        break;
                    }
                }
                for data in decoder.finish() {
                    if let Some(text) = sse_delta(kind, &data)? {
                        yield GenerationEvent::Delta(text);
                    }
                }
                yield GenerationEvent::Done(String::new());
            }
            Transport::JsonObjects => {
                let mut body = Box::pin(resp.bytes_stream());
                let mut scanner = JsonObjectScanner::new();
                let mut emitted = 0usize;
                while let Some(chunk) = next_chunk(&mut body, &cancel).await? {
                    for object in scanner.push(&chunk) {
                        if let Some(text) = gemini_delta(&object)? {
                            emitted += 1;
                            yield GenerationEvent::Delta(text);
                        }
                    }
                }
                if scanner.objects_seen() > 0 && emitted == 0 {
                    debug!("Gemini stream carried {} chunks without text", scanner.objects_seen());
                    Err::<(), _>(LlmError::EmptyResponse)?;
                }
                if scanner.objects_seen() == 0 {
                    debug!("No incremental chunks detected, parsing complete response");
                    let text = String::from_utf8_lossy(scanner.remaining()).into_owned();
                    let content = parse_complete(ProviderKind::Gemini, &text)?;
                    yield GenerationEvent::Delta(content);
                }
                yield GenerationEvent::Done(String::new());
            }
        }
    }
}

fn sse_delta(kind: ProviderKind, data: &SseData) -> Result<Option<String>, LlmError> {
    let SseData::Payload(payload) = data else {
        return Ok(None);
    };
    match parse_sse_payload(kind, payload) {
        Err(LlmError::Parse(err)) => {
            debug!("Skipping malformed stream payload: {}", err);
            Ok(None)
        }
        other => other,
    }
}

fn gemini_delta(object: &str) -> Result<Option<String>, LlmError> {
    match parse_gemini_chunk(object) {
        Err(LlmError::Parse(err)) => {
            debug!("Skipping malformed Gemini chunk: {}", err);
            Ok(None)
        }
        other => other,
    }
}

async fn next_chunk<S, B>(body: &mut S, cancel: &CancellationToken) -> Result<Option<B>, LlmError>
where
    S: Stream<Item = Result<B, reqwest::Error>> + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LlmError::Cancelled),
        chunk = body.next() => chunk.transpose().map_err(LlmError::from),
    }
}

async fn read_text(resp: reqwest::Response, cancel: &CancellationToken) -> Result<String, LlmError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LlmError::Cancelled),
        text = resp.text() => text.map_err(LlmError::from),
    }
}
