use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use rusqlite::Connection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use sailor_core_sdk::models::{
    AliasConfig, AliasUpdate, EncodedImage, ImageEncoder, MessageRole,
};
use sailor_core_sdk::{
    db, registry, telemetry, EngineConfig, GenerationEvent, GenerationRequest, LegacyConfigSource,
    LegacyProviderConfig, LlmEngine,
};

/**
 * \brief CLI 程序入口：别名管理、可用性检查与对话。
 */
#[derive(Parser, Debug)]
#[command(name = "sailor", version, about = "Multi-provider LLM chat")]
struct Cli {
    /** \brief SQLite 数据库文件 */
    #[arg(long, global = true, env = "SAILOR_DB_PATH", default_value = db::DEFAULT_DB_FILE)]
    db: PathBuf,

    /** \brief 调试级别 0..=3，保存到数据库 */
    #[arg(long, global = true)]
    debug_level: Option<i64>,

    /** \brief 日志追加写入该文件，缺省输出到 stderr */
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /** \brief 列出支持的 Provider 类型及默认值。 */
    Types,

    /** \brief 管理 Provider 别名。 */
    Alias {
        #[command(subcommand)]
        action: AliasAction,
    },

    /** \brief 检查别名可达性。 */
    Check {
        #[arg(long)]
        alias: Option<String>,
    },

    /** \brief 拉取别名的模型列表。 */
    Models {
        #[arg(long)]
        alias: String,
    },

    /**
     * \brief 发送一条用户消息并显示模型回复。
     */
    Chat {
        #[arg(long)]
        alias: String,
        /** \brief 继续已有会话 */
        #[arg(long)]
        conversation: Option<i64>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = false)]
        no_stream: bool,
        /** \brief 附加图片文件，可重复 */
        #[arg(long = "image")]
        images: Vec<PathBuf>,
        prompt: String,
    },

    /** \brief 浏览已保存的会话。 */
    Conversations {
        #[command(subcommand)]
        action: ConversationAction,
    },
}

#[derive(Subcommand, Debug)]
enum AliasAction {
    Add {
        id: String,
        #[arg(long = "type")]
        provider_type: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        port: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /** \brief 探测超时（毫秒） */
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = false)]
        thinking: bool,
    },
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        thinking: Option<bool>,
    },
    Remove {
        id: String,
    },
    List,
    Favorite {
        id: String,
        model: String,
    },
    Thinking {
        id: String,
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /** \brief 标记受保护的默认别名。 */
    Default {
        id: String,
        #[arg(long, default_value_t = false)]
        unset: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConversationAction {
    List,
    Show { id: i64 },
    Rename { id: i64, name: String },
    Delete { id: i64 },
}

/**
 * \brief 从本地文件读取图片，按扩展名推断 MIME 类型。
 */
struct FileImageEncoder;

impl ImageEncoder for FileImageEncoder {
    fn encode(&self, image_ref: &str) -> Result<EncodedImage> {
        let path = Path::new(image_ref);
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        let mime_type = match ext.as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "webp" => "image/webp",
            other => bail!("unsupported image type: {:?}", other),
        };
        let bytes = std::fs::read(path).with_context(|| format!("read image {}", image_ref))?;
        Ok(EncodedImage {
            bytes,
            mime_type: mime_type.to_string(),
        })
    }
}

/**
 * \brief 未注册别名时，按类型读取 `SAILOR_<TYPE>_API_KEY` / `SAILOR_<TYPE>_BASE_URL`。
 */
struct EnvLegacySource;

impl LegacyConfigSource for EnvLegacySource {
    fn legacy_config(&self, provider_type: &str) -> Option<LegacyProviderConfig> {
        let prefix = format!("SAILOR_{}", provider_type.to_ascii_uppercase());
        let api_key = std::env::var(format!("{}_API_KEY", prefix)).unwrap_or_default();
        let base_url = std::env::var(format!("{}_BASE_URL", prefix)).unwrap_or_default();
        if api_key.is_empty() && base_url.is_empty() {
            return None;
        }
        Some(LegacyProviderConfig { base_url, api_key })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let conn = db::open_db(&cli.db).context("open database failed")?;
    db::migrate(&conn).context("apply migrations failed")?;

    let level = match cli.debug_level {
        Some(raw) => {
            let level = telemetry::DebugLevel::clamped(raw);
            db::set_debug_level(&conn, level).context("save debug level failed")?;
            level
        }
        None => db::get_debug_level(&conn).context("load debug level failed")?,
    };
    telemetry::init(level, cli.log_file.as_deref())?;
    debug!("Debug level: {}", level);

    let engine = LlmEngine::new(EngineConfig::from_env())
        .context("create HTTP client failed")?
        .with_image_encoder(Arc::new(FileImageEncoder))
        .with_legacy_source(Arc::new(EnvLegacySource));
    if let Some(json) = db::load_provider_aliases(&conn).context("load aliases failed")? {
        engine
            .store()
            .write()
            .deserialize(&json)
            .context("invalid stored aliases")?;
    }

    match cli.command {
        Commands::Types => {
            for t in registry::list_types() {
                println!(
                    "{:<10} {:<20} {} (models: {})",
                    t.id(),
                    t.display_name,
                    t.default_base_url,
                    t.default_models.join(", ")
                );
            }
        }
        Commands::Alias { action } => run_alias(&conn, &engine, action)?,
        Commands::Check { alias } => {
            let results = match alias {
                Some(id) => engine.check_aliases(&[id]).await,
                None => engine.check_all().await,
            };
            if results.is_empty() {
                println!("No aliases configured.");
            }
            for (id, outcome) in results {
                println!("{:<16} {:<10} {}", id, outcome.availability.as_str(), outcome.message);
            }
        }
        Commands::Models { alias } => {
            let models = engine
                .refresh_models(&alias)
                .await
                .with_context(|| format!("fetch models for {} failed", alias))?;
            if models.is_empty() {
                println!("No models reported.");
            }
            for model in models {
                println!("{}", model);
            }
        }
        Commands::Chat {
            alias,
            conversation,
            model,
            no_stream,
            images,
            prompt,
        } => {
            run_chat(
                &conn,
                &engine,
                ChatArgs {
                    alias,
                    conversation,
                    model,
                    stream: !no_stream,
                    images,
                    prompt,
                },
            )
            .await?
        }
        Commands::Conversations { action } => run_conversations(&conn, action)?,
    }

    Ok(())
}

fn save_aliases(conn: &Connection, engine: &LlmEngine) -> Result<()> {
    let json = engine.store().read().serialize()?;
    db::save_provider_aliases(conn, &json).context("save aliases failed")
}

fn run_alias(conn: &Connection, engine: &LlmEngine, action: AliasAction) -> Result<()> {
    match action {
        AliasAction::Add {
            id,
            provider_type,
            name,
            url,
            api_key,
            port,
            description,
            timeout,
            model,
            thinking,
        } => {
            let config = AliasConfig {
                display_name: name,
                base_url: url,
                api_key,
                port,
                description,
                timeout_ms: timeout,
                favorite_model: model,
                enable_thinking: thinking,
            };
            if !engine.store().write().add_alias(&id, &provider_type, config) {
                bail!("could not add alias {} (type: {})", id, provider_type);
            }
            save_aliases(conn, engine)?;
            println!("Added alias {}", id);
        }
        AliasAction::Update {
            id,
            name,
            url,
            api_key,
            description,
            timeout,
            model,
            thinking,
        } => {
            let update = AliasUpdate {
                display_name: name,
                base_url: url,
                description,
                timeout_ms: timeout,
                api_key,
                favorite_model: model,
                enable_thinking: thinking,
            };
            if !engine.store().write().update_alias(&id, update) {
                bail!("unknown alias {}", id);
            }
            save_aliases(conn, engine)?;
            println!("Updated alias {}", id);
        }
        AliasAction::Remove { id } => {
            if !engine.store().write().remove_alias(&id) {
                bail!("alias {} not found or protected as default", id);
            }
            save_aliases(conn, engine)?;
            println!("Removed alias {}", id);
        }
        AliasAction::List => {
            let store = engine.store().read();
            let ids = store.alias_ids();
            if ids.is_empty() {
                println!("No aliases configured.");
            }
            for id in ids {
                if let Some(alias) = store.get_alias(&id) {
                    println!(
                        "{:<16} {:<10} {} model={} key={} thinking={}{}",
                        id,
                        alias.provider_type.as_str(),
                        alias.base_url,
                        alias.favorite_model,
                        if alias.api_key.is_empty() { "empty" } else { "set" },
                        alias.enable_thinking,
                        if alias.is_default { " [default]" } else { "" }
                    );
                }
            }
        }
        AliasAction::Favorite { id, model } => {
            if !engine.store().write().set_favorite_model(&id, &model) {
                bail!("unknown alias {}", id);
            }
            save_aliases(conn, engine)?;
        }
        AliasAction::Thinking { id, enabled } => {
            if !engine.store().write().set_thinking_mode(&id, enabled) {
                bail!("unknown alias {}", id);
            }
            save_aliases(conn, engine)?;
        }
        AliasAction::Default { id, unset } => {
            if !engine.store().write().set_default_flag(&id, !unset) {
                bail!("unknown alias {}", id);
            }
            save_aliases(conn, engine)?;
        }
    }
    Ok(())
}

struct ChatArgs {
    alias: String,
    conversation: Option<i64>,
    model: Option<String>,
    stream: bool,
    images: Vec<PathBuf>,
    prompt: String,
}

async fn run_chat(conn: &Connection, engine: &LlmEngine, args: ChatArgs) -> Result<()> {
    let conversation_id = match args.conversation {
        Some(id) => {
            db::get_conversation(conn, id)?.with_context(|| format!("conversation {} not found", id))?;
            id
        }
        None => {
            let name: String = args.prompt.trim().chars().take(40).collect();
            let id = db::insert_conversation(conn, &name).context("create conversation failed")?;
            println!("Created conversation id={}", id);
            id
        }
    };

    let history = db::load_history(conn, conversation_id).context("load history failed")?;
    db::insert_message(
        conn,
        conversation_id,
        MessageRole::User,
        &args.prompt,
        None,
        None,
        None,
    )
    .context("insert user message failed")?;

    let model = args
        .model
        .clone()
        .unwrap_or_else(|| engine.store().read().favorite_model(&args.alias));
    let cancel = CancellationToken::new();
    let mut request = GenerationRequest::new(&args.alias, &args.prompt)
        .with_history(history)
        .with_images(
            args.images
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
        )
        .streaming(args.stream)
        .with_cancel(cancel.clone());
    if let Some(model) = args.model {
        request = request.with_model(model);
    }

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    info!("chat alias={} conversation={} prompt_len={}", args.alias, conversation_id, args.prompt.len());
    let mut events = engine.generate(request);
    let mut reply = String::new();
    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        match event {
            GenerationEvent::Delta(text) => {
                print!("{}", text);
                stdout.flush().ok();
                reply.push_str(&text);
            }
            GenerationEvent::Done(text) => {
                print!("{}", text);
                reply.push_str(&text);
            }
            GenerationEvent::Failed(err) => {
                println!();
                db::insert_message(
                    conn,
                    conversation_id,
                    MessageRole::Error,
                    &err.to_string(),
                    None,
                    Some(&args.alias),
                    Some(&model),
                )
                .context("insert error message failed")?;
                return Err(anyhow!(err).context("generation failed"));
            }
        }
    }
    println!();

    if reply.trim().is_empty() {
        let message = "Empty response from provider";
        db::insert_message(
            conn,
            conversation_id,
            MessageRole::Error,
            message,
            None,
            Some(&args.alias),
            Some(&model),
        )
        .context("insert error message failed")?;
        bail!("generation failed: {}", message);
    }

    db::insert_message(
        conn,
        conversation_id,
        MessageRole::Bot,
        &reply,
        None,
        Some(&args.alias),
        Some(&model),
    )
    .context("insert bot message failed")?;
    Ok(())
}

fn run_conversations(conn: &Connection, action: ConversationAction) -> Result<()> {
    match action {
        ConversationAction::List => {
            for c in db::list_conversations(conn)? {
                println!("{:>5}  {}", c.id, c.name);
            }
        }
        ConversationAction::Show { id } => {
            let conversation = db::get_conversation(conn, id)?
                .with_context(|| format!("conversation {} not found", id))?;
            println!("# {}", conversation.name);
            for m in db::list_messages(conn, id)? {
                let source = match (&m.provider_alias, &m.model_name) {
                    (Some(alias), Some(model)) => format!(" ({}/{})", alias, model),
                    (Some(alias), None) => format!(" ({})", alias),
                    _ => String::new(),
                };
                println!("[{}]{} {}", m.role, source, m.text);
            }
        }
        ConversationAction::Rename { id, name } => {
            db::rename_conversation(conn, id, &name)?;
        }
        ConversationAction::Delete { id } => {
            db::delete_conversation(conn, id)?;
            println!("Deleted conversation {}", id);
        }
    }
    Ok(())
}
