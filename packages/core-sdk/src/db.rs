use anyhow::{bail, Result};
use rusqlite::{params, types::Type, Connection, ErrorCode, OptionalExtension};
use std::{path::Path, thread, time::Duration};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, trace};

use crate::models::{ConversationMessage, MessageRole};
use crate::telemetry::DebugLevel;

pub const DEFAULT_DB_FILE: &str = "sailor.db";

const KEY_PROVIDER_ALIASES: &str = "provider_aliases";
const KEY_DEBUG_LEVEL: &str = "debug_level";

/**
 * \brief 写入前的参数校验错误，表示调用方传入了非法值。
 */
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid or missing conversation ID")]
    ConversationId,
    #[error("Invalid message role (must be: user, bot, error, system)")]
    MessageRole,
    #[error("Invalid or empty message text")]
    MessageText,
    #[error("Invalid or empty conversation name")]
    ConversationName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: i64,
    pub name: String,
}

/**
 * \brief 带主键与元数据的消息记录。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub role: MessageRole,
    /** \brief 消息正文（已去除首尾空白） */
    pub text: String,
    /** \brief 毫秒时间戳 */
    pub timestamp: i64,
    pub provider_alias: Option<String>,
    pub model_name: Option<String>,
}

/**
 * \brief 打开指定路径的数据库文件。
 */
pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 打开默认数据库文件（本地目录下的 sailor.db）。
 */
pub fn open_default_db() -> Result<Connection> {
    open_db(DEFAULT_DB_FILE)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS conversations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id),
            role TEXT NOT NULL,
            message TEXT NOT NULL,
            timestamp INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, timestamp);

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;

    // Older databases predate per-message provider metadata.
    ensure_column(conn, "messages", "provider_alias", "TEXT")?;
    ensure_column(conn, "messages", "model_name", "TEXT")?;
    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    let mut has = false;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            has = true;
            break;
        }
    }
    if !has {
        debug!("Adding column {}.{}", table, column);
        retry_on_locked(|| {
            conn.execute(
                &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl),
                [],
            )
        })?;
    }
    Ok(())
}

fn validate_conversation_id(id: i64) -> Result<(), ValidationError> {
    if id > 0 {
        Ok(())
    } else {
        Err(ValidationError::ConversationId)
    }
}

fn validated_text(text: &str, err: ValidationError) -> Result<&str, ValidationError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Err(err)
    } else {
        Ok(trimmed)
    }
}

/**
 * \brief 将字符串角色解析为 MessageRole，非法值返回校验错误。
 */
pub fn parse_role(role: &str) -> Result<MessageRole, ValidationError> {
    role.parse().map_err(|_| ValidationError::MessageRole)
}

/**
 * \brief 当前 UTC 毫秒时间戳。
 */
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/**
 * \brief 创建会话，返回新会话 id。
 */
pub fn insert_conversation(conn: &Connection, name: &str) -> Result<i64> {
    let name = validated_text(name, ValidationError::ConversationName)?;
    retry_on_locked(|| conn.execute("INSERT INTO conversations (name) VALUES (?1)", params![name]))?;
    Ok(conn.last_insert_rowid())
}

pub fn rename_conversation(conn: &Connection, id: i64, name: &str) -> Result<()> {
    validate_conversation_id(id)?;
    let name = validated_text(name, ValidationError::ConversationName)?;
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE conversations SET name=?1 WHERE id=?2",
            params![name, id],
        )
    })?;
    if rows == 0 {
        bail!("conversation id {} not found", id);
    }
    Ok(())
}

/**
 * \brief 删除会话及其全部消息（同一事务内完成）。
 */
pub fn delete_conversation(conn: &Connection, id: i64) -> Result<()> {
    validate_conversation_id(id)?;
    retry_on_locked(|| {
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM messages WHERE conversation_id=?1", params![id])?;
        tx.execute("DELETE FROM conversations WHERE id=?1", params![id])?;
        tx.commit()
    })?;
    Ok(())
}

/**
 * \brief 列出全部会话，新会话在前。
 */
pub fn list_conversations(conn: &Connection) -> Result<Vec<Conversation>> {
    let mut stmt = conn.prepare("SELECT id, name FROM conversations ORDER BY id DESC")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Conversation {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_conversation(conn: &Connection, id: i64) -> Result<Option<Conversation>> {
    let conversation = conn
        .query_row(
            "SELECT id, name FROM conversations WHERE id=?1",
            params![id],
            |row| {
                Ok(Conversation {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(conversation)
}

/**
 * \brief 插入一条消息。
 * \param timestamp 毫秒时间戳，None 时取当前时间。
 * \details 所有参数在写入前校验；正文去除首尾空白后保存。
 */
pub fn insert_message(
    conn: &Connection,
    conversation_id: i64,
    role: MessageRole,
    text: &str,
    timestamp: Option<i64>,
    provider_alias: Option<&str>,
    model_name: Option<&str>,
) -> Result<i64> {
    validate_conversation_id(conversation_id)?;
    let text = validated_text(text, ValidationError::MessageText)?;
    let ts = timestamp.unwrap_or_else(now_millis);
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO messages (conversation_id, role, message, timestamp, provider_alias, model_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![conversation_id, role.as_str(), text, ts, provider_alias, model_name],
        )
    })?;
    trace!("Inserted {} message into conversation {}", role, conversation_id);
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 读取会话消息，按时间戳升序。
 */
pub fn list_messages(conn: &Connection, conversation_id: i64) -> Result<Vec<StoredMessage>> {
    validate_conversation_id(conversation_id)?;
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, role, message, timestamp, provider_alias, model_name
         FROM messages WHERE conversation_id=?1 ORDER BY timestamp ASC, id ASC",
    )?;
    let rows = stmt
        .query_map(params![conversation_id], |row| {
            let role: String = row.get(2)?;
            let role = parse_role(&role)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
            Ok(StoredMessage {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                role,
                text: row.get(3)?,
                timestamp: row.get(4)?,
                provider_alias: row.get(5)?,
                model_name: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 读取可作为生成输入的历史（只保留 user / bot 消息）。
 */
pub fn load_history(conn: &Connection, conversation_id: i64) -> Result<Vec<ConversationMessage>> {
    Ok(list_messages(conn, conversation_id)?
        .into_iter()
        .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Bot))
        .map(|m| ConversationMessage {
            role: m.role,
            text: m.text,
        })
        .collect())
}

fn set_config(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

fn get_config(conn: &Connection, key: &str) -> Result<Option<String>> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val)
}

/**
 * \brief 保存别名配置 JSON。
 */
pub fn save_provider_aliases(conn: &Connection, json: &str) -> Result<()> {
    set_config(conn, KEY_PROVIDER_ALIASES, json)
}

pub fn load_provider_aliases(conn: &Connection) -> Result<Option<String>> {
    get_config(conn, KEY_PROVIDER_ALIASES)
}

/**
 * \brief 读取调试级别；未设置或非法时为 Normal。
 */
pub fn get_debug_level(conn: &Connection) -> Result<DebugLevel> {
    Ok(get_config(conn, KEY_DEBUG_LEVEL)?
        .and_then(|v| v.parse::<DebugLevel>().ok())
        .unwrap_or_default())
}

pub fn set_debug_level(conn: &Connection, level: DebugLevel) -> Result<()> {
    set_config(conn, KEY_DEBUG_LEVEL, &level.as_u8().to_string())
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 错误并线性退避，最多重试 5 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                debug!("Database locked, retry {}/{}", attempt, MAX_RETRIES);
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
