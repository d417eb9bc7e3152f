use std::{fmt, fs::OpenOptions, path::Path, str::FromStr, sync::Mutex};

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt::time::UtcTime, EnvFilter};

/**
 * \brief 调试级别：0 无输出，1 错误与重要事件，2 API 调用与 Provider 切换，3 全部操作。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DebugLevel {
    None = 0,
    #[default]
    Normal = 1,
    Informative = 2,
    Verbose = 3,
}

impl DebugLevel {
    /**
     * \brief 超出 0..=3 的值被截断到边界。
     */
    pub fn clamped(level: i64) -> Self {
        match level {
            i64::MIN..=0 => DebugLevel::None,
            1 => DebugLevel::Normal,
            2 => DebugLevel::Informative,
            _ => DebugLevel::Verbose,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /**
     * \brief 对应的 tracing 过滤级别。
     */
    pub fn directive(self) -> &'static str {
        match self {
            DebugLevel::None => "off",
            DebugLevel::Normal => "info",
            DebugLevel::Informative => "debug",
            DebugLevel::Verbose => "trace",
        }
    }

    fn filter(self) -> EnvFilter {
        match self {
            DebugLevel::None => EnvFilter::new("off"),
            level => EnvFilter::new(format!(
                "sailor_core_sdk={0},sailor={0}",
                level.directive()
            )),
        }
    }
}

impl fmt::Display for DebugLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

impl FromStr for DebugLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<i64>() {
            return Ok(DebugLevel::clamped(n));
        }
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(DebugLevel::None),
            "normal" => Ok(DebugLevel::Normal),
            "informative" | "info" => Ok(DebugLevel::Informative),
            "verbose" => Ok(DebugLevel::Verbose),
            other => Err(format!("invalid debug level: {}", other)),
        }
    }
}

/**
 * \brief 安装全局日志订阅器。`RUST_LOG` 存在时优先于调试级别。
 * \param log_file 指定时以追加方式写入该文件（自动创建目录），否则输出到 stderr。
 */
pub fn init(level: DebugLevel, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.filter());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);

    let installed = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|e| anyhow!("failed to install log subscriber: {}", e))
}
