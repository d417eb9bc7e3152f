pub mod alias;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod registry;
pub mod request;
pub mod response;
pub mod stream;
pub mod telemetry;

pub use alias::AliasStore;
pub use config::{DuplicatePolicy, EngineConfig};
pub use error::{ErrorKind, LlmError};
pub use llm::{
    GenerationEvent, GenerationRequest, GenerationSink, LegacyConfigSource, LegacyProviderConfig,
    LlmEngine, ProbeOutcome,
};

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::alias;
    pub use crate::config;
    pub use crate::db;
    pub use crate::llm;
    pub use crate::models;
    pub use crate::registry;
    pub use crate::telemetry;
}
