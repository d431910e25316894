pub mod config;
pub mod error;
pub mod key;
pub mod types;

pub use config::{
    BatchSettings, CacheSettings, EmbeddingServiceConfig, HybridSettings, LimiterSettings,
    LoggingConfig, PrefetchSettings, ServerConfig, Settings,
};
pub use error::*;
pub use key::*;
pub use types::*;
