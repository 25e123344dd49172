pub mod settings;

pub use settings::{
    AuthConfig, CorsConfig, DatabaseConfig, LlmConfig, MemoryConfig, ServerConfig, Settings,
};
