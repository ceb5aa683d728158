// LLM abstraction layer

pub mod keys;
pub mod openai;
pub mod provider;
pub mod service;

pub use keys::{KeyManagerConfig, KeyManagerStats, ProviderKeyManager};
pub use provider::{create_adapter, LLMAdapter, TextStream};
pub use service::LLMService;
