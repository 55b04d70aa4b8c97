//! rotor-llm: an authenticated LLM API gateway that proxies Gemini-style
//! and OpenAI-Chat-style requests to one upstream provider while rotating
//! a pool of upstream credentials with failure-driven cooldowns.

pub mod config;
pub mod dialect;
pub mod error;
pub mod gate;
pub mod http;
pub mod pool;
pub mod proxy;
pub mod store;
pub mod task;
pub mod upstream;

pub use config::GatewayConfig;
pub use error::GatewayError;
