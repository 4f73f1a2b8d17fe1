//! # Relay Providers
//!
//! Upstream adaptors and the shared HTTP transport for the LLM relay.
//!
//! This crate provides:
//! - A connection-pooled requester with per-channel proxies and error normalization
//! - OpenAI and the OpenAI-compatible family (Azure, DeepSeek, Mistral, Groq, Moonshot, Custom)
//! - Anthropic (Claude) and AWS Bedrock (Claude, SigV4 signed, event-stream framed)
//! - Zhipu (JWT), Baidu (OAuth access token) and MiniMax (`GroupId`)
//! - Xunfei Spark chat over a signed websocket
//! - A derived-credential cache and the adaptor factory

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod anthropic;
pub mod baidu;
pub mod bedrock;
pub mod credential_cache;
pub mod eventstream;
pub mod minimax;
pub mod openai;
pub mod registry;
pub mod requester;
pub mod sigv4;
pub mod xunfei;
pub mod zhipu;

// Re-export main types
pub use anthropic::AnthropicAdaptor;
pub use baidu::BaiduAdaptor;
pub use bedrock::BedrockAdaptor;
pub use credential_cache::CredentialCache;
pub use minimax::MiniMaxAdaptor;
pub use openai::OpenAIAdaptor;
pub use registry::{AdaptorFactory, DefaultAdaptorFactory, ProviderContext};
pub use requester::{HttpRequester, RequesterConfig};
pub use sigv4::SigV4Signer;
pub use xunfei::XunfeiAdaptor;
pub use zhipu::ZhipuAdaptor;
