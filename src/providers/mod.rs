pub mod anthropic;
pub mod base;
#[doc(hidden)]
pub mod testing;

pub use base::{
    ContentBlock, LlmProvider, ProviderMessage, ProviderRequest, ProviderResponse, RetryConfig,
    StopReason, ToolSchema, Usage,
};
