pub mod composer;
pub mod grid_composer;
pub mod llm;
pub mod normalizer;
pub mod param_advisor;
pub mod price;
pub mod prompt_composer;

pub use composer::Composer;
pub use grid_composer::GridComposer;
pub use llm::{HttpLlmClient, LlmClient};
pub use normalizer::{normalize_plan, NormalizerConfig};
pub use param_advisor::{GridParamAdvice, GridParamAdvisor, PrevGridParams};
pub use price::{resolve_price, resolve_price_from_features};
pub use prompt_composer::PromptComposer;
