pub mod aggregator;
pub mod gateway;
pub mod interpolate;
pub mod llm_factory;
pub mod llm_provider;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod report;
pub mod stage_executor;
pub mod stage_prompts;
pub mod stage_schemas;

// OpenAI-compatible HTTP providers (OpenAI, LM Studio, Ollama)
#[cfg(feature = "openai-compatible")]
pub mod openai_compatible_provider;

pub use aggregator::FindingAggregator;
pub use gateway::{GatewayError, LlmGateway, LlmRequest, ProviderGateway};
pub use interpolate::{interpolate, TemplateVars};
pub use llm_factory::LLMProviderFactory;
pub use llm_provider::*;
pub use pipeline::{IrisPipeline, PipelineError, PipelineState};
pub use progress::{LogCallback, LogLevel, PipelineReporter, ProgressCallback};
pub use prompts::{PromptStore, PromptTemplate, StageId};
pub use report::{ReportAssembler, ReportError, SideOutcome};
pub use stage_executor::{ExecutorSettings, StageExecutor, StageInput};
pub use stage_schemas::*;
