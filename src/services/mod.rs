pub mod completion_sink;
pub mod stage_executor;

pub use completion_sink::{ChannelSink, CompletionSink, LogSink, WebhookSink};
pub use stage_executor::{HttpStageExecutor, StageExecutor, StageResult, StageStatus};
