pub mod launcher;
pub mod pipeline_flow;
pub mod request_ctx;
pub mod suspension;

pub use launcher::PipelineLauncher;
pub use pipeline_flow::{review_needed, FlowOutcome, PipelineFlow};
pub use request_ctx::RequestCtx;
pub use suspension::SuspensionBridge;
