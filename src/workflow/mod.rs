pub mod grading_flow;
pub mod submission_ctx;

pub use grading_flow::{GradingPipeline, SubmissionReport};
pub use submission_ctx::SubmissionCtx;
