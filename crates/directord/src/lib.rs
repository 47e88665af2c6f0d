//! Operator-side library: orchestration expansion and submission.

pub mod orchestration;
pub mod submit;

pub use orchestration::{expand_orchestrations, OrchestrationEntry};
pub use submit::{manage, send_data};
