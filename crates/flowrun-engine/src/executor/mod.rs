//! Node executors: bridges from the coordinator to the agent runtime.

pub mod http;
pub mod sse;

pub use http::HttpNodeExecutor;
pub use sse::{SseEvent, SseParser, SseStream};
