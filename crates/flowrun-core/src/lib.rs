pub mod config;
pub mod error;
pub mod event;
pub mod memory;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{FlowError, Result};
pub use event::{EventBus, FlowEvent, ProgressSink, Subscription};
pub use memory::MemoryLogStore;
pub use types::*;
