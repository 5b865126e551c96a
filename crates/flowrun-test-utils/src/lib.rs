//! Test helpers shared across flowrun crates.

pub mod executor;
pub mod fixtures;

pub use executor::{Call, Gate, MockExecutor, Reply};
pub use fixtures::{
    fan_out_flow, guarded_flow, linear_flow, memory_store, router_flow, temp_store, StaticRecords,
};
