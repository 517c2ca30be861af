//! Instance memory for the NPL agent bridge.
//!
//! Agents create protocol instances in one step and act on them in later
//! steps. The [`InstanceMemory`] remembers, per agent, which instances were
//! created or touched and in which state; [`tools::MemoryTools`] exposes that
//! ledger to the agents themselves.

pub mod instance;
pub mod tools;

pub use instance::InstanceMemory;
