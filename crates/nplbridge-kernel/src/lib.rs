//! Core kernel for the NPL agent bridge.
//!
//! The kernel owns every piece of process state (credentials, tool cache,
//! instance memory, metrics) and exposes the entry points an agent runtime
//! uses: listing compiled tools, invoking them and reading instances, with
//! memory tracking.

pub mod config;
pub mod error;
pub mod kernel;

pub use kernel::BridgeKernel;
pub use nplbridge_runtime::instances::InstanceQuery;
