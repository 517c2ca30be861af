//! Core types for the NPL agent bridge.
//!
//! This crate defines the data model shared by the runtime, the instance
//! memory and the kernel: credentials, package and operation descriptors,
//! compiled-tool descriptors, memory records, telemetry events and the
//! error taxonomy. It contains no I/O.

pub mod config;
pub mod credential;
pub mod error;
pub mod event;
pub mod memory;
pub mod operation;
pub mod package;
pub mod tool;
