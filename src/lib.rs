//! A compatibility layer between native extensions written against a C
//! object API and a managed, garbage-collected runtime.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod ffi;
pub mod runtime;
pub mod version;

pub use bridge::{Bridge, BridgeError, Context, FatalError, Flow, Handle, Status, Unwind};
pub use config::BridgeConfig;
pub use runtime::{ManagedHeap, ManagedRuntime, StandardClass, Value};
