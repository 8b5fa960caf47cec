//! Toolbridge library: exposes a stdio child process's tools to a model-driven loop.
//!
//! - `bridge`: transport, protocol client and session lifecycle
//! - `schema`: capability descriptors to validated `ExecutableTool`s
//! - `tool_loop`: conversation orchestration between the model and the tools
//!
//! The binary in `main.rs` adds the CLI; integration tests in `tests/` use
//! this library target to drive a real mock server.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod error;
pub mod output;
pub mod project;
pub mod schema;
pub mod tool_loop;

pub use error::{BridgeError, Result};
