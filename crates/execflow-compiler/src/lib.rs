//! Task-graph compiler.
//!
//! Turns a [`GraphSnapshot`](execflow_core::GraphSnapshot) into a
//! [`TaskSetDocument`]: edges are validated, the graph is checked for cycles,
//! a parent-first order is computed, and every task embeds its children by
//! value so the remote agent needs no separate graph store.

pub mod command;
pub mod compiler;
pub mod document;

pub use command::CommandRequest;
pub use compiler::{compile, CompileOptions, CompiledTaskSet, Compiler};
pub use document::{TaskRecord, TaskSetDocument};
