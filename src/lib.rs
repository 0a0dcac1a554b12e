//! Chat-style demo built on `shadow_engine`.
//!
//! The engine lives in the `shadow-engine` workspace member; this crate
//! wires it to a small conversations/messages schema and drives scripted
//! scenarios against an in-process remote.

pub mod demo;

pub use demo::{declare_chat_schema, Demo, DemoScenario, TableSnapshot};
