//! UVZ - quota-aware research and content generation tool server core
//!
//! This library provides the orchestration layer behind nine content-research
//! tools: a quota governor protecting a free-tier LLM budget, a web research
//! aggregator, a prompt assembler, and a governed completion client, all
//! sequenced by the tool pipeline.

pub mod assemble;
pub mod catalog;
pub mod completion;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod quota;
pub mod research;

pub use error::{Error, Result};
