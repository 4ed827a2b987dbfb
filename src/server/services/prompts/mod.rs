//! Prompt Support
//!
//! Prompt registration and rendering dispatch for the default `listPrompts`
//! and `getPrompt` handlers.

pub mod prompt_registry;

pub use prompt_registry::{ PromptHandler, PromptRegistry };
