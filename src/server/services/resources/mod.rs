//! Resource Support
//!
//! Resource and template registration for the default resource handlers.

pub mod resource_registry;

// Re-export public types from resource_registry
pub use resource_registry::{ FileResource, MemoryResource, ResourceReader, ResourceRegistry };
