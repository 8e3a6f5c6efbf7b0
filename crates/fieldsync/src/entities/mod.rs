//! Replicated entity descriptors and record mapping

pub mod catalog;
mod mapping;

pub use catalog::{Column, EntityId, EntitySpec, ParentScope, Source, Termination};
pub use mapping::{map_child_record, map_record};
