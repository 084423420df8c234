//! Domain types for the stored representation of a task.
//!
//! [`TaskRecord`] is what the state store holds under a task's key.
//! [`ActiveSlot`] is what it holds under an owner's key: the pointer that
//! enforces one active task per owner.

pub mod record;
pub mod slot;

pub use record::*;
pub use slot::*;
