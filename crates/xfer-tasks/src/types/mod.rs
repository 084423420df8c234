//! Value types shared by every layer: task state and task kind.

pub mod kind;
pub mod state;

pub use kind::TaskKind;
pub use state::TaskState;
