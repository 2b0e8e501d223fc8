//! Cross-thread streaming between search passes.

pub mod arc_buffer;
pub mod sync_array;

pub use arc_buffer::{ArcBuffer, ArcReader, WordArc};
pub use sync_array::{SyncArray, SyncReader, WaitStatus};
