//! Aggregate checkpoints
//!
//! Records are written per (VPA, container name) so history survives a
//! restart. The store is an I/O seam; the writer decides what goes into it.

mod record;
mod store;
mod writer;

pub use record::{checkpoint_name, CheckpointStatus, VpaCheckpoint, CHECKPOINT_VERSION};
pub use store::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
pub use writer::{CheckpointWriter, WriteSummary};
