//! Receiving pipeline.
//!
//! [`ReceiveOrchestrator`] is the public entry point. Incoming packets pass
//! through [`ChunkProcessor`] into the peer's [`ActiveReception`], which either
//! feeds a [`SequencedDiskWriter`] or fills in-memory slots that
//! [`FileAssembler`] joins at the end. [`MessageProcessor`] applies
//! announcements and text messages to [`ReceptionStateManager`].
//!
//! Receive-side progress goes through the shared
//! [`ProgressTracker`](crate::transfer::ProgressTracker) in the
//! [`Receive`](crate::transfer::TransferDirection::Receive) direction.

pub mod assembler;
pub mod chunk;
pub mod orchestrator;
pub mod processor;
pub mod state;
pub mod writer;

pub use assembler::FileAssembler;
pub use chunk::ChunkProcessor;
pub use orchestrator::{FolderReceipt, PendingReception, ReceiveOrchestrator, RequestOutcome};
pub use processor::MessageProcessor;
pub use state::{
    ActiveReception, PeerReceptionState, ReceptionState, ReceptionStateManager, SaveTypeRegistry,
};
pub use writer::SequencedDiskWriter;
