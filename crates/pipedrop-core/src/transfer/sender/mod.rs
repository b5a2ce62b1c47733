//! Sending pipeline.
//!
//! [`TransferOrchestrator`] is the public entry point; [`MessageRouter`]
//! feeds it the control messages a receiving peer sends back;
//! [`TransferStateManager`] keeps per-peer progress, receipts and learned
//! channel metrics.

pub mod orchestrator;
pub mod router;
pub mod state;

pub use orchestrator::TransferOrchestrator;
pub use router::MessageRouter;
pub use state::{PeerTransferState, TransferStateManager};
