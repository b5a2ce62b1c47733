//! # Pipedrop Core Library
//!
//! `pipedrop-core` moves text, files and whole folders between two peers over
//! an ordered, reliable, message-oriented channel. Nothing is staged on a
//! server: the sender streams bounded network chunks, the receiver puts them
//! back together in memory or on disk, and interrupted files resume from
//! whatever already reached the disk.
//!
//! ## Features
//!
//! - **Chunked streaming**: large batched reads sliced into fixed-size
//!   self-describing packets
//! - **Adaptive pacing**: per-peer learned buffer thresholds drive send delays
//! - **Ordered disk writes**: a bounded reorder buffer in front of the sink
//! - **Resume**: partial files on disk become the offset of the next request
//! - **Folders**: aggregate progress across every member file
//!
//! ## Modules
//!
//! - [`channel`] - The peer message channel abstraction
//! - [`config`] - Configuration management
//! - [`events`] - Session events delivered to the embedding application
//! - [`mod@file`] - File metadata, folder aggregates and streaming reads
//! - [`protocol`] - Control messages and the binary chunk packet
//! - [`session`] - Session object owning both pipelines
//! - [`storage`] - Disk storage abstraction for received files
//! - [`transfer`] - Sender and receiver pipelines
//!
//! ## Example
//!
//! ```rust,ignore
//! use pipedrop_core::{channel::MemoryChannel, config::Config, session::Session};
//! use pipedrop_core::{file::enumerate_outgoing, storage::FsStorage};
//!
//! let (left, right) = MemoryChannel::pair("alice", "bob");
//! let (alice, alice_events) = Session::open(&Config::default(), left.channel, FsStorage::new("out"))?;
//! alice.send_file_meta(&enumerate_outgoing(&paths)?, None).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod file;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod transfer;

pub use error::{Error, Result};
pub use session::Session;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default network chunk size (64 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default number of network chunks read per disk batch (32 MB batches)
pub const DEFAULT_BATCH_CHUNKS: usize = 512;

/// Default capacity of the receiver's reorder buffer, in chunks
pub const DEFAULT_REORDER_BUFFER_CHUNKS: usize = 100;

/// Default slack allowed between declared and assembled size (1 KB)
pub const DEFAULT_SIZE_TOLERANCE: u64 = 1024;

/// Default size of a single text piece, in bytes
pub const DEFAULT_STRING_CHUNK_SIZE: usize = 16 * 1024;

/// Default maximum message size accepted by the channel (256 KB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;
