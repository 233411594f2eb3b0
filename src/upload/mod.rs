//! Resumable chunked uploads.
//!
//! A client begins a session for `(owner, filename, size, chunk_size)`,
//! sends chunks in any order and with any parallelism, and the staging
//! file is promoted to its permanent name once the last chunk lands.
//! Abandoned sessions are reclaimed by the [`sweeper::ExpirySweeper`].

pub mod finalize;
pub mod recovery;
pub mod registry;
pub mod session;
pub mod sweeper;

pub use registry::{SessionLimits, SessionRegistry};
pub use session::{BeginOutcome, ChunkLayout, ChunkOutcome, SessionStatus};
pub use sweeper::ExpirySweeper;
