//! Durable local buffer for records the store could not accept.
//!
//! The buffer is a newline-delimited file of InfluxDB line protocol, one
//! record per line, in arrival order. It is owned by a single collector
//! process; concurrent writers from other processes are not supported.
//!
//! # Guarantees
//!
//! - [`BufferStore::append`] syncs the full line before returning
//! - [`BufferStore::snapshot`] never modifies the file
//! - [`BufferStore::commit`] removes exactly the lines of the given snapshot,
//!   never records appended after it, and never truncates unconditionally
//! - A crash mid-append leaves at most a partial trailing line, which is
//!   discarded on the next [`BufferStore::open`]
//!
//! # Example
//!
//! ```no_run
//! use fieldlog_store::{BufferStore, default_buffer_path};
//!
//! let mut buffer = BufferStore::open(default_buffer_path())?;
//!
//! let snapshot = buffer.snapshot()?;
//! // ... deliver snapshot.records() ...
//! buffer.commit(&snapshot)?;
//! # Ok::<(), fieldlog_store::Error>(())
//! ```

mod error;
mod snapshot;
mod store;

pub use error::{Error, Result};
pub use snapshot::{BufferStats, RejectedLine, Snapshot};
pub use store::BufferStore;

/// File name of the buffer inside the data directory.
pub const DEFAULT_BUFFER_FILE: &str = "buffer.lp";

/// Default buffer path following platform conventions.
///
/// - Linux: `~/.local/share/fieldlog/buffer.lp`
/// - macOS: `~/Library/Application Support/fieldlog/buffer.lp`
/// - Windows: `C:\Users\<user>\AppData\Local\fieldlog\buffer.lp`
pub fn default_buffer_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("fieldlog")
        .join(DEFAULT_BUFFER_FILE)
}
