//! Delivering records and draining the local buffer.
//!
//! The [`FlushCoordinator`] owns both ends of the delivery path: the remote
//! [`Sink`] and the [`BufferStore`]. Fresh records go straight to the sink and
//! fall back to the buffer; buffered records are resent as one batch and only
//! leave the buffer once that batch was accepted in full.

use tracing::{debug, info, warn};

use fieldlog_core::{Record, Sink};
use fieldlog_store::BufferStore;

/// Result of one [`FlushCoordinator::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered; the sink was not contacted.
    Empty,
    /// This many buffered records were delivered and removed from the buffer.
    Delivered(usize),
    /// The sink refused the batch; the buffer is unchanged.
    Deferred,
}

/// What happened to a fresh record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted by the sink.
    Sent,
    /// Sink write failed; the record is in the buffer.
    Buffered,
}

/// Owns the sink and the buffer and moves records between them.
#[derive(Debug)]
pub struct FlushCoordinator<S> {
    sink: S,
    buffer: BufferStore,
}

impl<S: Sink> FlushCoordinator<S> {
    pub fn new(sink: S, buffer: BufferStore) -> Self {
        Self { sink, buffer }
    }

    /// The sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// The buffer.
    pub fn buffer(&self) -> &BufferStore {
        &self.buffer
    }

    /// Number of buffered lines.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Try to deliver everything in the buffer as one batch.
    ///
    /// # Errors
    ///
    /// Only buffer I/O errors are returned. A sink failure is an ordinary
    /// [`FlushOutcome::Deferred`].
    pub async fn flush(&mut self) -> fieldlog_store::Result<FlushOutcome> {
        if self.buffer.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        let snapshot = self.buffer.snapshot()?;
        if snapshot.records().is_empty() {
            // Only unreadable lines left; committing moves them aside.
            self.buffer.commit(&snapshot)?;
            return Ok(FlushOutcome::Empty);
        }

        match self.sink.write_batch(snapshot.records()).await {
            Ok(()) => {
                self.buffer.commit(&snapshot)?;
                info!(
                    "Delivered {} buffered record(s), {} still pending",
                    snapshot.len(),
                    self.buffer.len()
                );
                Ok(FlushOutcome::Delivered(snapshot.len()))
            }
            Err(e) => {
                debug!(
                    "Flush of {} buffered record(s) deferred: {}",
                    snapshot.len(),
                    e
                );
                Ok(FlushOutcome::Deferred)
            }
        }
    }

    /// Send one record, buffering it if the sink refuses.
    ///
    /// # Errors
    ///
    /// Returns an error only if the record could not be buffered either.
    pub async fn write_or_buffer(&mut self, record: &Record) -> fieldlog_store::Result<Delivery> {
        match self.sink.write(record).await {
            Ok(()) => Ok(Delivery::Sent),
            Err(e) => {
                self.buffer.append(record)?;
                warn!(
                    "Write failed, buffered {} record ({} pending): {}",
                    record.measurement(),
                    self.buffer.len(),
                    e
                );
                Ok(Delivery::Buffered)
            }
        }
    }

    /// Close the sink and sync the buffer.
    pub async fn close(self) -> fieldlog_store::Result<()> {
        self.sink.close().await;
        self.buffer.close()
    }
}
