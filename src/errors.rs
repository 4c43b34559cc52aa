//! Error types.
//!
//! Three categories exist, mirroring how errors behave at runtime:
//!
//!  - [Error]: setup-fatal or delivery failures, reported to the caller of the
//!    session-level entry points. Nothing is left half-initialised.
//!  - [DecodeErrorKind]: per-event decode problems. These never abort decoding
//!    of a stream; they are (optionally) surfaced as synthetic error records
//!    and decoding resumes from the next recoverable packet boundary.
//!  - "no data for now", which is not an error at all and is represented by a
//!    crate-internal sentinel in the decode loop.

use strum_macros::Display;
use thiserror::Error;

/// Errors reported by the session-level operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The trace-info descriptor is malformed. Setup-fatal: the session is not
    /// constructed and no stream queues exist.
    #[error("malformed trace info: {0}")]
    BadTraceInfo(String),
    /// Invalid configuration.
    #[error("bad configuration: {0}")]
    BadConfig(String),
    /// The backing trace store could not produce a chunk's bytes.
    #[error("failed to read trace data: offset {offset:#x}, size {size:#x}")]
    TraceData { offset: u64, size: u64 },
    /// The event sink rejected a synthesized record. Internal decode state is
    /// unaffected, so the caller may retry or abort.
    #[error("failed to deliver synthesized event: {0}")]
    Delivery(#[from] SinkError),
}

/// An error returned by an [crate::synth::EventSink] implementation.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SinkError(pub String);

/// Per-event decode error codes, as carried by synthetic error records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum DecodeErrorKind {
    /// The hardware trace buffer overflowed and packets were dropped.
    #[strum(serialize = "trace buffer overflow")]
    Overflow,
    /// A packet could not be recognised at the current stream position.
    #[strum(serialize = "failed to recognise packet")]
    BadPacket,
    /// Instruction bytes could not be fetched or decoded.
    #[strum(serialize = "failed to get instruction")]
    BadInstruction,
    /// An instruction pointer did not resolve to any module.
    #[strum(serialize = "address not mapped")]
    Unmapped,
    /// Raw trace data was lost (truncated notification or unreadable store).
    #[strum(serialize = "lost trace data")]
    Lost,
    /// The packet stream contradicted itself (e.g. a consumed branch decision
    /// that was never supplied).
    #[strum(serialize = "trace internally inconsistent")]
    BadState,
}
