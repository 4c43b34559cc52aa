//! ptsynth: hardware instruction-trace decoding and event synthesis.
//!
//! This crate turns a raw, out-of-band execution trace (Intel PT packet
//! streams captured per CPU or per thread alongside ordinary samples) into a
//! globally time-ordered sequence of synthetic sample events: instructions
//! retired, branches taken and transactional-memory regions. Downstream
//! analysis consumes these exactly like regular profiler samples.
//!
//! The pipeline, bottom up:
//!
//!  - [pt]: packet-level parsing of the raw byte stream.
//!  - [walk]: live disassembly between branch packets, backed by bounded
//!    per-module caches ([cache]).
//!  - [stream]: one decode cursor per trace stream, producing classified
//!    decode states and tracking context-switch synchronisation.
//!  - [queue]: raw chunk bookkeeping, including snapshot-mode overlap trims.
//!  - [heap]: a min-heap interleaving the per-stream decoders into one
//!    non-decreasing global timestamp order.
//!  - [synth]: turning decode states into sample records for a sink.
//!  - [session]: the integration shim driving all of the above.
//!
//! Symbol resolution, module data access and thread bookkeeping are owned by
//! the surrounding profiler and injected through the traits below.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]
#![allow(clippy::upper_case_acronyms)]

pub mod cache;
pub mod clock;
pub mod errors;
pub mod filter;
pub mod heap;
pub mod info;
pub mod pt;
pub mod queue;
pub mod session;
pub mod stream;
pub mod synth;
pub mod walk;

pub use errors::{DecodeErrorKind, Error, SinkError};
pub use session::{Session, SessionConfig, SessionEvent};
pub use synth::{ErrorRecord, EventSink, SampleRecord, SynthConfig};

/// Identifies one loaded module (executable or shared object) to the
/// resolver. Stable for the lifetime of the mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u64);

/// Address width of a module's code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Bitness {
    Bits16,
    Bits32,
    Bits64,
}

/// The result of resolving an instruction pointer.
#[derive(Clone, Copy, Debug)]
pub struct Location {
    pub module: ModuleId,
    /// Byte offset of the resolved address within the module.
    pub offset: u64,
    /// Virtual address one past the end of the mapping the address fell in.
    /// Walking beyond this point requires a fresh resolution.
    pub map_end: u64,
    pub bitness: Bitness,
}

/// Address-space knowledge owned by the surrounding profiler.
pub trait ModuleResolver {
    /// Resolve a virtual address to a module and offset, or `None` if the
    /// address is not mapped.
    fn resolve(&self, ip: u64) -> Option<Location>;

    /// Read instruction bytes at a module offset into `buf`, returning the
    /// number of bytes produced. Zero means the range is unreadable.
    fn read(&self, module: ModuleId, offset: u64, buf: &mut [u8]) -> usize;

    /// The module's on-disk data size, used to size its disassembly cache.
    fn data_size(&self, module: ModuleId) -> u64;

    /// The module's name as it appears in address-filter specifications, if
    /// any.
    fn module_name(&self, module: ModuleId) -> Option<String>;
}

/// Per-CPU current-thread bookkeeping, updated as context switches are
/// decoded and consulted when attributing stream events.
pub trait ThreadMap {
    fn current_tid(&self, cpu: u32) -> Option<i32>;
    fn set_current_tid(&mut self, cpu: u32, pid: i32, tid: i32);
    /// The process id a thread belongs to, if known.
    fn pid_of(&self, tid: i32) -> Option<i32>;
}

/// Call/return stack reconstruction, used to attach call-chains to
/// synthesized samples.
pub trait CallStack {
    /// Feed one decoded branch into the stack model.
    fn on_branch(&mut self, tid: i32, flags: synth::SampleFlags, from_ip: u64, to_ip: u64, insn_len: u8);
    /// Copy the current chain for `tid` (innermost frame first, starting at
    /// `ip`) into `out`, at most `max_depth` entries.
    fn sample(&mut self, tid: i32, max_depth: usize, ip: u64, out: &mut Vec<u64>);
}
