//! Event synthesis.
//!
//! Decode states are turned into sample records here: the initial-skip
//! counter, the branch-type filter mask and the per-record field assembly
//! (event id, attribution, optional call-chain and last-branch stack) all
//! live in [Synth]. Period-based instruction sampling is driven by the stream
//! decoder, which bounds its walks so that an instruction state surfaces at
//! every period boundary.

use crate::errors::{DecodeErrorKind, SinkError};
use std::ops::{BitOr, BitOrAssign};
use tracing::debug;

/// Flags describing a branch or sample, combinable with `|`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SampleFlags(pub u32);

impl SampleFlags {
    pub const BRANCH: SampleFlags = SampleFlags(1 << 0);
    pub const CALL: SampleFlags = SampleFlags(1 << 1);
    pub const RETURN: SampleFlags = SampleFlags(1 << 2);
    pub const CONDITIONAL: SampleFlags = SampleFlags(1 << 3);
    /// The transfer was asynchronous (interrupt-like).
    pub const ASYNC: SampleFlags = SampleFlags(1 << 4);
    pub const INTERRUPT: SampleFlags = SampleFlags(1 << 5);
    pub const TX_ABORT: SampleFlags = SampleFlags(1 << 6);
    pub const TRACE_BEGIN: SampleFlags = SampleFlags(1 << 7);
    pub const TRACE_END: SampleFlags = SampleFlags(1 << 8);
    pub const IN_TX: SampleFlags = SampleFlags(1 << 9);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: SampleFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: SampleFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for SampleFlags {
    type Output = SampleFlags;

    fn bitor(self, rhs: SampleFlags) -> SampleFlags {
        SampleFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for SampleFlags {
    fn bitor_assign(&mut self, rhs: SampleFlags) {
        self.0 |= rhs.0;
    }
}

/// What to synthesize and how.
#[derive(Clone, Debug)]
pub struct SynthConfig {
    /// Synthesize instruction samples every `period` retired instructions.
    pub instructions: bool,
    pub period: u64,
    /// Synthesize one sample per decoded branch.
    pub branches: bool,
    /// Synthesize transaction begin/commit/abort samples.
    pub transactions: bool,
    /// Surface per-event decode errors as error records.
    pub errors: bool,
    /// Restrict branch samples to calls (plus trace edges).
    pub calls: bool,
    /// Restrict branch samples to returns (plus trace edges).
    pub returns: bool,
    pub callchain: bool,
    pub callchain_sz: usize,
    pub last_branch: bool,
    pub last_branch_sz: usize,
    /// Drop this many synthesized samples before emitting any.
    pub initial_skip: u64,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            instructions: true,
            period: 100_000,
            branches: true,
            transactions: true,
            errors: true,
            calls: false,
            returns: false,
            callchain: false,
            callchain_sz: 16,
            last_branch: false,
            last_branch_sz: 64,
            initial_skip: 0,
        }
    }
}

/// The three synthetic event types, registered once per session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventIds {
    pub instructions: u64,
    pub branches: u64,
    pub transactions: u64,
}

/// One entry of a last-branch stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BranchEntry {
    pub from: u64,
    pub to: u64,
    pub flags: SampleFlags,
}

/// Fixed-size circular buffer of recent branches.
#[derive(Clone, Debug)]
pub struct LastBranchRb {
    entries: Vec<BranchEntry>,
    /// Next slot to overwrite once the buffer is full.
    pos: usize,
    cap: usize,
}

impl LastBranchRb {
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.max(1);
        Self {
            entries: Vec::with_capacity(cap),
            pos: 0,
            cap,
        }
    }

    pub fn push(&mut self, from: u64, to: u64, flags: SampleFlags) {
        let e = BranchEntry { from, to, flags };
        if self.entries.len() < self.cap {
            self.entries.push(e);
        } else {
            self.entries[self.pos] = e;
        }
        self.pos = (self.pos + 1) % self.cap;
    }

    /// Copy the entries out, oldest first.
    pub fn copy_out(&self) -> Vec<BranchEntry> {
        let mut out = Vec::with_capacity(self.entries.len());
        if self.entries.len() < self.cap {
            out.extend_from_slice(&self.entries);
        } else {
            out.extend_from_slice(&self.entries[self.pos..]);
            out.extend_from_slice(&self.entries[..self.pos]);
        }
        out
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.pos = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A synthesized sample.
#[derive(Clone, Debug)]
pub struct SampleRecord {
    /// Which synthetic event type this record belongs to.
    pub id: u64,
    pub ip: u64,
    /// Branch target, zero when not applicable.
    pub addr: u64,
    pub pid: i32,
    pub tid: i32,
    /// Wall-clock time; `None` in timeless decoding.
    pub time: Option<u64>,
    pub cpu: Option<u32>,
    pub period: u64,
    pub flags: SampleFlags,
    pub insn_len: u8,
    pub callchain: Option<Vec<u64>>,
    pub branch_stack: Option<Vec<BranchEntry>>,
}

/// A synthesized decode-error report.
#[derive(Clone, Debug)]
pub struct ErrorRecord {
    pub kind: DecodeErrorKind,
    pub cpu: Option<u32>,
    pub pid: i32,
    pub tid: i32,
    pub ip: u64,
    pub msg: String,
}

/// Receives synthesized records. Owned by the surrounding profiler.
pub trait EventSink {
    fn deliver_sample(&mut self, sample: SampleRecord) -> Result<(), SinkError>;
    fn deliver_error(&mut self, error: ErrorRecord) -> Result<(), SinkError>;
}

/// Attribution attached to every record synthesized from one decode state.
#[derive(Clone, Copy, Debug)]
pub struct Attrib {
    pub pid: i32,
    pub tid: i32,
    pub cpu: Option<u32>,
    pub time: Option<u64>,
}

pub struct Synth {
    cfg: SynthConfig,
    ids: EventIds,
    /// Branch samples must intersect this mask; empty means no filtering.
    branches_filter: SampleFlags,
    /// Samples synthesized so far, for the initial-skip gate.
    num_events: u64,
}

impl Synth {
    pub fn new(cfg: SynthConfig) -> Self {
        let mut branches_filter = SampleFlags::default();
        if cfg.calls {
            branches_filter |= SampleFlags::CALL
                | SampleFlags::ASYNC
                | SampleFlags::TRACE_BEGIN
                | SampleFlags::TRACE_END;
        }
        if cfg.returns {
            branches_filter |=
                SampleFlags::RETURN | SampleFlags::TRACE_BEGIN | SampleFlags::TRACE_END;
        }
        Self {
            cfg,
            ids: EventIds {
                instructions: 1,
                branches: 2,
                transactions: 3,
            },
            branches_filter,
            num_events: 0,
        }
    }

    pub fn config(&self) -> &SynthConfig {
        &self.cfg
    }

    pub fn ids(&self) -> EventIds {
        self.ids
    }

    pub fn branch_passes_filter(&self, flags: SampleFlags) -> bool {
        self.branches_filter.is_empty() || flags.intersects(self.branches_filter)
    }

    /// The initial-skip gate. Counts every would-be sample; true while still
    /// inside the skip window.
    fn skip(&mut self) -> bool {
        let n = self.num_events;
        self.num_events += 1;
        n < self.cfg.initial_skip
    }

    pub fn synth_instruction(
        &mut self,
        sink: &mut dyn EventSink,
        at: Attrib,
        ip: u64,
        period: u64,
        in_tx: bool,
        last_branch: Option<&LastBranchRb>,
        callchain: Option<Vec<u64>>,
    ) -> Result<(), SinkError> {
        if self.skip() {
            return Ok(());
        }
        let mut flags = SampleFlags::default();
        if in_tx {
            flags |= SampleFlags::IN_TX;
        }
        sink.deliver_sample(SampleRecord {
            id: self.ids.instructions,
            ip,
            addr: 0,
            pid: at.pid,
            tid: at.tid,
            time: at.time,
            cpu: at.cpu,
            period,
            flags,
            insn_len: 0,
            callchain,
            branch_stack: last_branch.map(LastBranchRb::copy_out),
        })
    }

    pub fn synth_branch(
        &mut self,
        sink: &mut dyn EventSink,
        at: Attrib,
        from_ip: u64,
        to_ip: u64,
        flags: SampleFlags,
        insn_len: u8,
        callchain: Option<Vec<u64>>,
    ) -> Result<(), SinkError> {
        if !self.branch_passes_filter(flags) {
            return Ok(());
        }
        if self.skip() {
            return Ok(());
        }
        sink.deliver_sample(SampleRecord {
            id: self.ids.branches,
            ip: from_ip,
            addr: to_ip,
            pid: at.pid,
            tid: at.tid,
            time: at.time,
            cpu: at.cpu,
            period: 1,
            flags,
            insn_len,
            callchain,
            branch_stack: None,
        })
    }

    pub fn synth_transaction(
        &mut self,
        sink: &mut dyn EventSink,
        at: Attrib,
        ip: u64,
        flags: SampleFlags,
        last_branch: Option<&LastBranchRb>,
        callchain: Option<Vec<u64>>,
    ) -> Result<(), SinkError> {
        if self.skip() {
            return Ok(());
        }
        sink.deliver_sample(SampleRecord {
            id: self.ids.transactions,
            ip,
            addr: 0,
            pid: at.pid,
            tid: at.tid,
            time: at.time,
            cpu: at.cpu,
            period: 1,
            flags,
            insn_len: 0,
            callchain,
            branch_stack: last_branch.map(LastBranchRb::copy_out),
        })
    }

    /// Synthesize a decode-error report, if error reporting was requested.
    pub fn synth_error(
        &mut self,
        sink: &mut dyn EventSink,
        kind: DecodeErrorKind,
        at: Attrib,
        ip: u64,
    ) -> Result<(), SinkError> {
        if !self.cfg.errors {
            return Ok(());
        }
        debug!(%kind, ip, tid = at.tid, "synthesizing decode error");
        sink.deliver_error(ErrorRecord {
            kind,
            cpu: at.cpu,
            pid: at.pid,
            tid: at.tid,
            ip,
            msg: kind.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Attrib, ErrorRecord, EventSink, LastBranchRb, SampleFlags, SampleRecord, Synth,
        SynthConfig,
    };
    use crate::errors::{DecodeErrorKind, SinkError};

    #[derive(Default)]
    struct RecordingSink {
        samples: Vec<SampleRecord>,
        errors: Vec<ErrorRecord>,
    }

    impl EventSink for RecordingSink {
        fn deliver_sample(&mut self, sample: SampleRecord) -> Result<(), SinkError> {
            self.samples.push(sample);
            Ok(())
        }

        fn deliver_error(&mut self, error: ErrorRecord) -> Result<(), SinkError> {
            self.errors.push(error);
            Ok(())
        }
    }

    fn at() -> Attrib {
        Attrib {
            pid: 100,
            tid: 101,
            cpu: Some(0),
            time: Some(42),
        }
    }

    #[test]
    fn calls_preset_filters_branches() {
        let synth = Synth::new(SynthConfig {
            calls: true,
            ..Default::default()
        });
        assert!(synth.branch_passes_filter(SampleFlags::BRANCH | SampleFlags::CALL));
        assert!(synth.branch_passes_filter(SampleFlags::TRACE_END));
        assert!(!synth.branch_passes_filter(SampleFlags::BRANCH | SampleFlags::CONDITIONAL));
        assert!(!synth.branch_passes_filter(SampleFlags::BRANCH | SampleFlags::RETURN));
    }

    #[test]
    fn no_preset_passes_everything() {
        let synth = Synth::new(SynthConfig::default());
        assert!(synth.branch_passes_filter(SampleFlags::BRANCH | SampleFlags::CONDITIONAL));
        assert!(synth.branch_passes_filter(SampleFlags::default()));
    }

    #[test]
    fn initial_skip_drops_the_first_events() {
        let mut synth = Synth::new(SynthConfig {
            initial_skip: 2,
            ..Default::default()
        });
        let mut sink = RecordingSink::default();
        for i in 0..5u64 {
            synth
                .synth_branch(
                    &mut sink,
                    at(),
                    0x1000 + i,
                    0x2000,
                    SampleFlags::BRANCH,
                    2,
                    None,
                )
                .unwrap();
        }
        assert_eq!(sink.samples.len(), 3);
        assert_eq!(sink.samples[0].ip, 0x1002);
    }

    #[test]
    fn error_records_respect_config() {
        let mut sink = RecordingSink::default();

        let mut synth = Synth::new(SynthConfig {
            errors: false,
            ..Default::default()
        });
        synth
            .synth_error(&mut sink, DecodeErrorKind::Overflow, at(), 0x1234)
            .unwrap();
        assert!(sink.errors.is_empty());

        let mut synth = Synth::new(SynthConfig::default());
        synth
            .synth_error(&mut sink, DecodeErrorKind::Overflow, at(), 0x1234)
            .unwrap();
        assert_eq!(sink.errors.len(), 1);
        assert_eq!(sink.errors[0].ip, 0x1234);
        assert_eq!(sink.errors[0].msg, "trace buffer overflow");
    }

    #[test]
    fn last_branch_rb_is_chronological() {
        let mut rb = LastBranchRb::new(3);
        assert!(rb.is_empty());
        rb.push(1, 2, SampleFlags::BRANCH);
        rb.push(3, 4, SampleFlags::BRANCH);
        let out = rb.copy_out();
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].from, out[1].from), (1, 3));

        // Overflow evicts the oldest.
        rb.push(5, 6, SampleFlags::BRANCH);
        rb.push(7, 8, SampleFlags::BRANCH);
        let out = rb.copy_out();
        assert_eq!(
            out.iter().map(|e| e.from).collect::<Vec<_>>(),
            vec![3, 5, 7]
        );

        rb.reset();
        assert!(rb.is_empty());
        assert!(rb.copy_out().is_empty());
    }

    #[test]
    fn instruction_sample_carries_branch_stack() {
        let mut synth = Synth::new(SynthConfig::default());
        let mut sink = RecordingSink::default();
        let mut rb = LastBranchRb::new(4);
        rb.push(0xa, 0xb, SampleFlags::BRANCH);
        synth
            .synth_instruction(&mut sink, at(), 0x1000, 100, true, Some(&rb), None)
            .unwrap();
        let s = &sink.samples[0];
        assert_eq!(s.period, 100);
        assert!(s.flags.contains(SampleFlags::IN_TX));
        assert_eq!(s.branch_stack.as_ref().unwrap().len(), 1);
    }
}
