//! The per-stream decoder.
//!
//! One instance owns the decode cursor for one trace stream: the packet
//! parser, the current instruction pointer, queued taken/not-taken decisions,
//! the compressed-return stack and the clock state. Each [StreamDecoder::step]
//! call runs the decoder forward to the next event of interest (an
//! instruction-period boundary, a taken branch, a transaction boundary or a
//! trace begin/end) and returns it as a [DecodeState].
//!
//! "Out of bytes" is not an error: the step reports [StepError::NoData], the
//! cursor keeps all of its progress and the stream is simply left off the
//! ordering heap until new chunks arrive. Decode errors likewise do not kill
//! the stream; the caller may surface them and keep stepping, and the decoder
//! will resynchronise at the next stream boundary packet.

use crate::{
    errors::DecodeErrorKind,
    filter::AddrFilters,
    pt::{
        packets::{Packet, PacketKind},
        parser::{PacketParser, ParserError},
    },
    queue::ByteSource,
    synth::SampleFlags,
    walk::{BranchKind, Walker},
    Bitness, ModuleResolver,
};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Hardware bound on the compressed-return stack depth.
const MAX_COMPRESSED_RETURNS: usize = 64;

/// Context-switch synchronisation state, one per stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchState {
    NotTracing,
    Unknown,
    Tracing,
    /// Decoded up to the switch branch; waiting for the software switch event
    /// naming the next thread.
    ExpectingSwitchEvent,
    /// The switch event arrived early; waiting for the decoder to reach the
    /// switch branch.
    ExpectingSwitchIp,
}

/// One decoded event.
#[derive(Clone, Copy, Debug, Default)]
pub struct DecodeState {
    /// An instruction-period boundary was crossed.
    pub instruction: bool,
    /// A taken branch (or trace begin/end edge).
    pub branch: bool,
    /// A transaction begin/commit/abort.
    pub transaction: bool,
    pub from_ip: u64,
    /// Branch target; zero when there is none.
    pub to_ip: u64,
    pub flags: SampleFlags,
    /// Encoded length of the branch instruction, zero when not a branch.
    pub insn_len: u8,
    /// Authoritative counter value, zero until the first embedded timestamp.
    pub timestamp: u64,
    /// Estimated counter value, advanced by cycle-count packets between
    /// authoritative timestamps.
    pub est_timestamp: u64,
    /// Total instructions retired on this stream so far.
    pub tot_insn_cnt: u64,
}

/// Raised by [StreamDecoder::step].
#[derive(Debug, PartialEq, Eq)]
pub enum StepError {
    /// The stream has no more bytes for now.
    NoData,
    /// A per-event decode problem at (roughly) `ip`.
    Decode { kind: DecodeErrorKind, ip: u64 },
}

/// Collaborators a step needs, owned by the session.
pub struct DecodeCtx<'a> {
    pub source: &'a mut dyn ByteSource,
    pub walker: &'a mut Walker,
    pub resolver: &'a dyn ModuleResolver,
    pub filters: &'a AddrFilters,
}

/// Static per-stream decode parameters.
#[derive(Clone, Copy, Debug)]
pub struct StreamConfig {
    /// Emit an instruction event every this many retired instructions; zero
    /// disables instruction events.
    pub period: u64,
    /// Whether the trace was captured with return compression.
    pub return_compression: bool,
    /// For scaling cycle counts into counter units.
    pub max_non_turbo_ratio: u32,
    pub tsc_ctc_ratio_n: u64,
    pub tsc_ctc_ratio_d: u64,
    pub mtc_freq_bits: u64,
}

/// A branch instruction whose outcome is not yet resolved. Kept across steps
/// so that running out of data mid-resolution never re-walks (and
/// double-counts) the instructions leading up to it.
#[derive(Clone, Copy, Debug)]
struct PendingBranch {
    kind: BranchKind,
    from_ip: u64,
    length: u8,
    /// Direct-branch target, where the encoding gives one.
    direct_target: u64,
}

/// What a packet seek is looking for.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Want {
    /// A taken/not-taken decision.
    Tnt,
    /// A target IP.
    Tip,
    /// Either; used for returns under return compression.
    TntOrTip,
    /// Trace (re-)enable; used while packet generation is off.
    Enable,
}

/// What the seek found.
#[derive(Debug)]
enum Found {
    Tnt,
    Tip(Option<u64>),
    /// Packet generation disabled, with the optional destination.
    Pgd(Option<u64>),
    /// Packet generation enabled at the given address.
    Pge(Option<u64>),
    /// An asynchronous flow update (interrupt-like): source and destination.
    Async { from: u64, to: u64 },
    /// A transaction boundary at `ip` (from the flow update following
    /// MODE.TSX).
    Tsx {
        ip: u64,
        in_tx: bool,
        abort: bool,
    },
    Overflow,
}

pub struct StreamDecoder {
    cfg: StreamConfig,
    parser: PacketParser,
    /// Whether packet generation is currently enabled.
    enabled: bool,
    ip: Option<u64>,
    /// Execution mode, from the trace's own mode reports.
    bitness: Bitness,
    /// Queued taken/not-taken decisions, oldest first.
    tnts: VecDeque<bool>,
    /// Return addresses of calls whose returns may be compressed.
    comprets: VecDeque<u64>,
    pending_branch: Option<PendingBranch>,
    /// Set after a MODE.TSX, applied at the following flow update.
    pending_tsx: Option<(bool, bool)>,
    /// Source of an async flow update awaiting its target IP.
    pending_async_from: Option<u64>,
    /// Resynchronise at the next stream boundary before parsing on.
    pending_sync: bool,
    /// Emit a lost-data error when the current buffer runs out.
    truncated_pending: bool,
    /// Inside a PSB+ status sequence.
    in_psb: bool,
    in_tx: bool,
    timestamp: u64,
    est_timestamp: u64,
    /// Current core-to-bus ratio, for scaling cycle counts.
    cbr: u32,
    last_mtc: Option<u8>,
    period_insn_cnt: u64,
    tot_insn_cnt: u64,
    /// Switch tracking, driven by the session.
    pub switch_state: SwitchState,
    pub next_tid: Option<i32>,
}

impl StreamDecoder {
    pub fn new(cfg: StreamConfig) -> Self {
        Self {
            cfg,
            parser: PacketParser::new(),
            enabled: false,
            ip: None,
            bitness: Bitness::Bits64,
            tnts: VecDeque::new(),
            comprets: VecDeque::new(),
            pending_branch: None,
            pending_tsx: None,
            pending_async_from: None,
            pending_sync: false,
            truncated_pending: false,
            in_psb: false,
            in_tx: false,
            timestamp: 0,
            est_timestamp: 0,
            cbr: 0,
            last_mtc: None,
            period_insn_cnt: 0,
            tot_insn_cnt: 0,
            switch_state: SwitchState::NotTracing,
            next_tid: None,
        }
    }

    /// Run the decoder forward to the next event.
    pub fn step(&mut self, ctx: &mut DecodeCtx) -> Result<DecodeState, StepError> {
        loop {
            if let Some(pending) = self.pending_branch {
                if let Some(state) = self.resolve_branch(ctx, pending)? {
                    return Ok(state);
                }
                continue;
            }

            if !self.enabled {
                if let Some(state) = self.seek_enable(ctx)? {
                    return Ok(state);
                }
                continue;
            }

            let Some(ip) = self.ip else {
                // Enabled but position unknown (after an overflow or a gap):
                // the next flow-update or target-IP packet re-anchors us.
                self.seek_anchor(ctx)?;
                continue;
            };

            // Walk instructions up to the next branch or period boundary.
            let max = if self.cfg.period != 0 {
                self.cfg.period - self.period_insn_cnt
            } else {
                0
            };
            let walk = ctx
                .walker
                .walk(ctx.resolver, ip, None, max, Some(self.bitness))
                .map_err(|e| self.walk_error(e))?;
            self.tot_insn_cnt += walk.insn_cnt;
            self.period_insn_cnt += walk.insn_cnt;

            if walk.branch.kind == BranchKind::None {
                // Stopped at the period boundary.
                self.ip = Some(walk.next_ip);
                if self.cfg.period != 0 && self.period_insn_cnt >= self.cfg.period {
                    self.period_insn_cnt -= self.cfg.period;
                    return Ok(self.mk_state(|s| {
                        s.instruction = true;
                        s.from_ip = walk.next_ip;
                    }));
                }
                continue;
            }

            let pending = PendingBranch {
                kind: walk.branch.kind,
                from_ip: walk.next_ip,
                length: walk.branch.length,
                direct_target: walk.branch.target(walk.next_ip),
            };
            self.ip = Some(walk.next_ip);
            self.pending_branch = Some(pending);

            // A period boundary landing exactly on the branch emits the
            // instruction event first; the branch resolves next step.
            if self.cfg.period != 0 && self.period_insn_cnt >= self.cfg.period {
                self.period_insn_cnt -= self.cfg.period;
                return Ok(self.mk_state(|s| {
                    s.instruction = true;
                    s.from_ip = walk.next_ip;
                }));
            }
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn est_timestamp(&self) -> u64 {
        self.est_timestamp
    }

    fn mk_state(&self, fill: impl FnOnce(&mut DecodeState)) -> DecodeState {
        let mut s = DecodeState {
            timestamp: self.timestamp,
            est_timestamp: self.est_timestamp,
            tot_insn_cnt: self.tot_insn_cnt,
            ..Default::default()
        };
        fill(&mut s);
        if self.in_tx {
            s.flags |= SampleFlags::IN_TX;
        }
        s
    }

    fn walk_error(&mut self, e: crate::walk::WalkError) -> StepError {
        use crate::walk::WalkError;
        let (kind, ip) = match e {
            WalkError::Unmapped(ip) => (DecodeErrorKind::Unmapped, ip),
            WalkError::Unreadable { .. } => {
                (DecodeErrorKind::BadInstruction, self.ip.unwrap_or(0))
            }
            WalkError::BadEncoding(ip) => (DecodeErrorKind::BadInstruction, ip),
        };
        // Cannot continue precisely here; wait for the next re-anchoring
        // packet.
        self.ip = None;
        self.pending_branch = None;
        self.tnts.clear();
        StepError::Decode { kind, ip }
    }

    /// Resolve an unresolved branch, possibly consuming packets. Returns the
    /// event to report, or `None` when decoding should just continue (a
    /// not-taken conditional).
    fn resolve_branch(
        &mut self,
        ctx: &mut DecodeCtx,
        pending: PendingBranch,
    ) -> Result<Option<DecodeState>, StepError> {
        let fallthrough = pending.from_ip + u64::from(pending.length);
        match pending.kind {
            BranchKind::Conditional => {
                if self.tnts.is_empty() {
                    match self.seek(ctx, Want::Tnt)? {
                        Found::Tnt => {}
                        found => return self.branch_interrupted(ctx, pending, found),
                    }
                }
                // A decision must be queued now.
                let Some(taken) = self.tnts.pop_front() else {
                    return Err(self.bad_state(pending.from_ip));
                };
                self.pending_branch = None;
                if taken {
                    self.ip = Some(pending.direct_target);
                    Ok(Some(self.branch_state(
                        pending,
                        pending.direct_target,
                        SampleFlags::BRANCH | SampleFlags::CONDITIONAL,
                    )))
                } else {
                    self.ip = Some(fallthrough);
                    Ok(None)
                }
            }
            BranchKind::Unconditional => {
                self.pending_branch = None;
                self.ip = Some(pending.direct_target);
                Ok(Some(self.branch_state(
                    pending,
                    pending.direct_target,
                    SampleFlags::BRANCH,
                )))
            }
            BranchKind::Call => {
                self.pending_branch = None;
                self.push_compret(fallthrough);
                self.ip = Some(pending.direct_target);
                Ok(Some(self.branch_state(
                    pending,
                    pending.direct_target,
                    SampleFlags::BRANCH | SampleFlags::CALL,
                )))
            }
            BranchKind::IndirectCall => match self.seek(ctx, Want::Tip)? {
                Found::Tip(Some(to)) => {
                    self.pending_branch = None;
                    self.push_compret(fallthrough);
                    self.ip = Some(to);
                    Ok(Some(self.branch_state(
                        pending,
                        to,
                        SampleFlags::BRANCH | SampleFlags::CALL,
                    )))
                }
                Found::Tip(None) => Err(self.bad_state(pending.from_ip)),
                found => self.branch_interrupted(ctx, pending, found),
            },
            BranchKind::Indirect => match self.seek(ctx, Want::Tip)? {
                Found::Tip(Some(to)) => {
                    self.pending_branch = None;
                    self.ip = Some(to);
                    Ok(Some(self.branch_state(pending, to, SampleFlags::BRANCH)))
                }
                Found::Tip(None) => Err(self.bad_state(pending.from_ip)),
                found => self.branch_interrupted(ctx, pending, found),
            },
            BranchKind::Return => {
                // Under return compression a taken-return is encoded as a TNT
                // bit and the target comes from our own call stack.
                if self.cfg.return_compression && !self.tnts.is_empty() {
                    return self.compressed_return(pending);
                }
                let want = if self.cfg.return_compression && !self.comprets.is_empty() {
                    Want::TntOrTip
                } else {
                    Want::Tip
                };
                match self.seek(ctx, want)? {
                    Found::Tnt => self.compressed_return(pending),
                    Found::Tip(Some(to)) => {
                        self.pending_branch = None;
                        self.comprets.pop_back();
                        self.ip = Some(to);
                        Ok(Some(self.branch_state(
                            pending,
                            to,
                            SampleFlags::BRANCH | SampleFlags::RETURN,
                        )))
                    }
                    Found::Tip(None) => Err(self.bad_state(pending.from_ip)),
                    found => self.branch_interrupted(ctx, pending, found),
                }
            }
            BranchKind::None => {
                self.pending_branch = None;
                Ok(None)
            }
        }
    }

    fn compressed_return(
        &mut self,
        pending: PendingBranch,
    ) -> Result<Option<DecodeState>, StepError> {
        let Some(taken) = self.tnts.pop_front() else {
            return Err(self.bad_state(pending.from_ip));
        };
        if !taken {
            // A return never falls through; the decision bits are out of
            // sync with the instruction stream.
            return Err(self.bad_state(pending.from_ip));
        }
        let Some(to) = self.comprets.pop_back() else {
            return Err(self.bad_state(pending.from_ip));
        };
        self.pending_branch = None;
        self.ip = Some(to);
        Ok(Some(self.branch_state(
            pending,
            to,
            SampleFlags::BRANCH | SampleFlags::RETURN,
        )))
    }

    /// An event packet arrived while a branch awaited resolution: handle the
    /// event and keep the branch pending.
    fn branch_interrupted(
        &mut self,
        ctx: &mut DecodeCtx,
        pending: PendingBranch,
        found: Found,
    ) -> Result<Option<DecodeState>, StepError> {
        match found {
            Found::Async { from, to } => {
                // An interrupt fired before the branch retired; execution
                // resumes at the branch once the handler returns, so the
                // pending branch stays queued.
                self.ip = Some(to);
                Ok(Some(self.mk_state(|s| {
                    s.branch = true;
                    s.from_ip = from;
                    s.to_ip = to;
                    s.flags |= SampleFlags::BRANCH | SampleFlags::ASYNC | SampleFlags::INTERRUPT;
                })))
            }
            Found::Tsx { ip, in_tx, abort } => Ok(Some(self.tsx_event(ctx, ip, in_tx, abort)?)),
            Found::Pgd(to) => {
                self.pending_branch = None;
                Ok(self.apply_pgd(ctx, pending.from_ip, to, branch_kind_flags(pending.kind)))
            }
            Found::Pge(_) => Err(self.bad_state(pending.from_ip)),
            Found::Overflow => Err(self.overflow()),
            Found::Tnt | Found::Tip(_) => unreachable!("handled by the caller"),
        }
    }

    fn branch_state(&self, pending: PendingBranch, to: u64, flags: SampleFlags) -> DecodeState {
        self.mk_state(|s| {
            s.branch = true;
            s.from_ip = pending.from_ip;
            s.to_ip = to;
            s.insn_len = pending.length;
            s.flags |= flags;
        })
    }

    fn push_compret(&mut self, ret_addr: u64) {
        if self.comprets.len() == MAX_COMPRESSED_RETURNS {
            self.comprets.pop_front();
        }
        self.comprets.push_back(ret_addr);
    }

    /// Packet generation is off: absorb packets until it comes back on.
    fn seek_enable(&mut self, ctx: &mut DecodeCtx) -> Result<Option<DecodeState>, StepError> {
        match self.seek(ctx, Want::Enable)? {
            Found::Pge(to) => {
                self.enabled = true;
                self.ip = to;
                self.period_insn_cnt = 0;
                debug!(to = ?to, "trace begin");
                Ok(to.map(|to| {
                    self.mk_state(|s| {
                        s.branch = true;
                        s.from_ip = 0;
                        s.to_ip = to;
                        s.flags |= SampleFlags::BRANCH | SampleFlags::TRACE_BEGIN;
                    })
                }))
            }
            Found::Overflow => Err(self.overflow()),
            Found::Tsx { ip, in_tx, abort } => Ok(Some(self.tsx_event(ctx, ip, in_tx, abort)?)),
            // Packets that cannot occur while disabled.
            _ => Err(self.bad_state(0)),
        }
    }

    /// Enabled but with an unknown position: wait for a packet that carries
    /// an IP.
    fn seek_anchor(&mut self, ctx: &mut DecodeCtx) -> Result<(), StepError> {
        match self.seek(ctx, Want::Tip)? {
            Found::Tip(to) => {
                self.ip = to;
                Ok(())
            }
            Found::Async { to, .. } => {
                self.ip = Some(to);
                Ok(())
            }
            Found::Pgd(_) => {
                self.enabled = false;
                Ok(())
            }
            Found::Pge(to) => {
                self.ip = to;
                Ok(())
            }
            Found::Tsx { in_tx, .. } => {
                self.in_tx = in_tx;
                Ok(())
            }
            Found::Tnt => Ok(()),
            Found::Overflow => Err(self.overflow()),
        }
    }

    /// Handle a packet-generation disable: consult the address filters to
    /// decide whether this is a real trace end or just a filter boundary.
    fn apply_pgd(
        &mut self,
        ctx: &DecodeCtx,
        from_ip: u64,
        to: Option<u64>,
        kind_flags: SampleFlags,
    ) -> Option<DecodeState> {
        self.enabled = false;
        self.ip = to;
        if let Some(to_ip) = to {
            if !ctx.filters.is_empty() {
                let (name, offset) = match ctx.resolver.resolve(to_ip) {
                    Some(loc) => (ctx.resolver.module_name(loc.module), loc.offset),
                    None => (None, to_ip),
                };
                if ctx.filters.is_filtered_out(name.as_deref(), offset) {
                    // Expected disable at a filter edge; not a trace end.
                    return None;
                }
            }
        }
        debug!(from_ip, to = ?to, "trace end");
        Some(self.mk_state(|s| {
            s.branch = true;
            s.from_ip = from_ip;
            s.to_ip = to.unwrap_or(0);
            s.flags |= SampleFlags::BRANCH | SampleFlags::TRACE_END | kind_flags;
        }))
    }

    /// Handle a transaction boundary. An abort is encoded as
    /// MODE.TSX + FUP + TIP; the trailing TIP names where execution resumes
    /// after the rollback and must be consumed here, not left for whatever
    /// packet the walk asks for next.
    fn tsx_event(
        &mut self,
        ctx: &mut DecodeCtx,
        ip: u64,
        in_tx: bool,
        abort: bool,
    ) -> Result<DecodeState, StepError> {
        if !abort {
            return Ok(self.apply_tsx(ip, in_tx, false, None));
        }
        match self.seek(ctx, Want::Tip)? {
            Found::Tip(to) => {
                // The rolled-back flow is abandoned, along with any branch
                // still awaiting resolution.
                self.pending_branch = None;
                self.ip = to;
                Ok(self.apply_tsx(ip, in_tx, true, to))
            }
            Found::Overflow => Err(self.overflow()),
            _ => Err(self.bad_state(ip)),
        }
    }

    fn apply_tsx(
        &mut self,
        ip: u64,
        in_tx: bool,
        abort: bool,
        to: Option<u64>,
    ) -> DecodeState {
        let began = !self.in_tx && in_tx;
        self.in_tx = in_tx;
        self.mk_state(|s| {
            s.transaction = true;
            s.from_ip = ip;
            if abort {
                s.flags |= SampleFlags::TX_ABORT;
                if let Some(to) = to {
                    s.branch = true;
                    s.to_ip = to;
                    s.flags |= SampleFlags::BRANCH | SampleFlags::ASYNC;
                }
            } else if began {
                s.flags |= SampleFlags::IN_TX;
            }
        })
    }

    fn overflow(&mut self) -> StepError {
        let ip = self.ip.unwrap_or(0);
        self.enabled = false;
        self.ip = None;
        self.tnts.clear();
        self.comprets.clear();
        self.pending_branch = None;
        self.pending_tsx = None;
        self.pending_async_from = None;
        self.in_tx = false;
        // Packets were dropped; trust nothing until the next boundary.
        self.pending_sync = true;
        StepError::Decode {
            kind: DecodeErrorKind::Overflow,
            ip,
        }
    }

    fn bad_state(&mut self, ip: u64) -> StepError {
        self.ip = None;
        self.pending_branch = None;
        self.tnts.clear();
        self.pending_sync = true;
        StepError::Decode {
            kind: DecodeErrorKind::BadState,
            ip,
        }
    }

    /// Consume packets until one matching `want` (or an event that preempts
    /// it) turns up. Clock, mode and status packets are absorbed along the
    /// way.
    fn seek(&mut self, ctx: &mut DecodeCtx, want: Want) -> Result<Found, StepError> {
        loop {
            let pkt = self.fetch_packet(ctx)?;
            trace!(kind = ?pkt.kind(), "packet");
            match pkt.kind() {
                PacketKind::PAD | PacketKind::EXSTOP | PacketKind::VMCS => {}
                PacketKind::PSB => {
                    self.in_psb = true;
                }
                PacketKind::PSBEND => {
                    self.in_psb = false;
                    // A PSB+ flow update means tracing was already on when
                    // the boundary was emitted; report it as the enable.
                    if want == Want::Enable && self.enabled {
                        return Ok(Found::Pge(self.ip));
                    }
                }
                PacketKind::TSC => {
                    if let Packet::TSC(p) = &pkt {
                        self.apply_tsc(p.tsc());
                    }
                }
                PacketKind::MTC => {
                    if let Packet::MTC(p) = &pkt {
                        self.apply_mtc(p.ctc());
                    }
                }
                PacketKind::CYC => {
                    if let Packet::CYC(p) = &pkt {
                        self.apply_cyc(p.cycles());
                    }
                }
                PacketKind::CBR => {
                    if let Packet::CBR(p) = &pkt {
                        self.cbr = u32::from(p.ratio());
                    }
                }
                PacketKind::MODEExec => {
                    if let Packet::MODEExec(p) = &pkt {
                        self.bitness = p.bitness();
                    }
                }
                PacketKind::MODETSX => {
                    if let Packet::MODETSX(p) = &pkt {
                        self.pending_tsx = Some((p.in_tx(), p.tx_abort()));
                    }
                }
                PacketKind::ShortTNT | PacketKind::LongTNT => {
                    if let Some(bits) = pkt.tnts() {
                        self.tnts.extend(bits);
                    }
                    if matches!(want, Want::Tnt | Want::TntOrTip) {
                        return Ok(Found::Tnt);
                    }
                }
                PacketKind::FUP => {
                    let fup_ip = pkt.target_ip();
                    if self.in_psb {
                        // Status only: PSB+ reports where tracing currently
                        // is. It also tells us tracing is on.
                        if self.ip.is_none() {
                            self.ip = fup_ip;
                        }
                        self.enabled = true;
                    } else if let Some((in_tx, abort)) = self.pending_tsx.take() {
                        if let Some(ip) = fup_ip {
                            return Ok(Found::Tsx { ip, in_tx, abort });
                        }
                    } else if let Some(from) = fup_ip {
                        // An async event: the next TIP names its target.
                        self.pending_async_from = Some(from);
                    }
                }
                PacketKind::TIP => {
                    let to = pkt.target_ip();
                    if let Some(from) = self.pending_async_from.take() {
                        if let Some(to) = to {
                            return Ok(Found::Async { from, to });
                        }
                        continue;
                    }
                    if matches!(want, Want::Tip | Want::TntOrTip) {
                        return Ok(Found::Tip(to));
                    }
                    // A TIP nobody asked for: the stream disagrees with the
                    // instruction walk.
                    return Err(self.bad_state(to.unwrap_or(0)));
                }
                PacketKind::TIPPGE => {
                    return Ok(Found::Pge(pkt.target_ip()));
                }
                PacketKind::TIPPGD => {
                    return Ok(Found::Pgd(pkt.target_ip()));
                }
                PacketKind::OVF => {
                    return Ok(Found::Overflow);
                }
            }
        }
    }

    /// Pull the next packet, refilling from the byte source as needed.
    fn fetch_packet(&mut self, ctx: &mut DecodeCtx) -> Result<Packet, StepError> {
        loop {
            if self.pending_sync && self.parser.sync_to_psb() {
                self.pending_sync = false;
            }
            if !self.pending_sync {
                match self.parser.next_packet() {
                    Ok(pkt) => return Ok(pkt),
                    Err(ParserError::NoMoreBytes) => {}
                    Err(ParserError::BadPacket { off }) => {
                        debug!(off, "unrecognised packet byte");
                        self.pending_sync = true;
                        return Err(StepError::Decode {
                            kind: DecodeErrorKind::BadPacket,
                            ip: self.ip.unwrap_or(0),
                        });
                    }
                }
            }

            // Buffer exhausted.
            if self.truncated_pending {
                self.truncated_pending = false;
                return Err(StepError::Decode {
                    kind: DecodeErrorKind::Lost,
                    ip: self.ip.unwrap_or(0),
                });
            }
            let supply = match ctx.source.next_bytes() {
                Ok(Some(supply)) => supply,
                Ok(None) => return Err(StepError::NoData),
                Err(_) => {
                    return Err(StepError::Decode {
                        kind: DecodeErrorKind::Lost,
                        ip: self.ip.unwrap_or(0),
                    })
                }
            };
            if supply.data.is_empty() {
                // Overwritten ring data: a hole in the stream.
                self.on_gap();
                return Err(StepError::Decode {
                    kind: DecodeErrorKind::Lost,
                    ip: self.ip.unwrap_or(0),
                });
            }
            self.truncated_pending = supply.truncated;
            let consecutive = supply.consecutive;
            self.parser.refill(supply.data, consecutive);
            if !consecutive {
                self.on_gap();
            }
        }
    }

    /// The byte stream has a discontinuity: inter-packet state is void and
    /// decoding restarts at the next stream boundary.
    fn on_gap(&mut self) {
        self.enabled = false;
        self.ip = None;
        self.tnts.clear();
        self.comprets.clear();
        self.pending_branch = None;
        self.pending_tsx = None;
        self.pending_async_from = None;
        self.in_psb = false;
        self.pending_sync = true;
    }

    fn apply_tsc(&mut self, low56: u64) {
        const MASK: u64 = (1 << 56) - 1;
        let mut tsc = (self.timestamp & !MASK) | low56;
        // The packet carries only the low 56 bits; detect wraparound.
        if tsc < self.timestamp && self.timestamp - tsc > (MASK >> 1) {
            tsc += 1 << 56;
        }
        self.timestamp = tsc.max(self.timestamp);
        self.est_timestamp = self.est_timestamp.max(self.timestamp);
        self.last_mtc = None;
        trace!(tsc = self.timestamp, "timestamp update");
    }

    fn apply_mtc(&mut self, ctc: u8) {
        if let Some(last) = self.last_mtc {
            let delta = u64::from(ctc.wrapping_sub(last));
            let ticks = delta << self.cfg.mtc_freq_bits;
            let scaled = if self.cfg.tsc_ctc_ratio_d != 0 {
                ticks * self.cfg.tsc_ctc_ratio_n / self.cfg.tsc_ctc_ratio_d
            } else {
                ticks
            };
            self.est_timestamp += scaled;
        }
        self.last_mtc = Some(ctc);
    }

    fn apply_cyc(&mut self, cycles: u64) {
        // Cycles tick at core frequency; scale to counter units via the
        // current core-to-bus ratio.
        let scaled = if self.cbr != 0 && self.cfg.max_non_turbo_ratio != 0 {
            cycles * u64::from(self.cfg.max_non_turbo_ratio) / u64::from(self.cbr)
        } else {
            cycles
        };
        self.est_timestamp += scaled;
    }
}

fn branch_kind_flags(kind: BranchKind) -> SampleFlags {
    match kind {
        BranchKind::Call | BranchKind::IndirectCall => SampleFlags::CALL,
        BranchKind::Return => SampleFlags::RETURN,
        BranchKind::Conditional => SampleFlags::CONDITIONAL,
        _ => SampleFlags::default(),
    }
}
