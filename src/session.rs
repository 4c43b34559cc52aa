//! The decode session: everything wired together.
//!
//! A session owns one stream decoder per trace stream (per CPU, or per thread
//! when the trace was captured into a global buffer), the chunk queues feeding
//! them and the ordering heap that interleaves their output. The surrounding
//! profiler drives it with trace-data notifications ([Session::add_chunk]) and
//! ordinary event-stream positions ([Session::process_event]); synthesized
//! samples come out through the injected [EventSink] in non-decreasing
//! timestamp order.
//!
//! When the trace carries no timestamps at all, ordering is impossible and the
//! session falls back to timeless decoding: each stream is drained in full
//! when its thread exits, and samples carry no time.

use crate::{
    clock::ClockConverter,
    errors::Error,
    heap::OrderingHeap,
    info::TraceInfo,
    queue::{ByteSource, ChunkDesc, ChunkQueue, Supply, TraceStore},
    stream::{DecodeCtx, DecodeState, StepError, StreamConfig, StreamDecoder, SwitchState},
    synth::{Attrib, EventSink, LastBranchRb, SampleFlags, Synth, SynthConfig},
    walk::Walker,
    CallStack, ModuleId, ModuleResolver, ThreadMap,
};
use std::collections::HashMap;
use tracing::debug;

/// Session-level knobs supplied by the surrounding profiler.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub synth: SynthConfig,
    /// Lowest kernel virtual address; `u64::MAX` when unknown.
    pub kernel_start: u64,
    /// Address of the scheduler's context-switch routine, enabling switch
    /// synchronisation when software switch events accompany the trace.
    pub switch_ip: Option<u64>,
    /// Address at which tracing resumes inside the switch routine.
    pub ptss_ip: Option<u64>,
    /// Disassembly-cache sizing divisor.
    pub cache_divisor: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            synth: SynthConfig::default(),
            kernel_start: u64::MAX,
            switch_ip: None,
            ptss_ip: None,
            cache_divisor: crate::cache::DEFAULT_CACHE_DIVISOR,
        }
    }
}

/// Positions in the surrounding profiler's ordinary event stream.
#[derive(Clone, Copy, Debug)]
pub enum SessionEvent {
    /// Any timestamped event: trace decode is allowed to catch up to it.
    Other { time: u64 },
    /// A software context-switch notification.
    Switch {
        cpu: Option<u32>,
        pid: i32,
        tid: i32,
        time: u64,
    },
    /// A thread exited.
    Exit { pid: i32, tid: i32, time: u64 },
}

/// Streams are keyed by CPU for per-CPU traces and by thread otherwise.
type QueueKey = (Option<u32>, Option<i32>);

struct StreamQueue {
    nr: u32,
    cpu: Option<u32>,
    pid: i32,
    tid: i32,
    chunks: ChunkQueue,
    decoder: StreamDecoder,
    last_branch: LastBranchRb,
    on_heap: bool,
    /// A decoded event held back because it lies past the current limit.
    pending: Option<DecodeState>,
    /// Selected counter value for the most recent event; monotonic.
    ts: u64,
    /// Switch synchronisation active for this stream.
    sync_switch: bool,
}

/// Adapts a chunk queue plus its backing store to the decoder's byte feed.
struct QueueSource<'a> {
    chunks: &'a mut ChunkQueue,
    store: &'a dyn TraceStore,
}

impl ByteSource for QueueSource<'_> {
    fn next_bytes(&mut self) -> Result<Option<Supply>, Error> {
        self.chunks.next_bytes(self.store)
    }
}

enum RunOutcome {
    /// Stopped at the limit; the queue's next event is due at this time.
    Limit(u64),
    /// Out of trace data for now.
    NoData,
    /// Parked at the switch branch, waiting for the switch event.
    Parked,
}

pub struct Session {
    info: TraceInfo,
    cfg: SessionConfig,
    synth: Synth,
    clock: ClockConverter,
    store: Box<dyn TraceStore>,
    resolver: Box<dyn ModuleResolver>,
    threads: Box<dyn ThreadMap>,
    stacks: Option<Box<dyn CallStack>>,
    walker: Walker,
    queues: Vec<Option<StreamQueue>>,
    by_key: HashMap<QueueKey, u32>,
    heap: OrderingHeap,
    /// No timestamps in the trace: decode per thread at exit, unordered.
    timeless: bool,
}

impl Session {
    pub fn new(
        info_bytes: &[u8],
        cfg: SessionConfig,
        store: Box<dyn TraceStore>,
        resolver: Box<dyn ModuleResolver>,
        threads: Box<dyn ThreadMap>,
        stacks: Option<Box<dyn CallStack>>,
    ) -> Result<Session, Error> {
        let info = TraceInfo::parse(info_bytes)?;
        if cfg.synth.instructions && cfg.synth.period == 0 {
            return Err(Error::BadConfig(
                "instruction sampling requires a nonzero period".into(),
            ));
        }
        if cfg.cache_divisor == 0 {
            return Err(Error::BadConfig("cache divisor must be nonzero".into()));
        }
        let clock = ClockConverter::new(info.time_shift, info.time_mult, info.time_zero);
        let timeless = info.tsc_bit == 0;
        debug!(timeless, per_cpu = info.per_cpu_mmaps, "session created");
        Ok(Session {
            synth: Synth::new(cfg.synth.clone()),
            clock,
            walker: Walker::new(cfg.cache_divisor),
            timeless,
            info,
            cfg,
            store,
            resolver,
            threads,
            stacks,
            queues: Vec::new(),
            by_key: HashMap::new(),
            heap: OrderingHeap::new(),
        })
    }

    /// The ids stamped on synthesized samples, per event type.
    pub fn event_ids(&self) -> crate::synth::EventIds {
        self.synth.ids()
    }

    /// A module was unloaded: its cached disassembly is no longer valid.
    pub fn module_unloaded(&mut self, module: ModuleId) {
        self.walker.invalidate(module);
    }

    /// Queue a trace-data notification on its stream.
    pub fn add_chunk(&mut self, desc: ChunkDesc) -> Result<(), Error> {
        let nr = self.queue_nr_for(&desc);
        let idx = nr as usize;
        let Some(q) = self.queues[idx].as_mut() else {
            return Err(Error::BadConfig(format!("no stream queue {nr}")));
        };
        q.chunks.add_chunk(desc);
        if !self.timeless && !q.on_heap {
            if let Some(ref_ts) = q.chunks.next_ref_timestamp() {
                self.heap.push(nr, ref_ts);
                q.on_heap = true;
            }
        }
        Ok(())
    }

    /// Advance decoding in step with the surrounding event stream.
    pub fn process_event(
        &mut self,
        event: SessionEvent,
        sink: &mut dyn EventSink,
    ) -> Result<(), Error> {
        match event {
            SessionEvent::Other { time } => {
                if !self.timeless {
                    self.process_queues(time, sink)?;
                }
                Ok(())
            }
            SessionEvent::Switch {
                cpu,
                pid,
                tid,
                time,
            } => self.switch(cpu, pid, tid, time, sink),
            SessionEvent::Exit { tid, time, .. } => {
                if self.timeless {
                    self.drain_tid(tid, sink)
                } else {
                    self.process_queues(time, sink)
                }
            }
        }
    }

    /// Decode everything still outstanding.
    pub fn flush(&mut self, sink: &mut dyn EventSink) -> Result<(), Error> {
        if self.timeless {
            for nr in 0..self.queues.len() as u32 {
                self.drain_one(nr, sink)?;
            }
            Ok(())
        } else {
            self.process_queues(u64::MAX, sink)
        }
    }

    fn queue_nr_for(&mut self, desc: &ChunkDesc) -> u32 {
        let key: QueueKey = if self.info.per_cpu_mmaps {
            (desc.cpu, None)
        } else {
            (None, Some(desc.tid))
        };
        if let Some(&nr) = self.by_key.get(&key) {
            return nr;
        }
        let nr = self.queues.len() as u32;
        let decoder = StreamDecoder::new(StreamConfig {
            period: if self.cfg.synth.instructions {
                self.cfg.synth.period
            } else {
                0
            },
            return_compression: self.info.noretcomp_bit == 0,
            max_non_turbo_ratio: self.info.max_non_turbo_ratio,
            tsc_ctc_ratio_n: self.info.tsc_ctc_ratio_n,
            tsc_ctc_ratio_d: self.info.tsc_ctc_ratio_d,
            mtc_freq_bits: self.info.mtc_freq_bits,
        });
        let sync_switch = self.cfg.switch_ip.is_some() && self.info.have_sched_switch != 0;
        self.queues.push(Some(StreamQueue {
            nr,
            cpu: desc.cpu,
            pid: desc.pid,
            tid: desc.tid,
            chunks: ChunkQueue::new(self.info.snapshot_mode),
            decoder,
            last_branch: LastBranchRb::new(self.cfg.synth.last_branch_sz),
            on_heap: false,
            pending: None,
            ts: 0,
            sync_switch,
        }));
        self.by_key.insert(key, nr);
        debug!(nr, cpu = ?desc.cpu, tid = desc.tid, "new stream queue");
        nr
    }

    /// Run stream decoders, oldest first, until every queue's next event lies
    /// at or beyond `timestamp`.
    fn process_queues(&mut self, timestamp: u64, sink: &mut dyn EventSink) -> Result<(), Error> {
        loop {
            let Some(top) = self.heap.min_ordinal() else {
                return Ok(());
            };
            if top >= timestamp {
                return Ok(());
            }
            let Some(entry) = self.heap.pop() else {
                return Ok(());
            };
            let nr = entry.queue_nr;
            if let Some(q) = self.queues.get_mut(nr as usize).and_then(Option::as_mut) {
                q.on_heap = false;
            }
            // Stop at the next queue's turn, so streams interleave instead of
            // one being drained wholesale.
            let stop = match self.heap.min_ordinal() {
                Some(next) => (next + 1).min(timestamp),
                None => timestamp,
            };
            match self.run_decoder(nr, stop, sink)? {
                RunOutcome::Limit(ts) => {
                    self.heap.push(nr, ts);
                    if let Some(q) = self.queues.get_mut(nr as usize).and_then(Option::as_mut) {
                        q.on_heap = true;
                    }
                }
                // Re-added when more chunks arrive (or the switch event, for
                // a parked queue).
                RunOutcome::NoData | RunOutcome::Parked => {}
            }
        }
    }

    /// Step one stream's decoder, synthesizing as it goes, until its next
    /// event is due at or after `stop` (wall-clock).
    fn run_decoder(
        &mut self,
        nr: u32,
        stop: u64,
        sink: &mut dyn EventSink,
    ) -> Result<RunOutcome, Error> {
        let idx = nr as usize;
        let Some(mut q) = self.queues.get_mut(idx).and_then(Option::take) else {
            return Ok(RunOutcome::NoData);
        };
        let outcome = loop {
            let state = match q.pending.take() {
                Some(state) => state,
                None => {
                    let mut src = QueueSource {
                        chunks: &mut q.chunks,
                        store: &*self.store,
                    };
                    let mut ctx = DecodeCtx {
                        source: &mut src,
                        walker: &mut self.walker,
                        resolver: &*self.resolver,
                        filters: &self.info.filters,
                    };
                    match q.decoder.step(&mut ctx) {
                        Ok(state) => state,
                        Err(StepError::NoData) => break RunOutcome::NoData,
                        Err(StepError::Decode { kind, ip }) => {
                            // An error deep in the kernel most likely means
                            // the decoder followed the wrong thread across a
                            // switch; stop trusting switch synchronisation.
                            if q.sync_switch && ip >= self.cfg.kernel_start {
                                debug!(nr, ip, "abandoning switch synchronisation");
                                q.sync_switch = false;
                                self.apply_next_tid(&mut q);
                            }
                            let time =
                                (!self.timeless).then(|| self.clock.to_wall_time(q.ts));
                            let at = Attrib {
                                pid: q.pid,
                                tid: q.tid,
                                cpu: q.cpu,
                                time,
                            };
                            self.synth.synth_error(sink, kind, at, ip)?;
                            continue;
                        }
                    }
                }
            };

            self.select_time(&mut q, &state);
            if !self.timeless {
                let ts = self.clock.to_wall_time(q.ts);
                if ts >= stop {
                    q.pending = Some(state);
                    break RunOutcome::Limit(ts);
                }
            }

            let time = (!self.timeless).then(|| self.clock.to_wall_time(q.ts));
            self.deliver(&mut q, &state, time, sink)?;
            if self.track_switch(&mut q, &state) {
                break RunOutcome::Parked;
            }
        };
        self.queues[idx] = Some(q);
        Ok(outcome)
    }

    /// Pick the counter value for an event. The authoritative timestamp wins
    /// normally, but on a branch back from kernel to user space (and while a
    /// context switch is unresolved) it may belong to the far side of a
    /// switch, so the cycle-accurate estimate is preferred there.
    fn select_time(&self, q: &mut StreamQueue, state: &DecodeState) {
        let crossing_out_of_kernel = state.from_ip >= self.cfg.kernel_start
            && state.to_ip != 0
            && state.to_ip < self.cfg.kernel_start;
        let switch_unresolved =
            q.sync_switch && q.decoder.switch_state == SwitchState::ExpectingSwitchEvent;
        if crossing_out_of_kernel || switch_unresolved {
            if state.est_timestamp > q.ts {
                q.ts = state.est_timestamp;
            }
        } else if state.timestamp > q.ts {
            q.ts = state.timestamp;
        }
    }

    fn callchain(&mut self, tid: i32, ip: u64) -> Option<Vec<u64>> {
        if !self.synth.config().callchain {
            return None;
        }
        let depth = self.synth.config().callchain_sz;
        let stacks = self.stacks.as_deref_mut()?;
        let mut chain = Vec::with_capacity(depth);
        stacks.sample(tid, depth, ip, &mut chain);
        Some(chain)
    }

    /// Synthesize the samples one decode state calls for.
    fn deliver(
        &mut self,
        q: &mut StreamQueue,
        state: &DecodeState,
        time: Option<u64>,
        sink: &mut dyn EventSink,
    ) -> Result<(), Error> {
        let scfg = self.synth.config().clone();
        let at = Attrib {
            pid: q.pid,
            tid: q.tid,
            cpu: q.cpu,
            time,
        };

        if state.branch {
            if scfg.last_branch {
                q.last_branch.push(state.from_ip, state.to_ip, state.flags);
            }
            if let Some(stacks) = self.stacks.as_deref_mut() {
                stacks.on_branch(q.tid, state.flags, state.from_ip, state.to_ip, state.insn_len);
            }
        }

        if state.instruction && scfg.instructions {
            let chain = self.callchain(q.tid, state.from_ip);
            let lb = scfg.last_branch.then_some(&q.last_branch);
            self.synth.synth_instruction(
                sink,
                at,
                state.from_ip,
                scfg.period,
                state.flags.contains(SampleFlags::IN_TX),
                lb,
                chain,
            )?;
            if scfg.last_branch {
                q.last_branch.reset();
            }
        }

        if state.transaction && scfg.transactions {
            let chain = self.callchain(q.tid, state.from_ip);
            let lb = scfg.last_branch.then_some(&q.last_branch);
            self.synth
                .synth_transaction(sink, at, state.from_ip, state.flags, lb, chain)?;
        }

        if state.branch && scfg.branches {
            let chain = self.callchain(q.tid, state.from_ip);
            self.synth.synth_branch(
                sink,
                at,
                state.from_ip,
                state.to_ip,
                state.flags,
                state.insn_len,
                chain,
            )?;
        }
        Ok(())
    }

    /// Follow the decoded control flow through the scheduler. Returns true
    /// when the stream must park and wait for the software switch event.
    fn track_switch(&mut self, q: &mut StreamQueue, state: &DecodeState) -> bool {
        if !q.sync_switch || !state.branch {
            return false;
        }
        let Some(switch_ip) = self.cfg.switch_ip else {
            return false;
        };

        // A deferred thread change applies once the decoder reaches the
        // switch code.
        if q.decoder.next_tid.is_some() && state.to_ip == switch_ip {
            self.apply_next_tid(q);
            q.decoder.switch_state = SwitchState::Tracing;
            return false;
        }

        if state.to_ip == switch_ip {
            match q.decoder.switch_state {
                // First sight of the switch code on an untracked stream:
                // still no idea which thread it belongs to.
                SwitchState::NotTracing => {
                    q.decoder.switch_state = SwitchState::Unknown;
                    false
                }
                SwitchState::ExpectingSwitchIp => false,
                _ => {
                    q.decoder.switch_state = SwitchState::ExpectingSwitchEvent;
                    true
                }
            }
        } else if state.to_ip == 0 {
            q.decoder.switch_state = SwitchState::NotTracing;
            false
        } else if q.decoder.switch_state == SwitchState::NotTracing {
            q.decoder.switch_state = SwitchState::Unknown;
            false
        } else if q.decoder.switch_state == SwitchState::Unknown
            && Some(state.to_ip) == self.cfg.ptss_ip
            && state.flags.contains(SampleFlags::CALL)
        {
            q.decoder.switch_state = SwitchState::Tracing;
            false
        } else {
            false
        }
    }

    fn apply_next_tid(&mut self, q: &mut StreamQueue) {
        let Some(tid) = q.decoder.next_tid.take() else {
            return;
        };
        let pid = self.threads.pid_of(tid).unwrap_or(-1);
        q.pid = pid;
        q.tid = tid;
        if let Some(cpu) = q.cpu {
            self.threads.set_current_tid(cpu, pid, tid);
        }
        debug!(nr = q.nr, pid, tid, "switched stream thread");
    }

    /// Handle a software context-switch notification.
    fn switch(
        &mut self,
        cpu: Option<u32>,
        pid: i32,
        tid: i32,
        time: u64,
        sink: &mut dyn EventSink,
    ) -> Result<(), Error> {
        if !self.timeless {
            self.process_queues(time, sink)?;
        }

        let key: QueueKey = if self.info.per_cpu_mmaps {
            (cpu, None)
        } else {
            (None, Some(tid))
        };
        let Some(&nr) = self.by_key.get(&key) else {
            // No trace on this CPU; just keep the thread map current.
            if let Some(cpu) = cpu {
                self.threads.set_current_tid(cpu, pid, tid);
            }
            return Ok(());
        };
        let idx = nr as usize;
        let Some(q) = self.queues[idx].as_mut() else {
            return Ok(());
        };

        if !q.sync_switch {
            q.pid = pid;
            q.tid = tid;
            if let Some(cpu) = cpu {
                self.threads.set_current_tid(cpu, pid, tid);
            }
            return Ok(());
        }

        match q.decoder.switch_state {
            SwitchState::ExpectingSwitchEvent => {
                // The decoder parked at the switch branch; this event resolves
                // it and the stream may run again.
                q.pid = pid;
                q.tid = tid;
                q.decoder.switch_state = SwitchState::Tracing;
                q.decoder.next_tid = None;
                if let Some(cpu) = cpu {
                    self.threads.set_current_tid(cpu, pid, tid);
                }
                if !q.on_heap && !self.timeless {
                    self.heap.push(nr, time);
                    q.on_heap = true;
                }
            }
            SwitchState::NotTracing => {
                q.pid = pid;
                q.tid = tid;
                if let Some(cpu) = cpu {
                    self.threads.set_current_tid(cpu, pid, tid);
                }
            }
            SwitchState::ExpectingSwitchIp => {
                // Two switch events with no switch branch between them.
                debug!(nr, tid, "switch event while one is still unresolved");
                q.decoder.next_tid = Some(tid);
            }
            SwitchState::Unknown | SwitchState::Tracing => {
                // The event ran ahead of the decoder; defer the thread change
                // until the decoded flow reaches the switch code.
                q.decoder.next_tid = Some(tid);
                q.decoder.switch_state = SwitchState::ExpectingSwitchIp;
            }
        }
        Ok(())
    }

    /// Timeless decoding: drain the stream owned by `tid` in full.
    fn drain_tid(&mut self, tid: i32, sink: &mut dyn EventSink) -> Result<(), Error> {
        let nrs: Vec<u32> = self
            .queues
            .iter()
            .flatten()
            .filter(|q| q.tid == tid)
            .map(|q| q.nr)
            .collect();
        for nr in nrs {
            self.drain_one(nr, sink)?;
        }
        Ok(())
    }

    fn drain_one(&mut self, nr: u32, sink: &mut dyn EventSink) -> Result<(), Error> {
        loop {
            match self.run_decoder(nr, u64::MAX, sink)? {
                RunOutcome::NoData | RunOutcome::Parked => return Ok(()),
                RunOutcome::Limit(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Session, SessionConfig, SessionEvent};
    use crate::{
        errors::SinkError,
        info::tests::{full_fields, record},
        pt::testutil::*,
        queue::{ChunkDesc, VecStore},
        stream::{DecodeState, SwitchState},
        synth::{ErrorRecord, EventSink, SampleFlags, SampleRecord, SynthConfig},
        Bitness, Error, Location, ModuleId, ModuleResolver, ThreadMap,
    };
    use std::collections::HashMap;

    const BASE: u64 = 0x40_0000;

    struct Mod {
        code: Vec<u8>,
    }

    impl ModuleResolver for Mod {
        fn resolve(&self, ip: u64) -> Option<Location> {
            let len = self.code.len() as u64;
            (ip >= BASE && ip < BASE + len).then(|| Location {
                module: ModuleId(1),
                offset: ip - BASE,
                map_end: BASE + len,
                bitness: Bitness::Bits64,
            })
        }

        fn read(&self, _m: ModuleId, offset: u64, buf: &mut [u8]) -> usize {
            let off = offset as usize;
            if off >= self.code.len() {
                return 0;
            }
            let n = buf.len().min(self.code.len() - off);
            buf[..n].copy_from_slice(&self.code[off..off + n]);
            n
        }

        fn data_size(&self, _m: ModuleId) -> u64 {
            self.code.len() as u64
        }

        fn module_name(&self, _m: ModuleId) -> Option<String> {
            Some("/test/mod".into())
        }
    }

    #[derive(Default)]
    struct Threads {
        current: HashMap<u32, (i32, i32)>,
    }

    impl ThreadMap for Threads {
        fn current_tid(&self, cpu: u32) -> Option<i32> {
            self.current.get(&cpu).map(|&(_, tid)| tid)
        }

        fn set_current_tid(&mut self, cpu: u32, pid: i32, tid: i32) {
            self.current.insert(cpu, (pid, tid));
        }

        fn pid_of(&self, tid: i32) -> Option<i32> {
            Some(tid)
        }
    }

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

    fn session(
        fields: &[u64],
        cfg: SessionConfig,
        store_bytes: Vec<u8>,
        code: Vec<u8>,
    ) -> Session {
        Session::new(
            &record(fields, &[]),
            cfg,
            Box::new(VecStore::new(store_bytes)),
            Box::new(Mod { code }),
            Box::new(Threads::default()),
            None,
        )
        .unwrap()
    }

    fn desc(cpu: Option<u32>, tid: i32, offset: u64, size: u64, ref_ts: u64) -> ChunkDesc {
        ChunkDesc {
            cpu,
            pid: tid,
            tid,
            offset,
            size,
            ref_timestamp: ref_ts,
            truncated: false,
            overwritten: false,
        }
    }

    /// One begin/end event pair stamped at counter value `t`.
    fn burst(t: u64) -> Vec<u8> {
        let mut v = psb();
        v.extend(tsc(t));
        v.extend(psbend());
        v.extend(tip_pge(BASE));
        v.extend(tip_pgd_noip());
        v
    }

    #[test]
    fn zero_period_is_rejected() {
        let cfg = SessionConfig {
            synth: SynthConfig {
                period: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let res = Session::new(
            &record(&full_fields(), &[]),
            cfg,
            Box::new(VecStore::new(vec![])),
            Box::new(Mod { code: vec![] }),
            Box::new(Threads::default()),
            None,
        );
        assert!(matches!(res, Err(Error::BadConfig(_))));
    }

    #[test]
    fn streams_merge_in_timestamp_order() {
        // Two CPUs with interleaved counter values: 10, 30, 50 on cpu 0 and
        // 20, 40 on cpu 1.
        let mut cpu0 = Vec::new();
        for t in [10u64, 30, 50] {
            cpu0.extend(burst(t));
        }
        let mut cpu1 = Vec::new();
        for t in [20u64, 40] {
            cpu1.extend(burst(t));
        }
        let (cpu0_len, cpu1_len) = (cpu0.len() as u64, cpu1.len() as u64);
        let mut store = cpu0;
        store.extend(&cpu1);

        // Matches the clock triple in full_fields().
        let clock = crate::clock::ClockConverter::new(10, 4242, 1 << 40);
        let wall = |t| clock.to_wall_time(t);

        let mut sess = session(
            &full_fields(),
            SessionConfig::default(),
            store,
            vec![0xff, 0xe0],
        );
        sess.add_chunk(desc(Some(0), 1, 0, cpu0_len, wall(10)))
            .unwrap();
        sess.add_chunk(desc(Some(1), 2, cpu0_len, cpu1_len, wall(20)))
            .unwrap();

        let mut sink = RecordingSink::default();
        sess.flush(&mut sink).unwrap();

        let begin_times: Vec<u64> = sink
            .samples
            .iter()
            .filter(|s| s.flags.contains(SampleFlags::TRACE_BEGIN))
            .map(|s| s.time.unwrap())
            .collect();
        assert_eq!(
            begin_times,
            vec![wall(10), wall(20), wall(30), wall(40), wall(50)]
        );

        // The full merged sequence is non-decreasing in time.
        let times: Vec<u64> = sink.samples.iter().map(|s| s.time.unwrap()).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn timeless_exit_drains_the_thread() {
        let mut fields = full_fields();
        fields[5] = 0; // no embedded timestamps
        fields[9] = 0; // per-thread buffers
        let mut bytes = psb();
        bytes.extend(psbend());
        bytes.extend(tip_pge(BASE));
        bytes.extend(tip_pgd_noip());
        let len = bytes.len() as u64;

        let mut sess = session(&fields, SessionConfig::default(), bytes, vec![0xff, 0xe0]);
        sess.add_chunk(desc(None, 7, 0, len, 0)).unwrap();

        let mut sink = RecordingSink::default();
        // Another thread's exit decodes nothing.
        sess.process_event(
            SessionEvent::Exit {
                pid: 9,
                tid: 9,
                time: 0,
            },
            &mut sink,
        )
        .unwrap();
        assert!(sink.samples.is_empty());

        sess.process_event(
            SessionEvent::Exit {
                pid: 7,
                tid: 7,
                time: 0,
            },
            &mut sink,
        )
        .unwrap();
        assert!(!sink.samples.is_empty());
        assert!(sink.samples.iter().all(|s| s.time.is_none() && s.tid == 7));
    }

    const SWITCH_IP: u64 = 0xffff_ffff_8100_0000;
    const PTSS_IP: u64 = 0xffff_ffff_8100_0040;

    fn switch_session() -> Session {
        let mut fields = full_fields();
        fields[7] = 1; // software switch events present
        let cfg = SessionConfig {
            switch_ip: Some(SWITCH_IP),
            ptss_ip: Some(PTSS_IP),
            kernel_start: 0xffff_8000_0000_0000,
            ..Default::default()
        };
        let mut sess = session(&fields, cfg, vec![], vec![0x90]);
        // Materialise the cpu 0 queue.
        sess.add_chunk(desc(Some(0), 1, 0, 0, 100)).unwrap();
        sess
    }

    fn branch_to(to_ip: u64, flags: SampleFlags) -> DecodeState {
        DecodeState {
            branch: true,
            from_ip: BASE,
            to_ip,
            flags: flags | SampleFlags::BRANCH,
            ..Default::default()
        }
    }

    #[test]
    fn switch_tracking_walks_the_expected_states() {
        let mut sess = switch_session();
        let mut q = sess.queues[0].take().unwrap();
        assert!(q.sync_switch);
        assert_eq!(q.decoder.switch_state, SwitchState::NotTracing);

        // Any ordinary branch moves an untracked stream to Unknown.
        assert!(!sess.track_switch(&mut q, &branch_to(BASE + 8, SampleFlags::default())));
        assert_eq!(q.decoder.switch_state, SwitchState::Unknown);

        // A call into the trace-resume point proves we are in known code.
        assert!(!sess.track_switch(&mut q, &branch_to(PTSS_IP, SampleFlags::CALL)));
        assert_eq!(q.decoder.switch_state, SwitchState::Tracing);

        // Reaching the switch routine parks the stream.
        assert!(sess.track_switch(&mut q, &branch_to(SWITCH_IP, SampleFlags::CALL)));
        assert_eq!(q.decoder.switch_state, SwitchState::ExpectingSwitchEvent);
        sess.queues[0] = Some(q);

        // The switch event un-parks it and re-arms the heap.
        let mut sink = RecordingSink::default();
        sess.process_event(
            SessionEvent::Switch {
                cpu: Some(0),
                pid: 42,
                tid: 43,
                time: 500,
            },
            &mut sink,
        )
        .unwrap();
        let q = sess.queues[0].as_ref().unwrap();
        assert_eq!(q.decoder.switch_state, SwitchState::Tracing);
        assert_eq!((q.pid, q.tid), (42, 43));
        assert!(q.on_heap);
    }

    #[test]
    fn untracked_switch_branch_then_events_attribute_threads() {
        let mut sess = switch_session();
        let mut q = sess.queues[0].take().unwrap();
        assert_eq!(q.decoder.switch_state, SwitchState::NotTracing);

        // A branch into the switch routine with no thread change queued only
        // proves the stream reached known code.
        assert!(!sess.track_switch(&mut q, &branch_to(SWITCH_IP, SampleFlags::CALL)));
        assert_eq!(q.decoder.switch_state, SwitchState::Unknown);
        sess.queues[0] = Some(q);

        // The software event runs ahead of the decoder; the thread change is
        // queued until the next switch branch.
        let mut sink = RecordingSink::default();
        sess.process_event(
            SessionEvent::Switch {
                cpu: Some(0),
                pid: 60,
                tid: 61,
                time: 500,
            },
            &mut sink,
        )
        .unwrap();
        let mut q = sess.queues[0].take().unwrap();
        assert_eq!(q.decoder.switch_state, SwitchState::ExpectingSwitchIp);
        assert_eq!(q.decoder.next_tid, Some(61));

        assert!(!sess.track_switch(&mut q, &branch_to(SWITCH_IP, SampleFlags::CALL)));
        assert_eq!(q.decoder.switch_state, SwitchState::Tracing);
        assert_eq!((q.pid, q.tid), (61, 61));
        sess.queues[0] = Some(q);

        // A later event supersedes the attribution the same way.
        sess.process_event(
            SessionEvent::Switch {
                cpu: Some(0),
                pid: 70,
                tid: 71,
                time: 600,
            },
            &mut sink,
        )
        .unwrap();
        let mut q = sess.queues[0].take().unwrap();
        assert!(!sess.track_switch(&mut q, &branch_to(SWITCH_IP, SampleFlags::CALL)));
        assert_eq!(q.decoder.switch_state, SwitchState::Tracing);
        assert_eq!(q.tid, 71);
        sess.queues[0] = Some(q);
    }

    #[test]
    fn early_switch_event_defers_until_the_switch_branch() {
        let mut sess = switch_session();
        {
            let q = sess.queues[0].as_mut().unwrap();
            q.decoder.switch_state = SwitchState::Tracing;
        }

        // The event stream runs ahead of the decoder.
        let mut sink = RecordingSink::default();
        sess.process_event(
            SessionEvent::Switch {
                cpu: Some(0),
                pid: 50,
                tid: 51,
                time: 500,
            },
            &mut sink,
        )
        .unwrap();
        {
            let q = sess.queues[0].as_ref().unwrap();
            assert_eq!(q.decoder.switch_state, SwitchState::ExpectingSwitchIp);
            assert_eq!(q.decoder.next_tid, Some(51));
            // Not applied yet.
            assert_ne!(q.tid, 51);
        }

        // When decode reaches the switch branch the thread change lands.
        let mut q = sess.queues[0].take().unwrap();
        assert!(!sess.track_switch(&mut q, &branch_to(SWITCH_IP, SampleFlags::CALL)));
        assert_eq!(q.decoder.switch_state, SwitchState::Tracing);
        assert_eq!(q.decoder.next_tid, None);
        assert_eq!((q.pid, q.tid), (51, 51));
        sess.queues[0] = Some(q);
    }

    #[test]
    fn decode_errors_become_error_records() {
        // Trace data that walks into unmapped memory: PGE targets an address
        // outside the only module.
        let mut bytes = psb();
        bytes.extend(tsc(10));
        bytes.extend(psbend());
        bytes.extend(tip_pge(0xdead_0000));
        let len = bytes.len() as u64;

        let mut sess = session(&full_fields(), SessionConfig::default(), bytes, vec![0x90]);
        sess.add_chunk(desc(Some(0), 1, 0, len, 0)).unwrap();

        let mut sink = RecordingSink::default();
        sess.flush(&mut sink).unwrap();
        assert_eq!(sink.errors.len(), 1);
        assert_eq!(sink.errors[0].ip, 0xdead_0000);
    }

    #[test]
    fn module_unload_invalidates_cached_code() {
        let mut sess = session(
            &full_fields(),
            SessionConfig::default(),
            vec![],
            vec![0x90],
        );
        // Nothing cached yet; must not panic and must leave the session
        // usable.
        sess.module_unloaded(ModuleId(1));
    }
}
