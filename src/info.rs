//! The trace-info descriptor.
//!
//! Delivered once, before any trace data: a flat array of little-endian
//! 64-bit fields at fixed positions, optionally followed by a length-prefixed
//! NUL-terminated address-filter string. Later fields were added over time,
//! so their presence is gated on the record actually being long enough to
//! contain them; absent fields read as zero.
//!
//! Parsing is strict about the pieces that matter for safety: a record
//! shorter than the mandatory fields, a filter length that overruns the
//! record, or a filter string without a terminating NUL are all setup-fatal.

use crate::{errors::Error, filter::AddrFilters};
use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

// Mandatory fields, in record order.
const MANDATORY_FIELDS: usize = 10; // pmu type .. per-cpu flag
// Optional field groups, gated on record length.
const MTC_GROUP_FIELDS: usize = 4; // mtc bit, mtc freq, tsc:ctc n, d
const CYC_FIELDS: usize = 1;
const TAIL_FIELDS: usize = 2; // max non-turbo ratio, filter string length

/// Parsed, validated trace-info descriptor.
#[derive(Clone, Debug)]
pub struct TraceInfo {
    /// Identifies the trace source that produced the stream.
    pub pmu_type: u64,
    pub time_shift: u32,
    pub time_mult: u32,
    pub time_zero: u64,
    /// Whether `time_zero` came from a trusted clock source.
    pub cap_user_time_zero: bool,
    /// Config bit enabling embedded cycle-counter packets; zero when the
    /// trace carries no absolute timestamps.
    pub tsc_bit: u64,
    /// Config bit disabling return compression.
    pub noretcomp_bit: u64,
    /// Whether software context-switch events accompany the trace.
    pub have_sched_switch: u64,
    pub snapshot_mode: bool,
    /// Per-CPU buffering when true, one global (per-thread) buffer when
    /// false.
    pub per_cpu_mmaps: bool,
    pub mtc_bit: u64,
    pub mtc_freq_bits: u64,
    pub tsc_ctc_ratio_n: u64,
    pub tsc_ctc_ratio_d: u64,
    /// Config bit enabling fine-grained cycle packets.
    pub cyc_bit: u64,
    pub max_non_turbo_ratio: u32,
    /// Parsed address filters (empty when the record carried none).
    pub filters: AddrFilters,
}

struct Fields<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        (self.data.len() - self.pos) / 8
    }

    /// Read the next u64 field; zero once past the end of the record.
    fn next(&mut self) -> u64 {
        if self.pos + 8 > self.data.len() {
            return 0;
        }
        let v = LittleEndian::read_u64(&self.data[self.pos..]);
        self.pos += 8;
        v
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn skip(&mut self, fields: usize) {
        self.pos += fields * 8;
    }
}

impl TraceInfo {
    pub fn parse(data: &[u8]) -> Result<TraceInfo, Error> {
        if data.len() < MANDATORY_FIELDS * 8 {
            return Err(Error::BadTraceInfo(format!(
                "record too short: {} bytes, need at least {}",
                data.len(),
                MANDATORY_FIELDS * 8
            )));
        }
        let mut f = Fields::new(data);

        let pmu_type = f.next();
        let time_shift = f.next() as u32;
        let time_mult = f.next() as u32;
        let time_zero = f.next();
        let cap_user_time_zero = f.next() != 0;
        let tsc_bit = f.next();
        let noretcomp_bit = f.next();
        let have_sched_switch = f.next();
        let snapshot_mode = f.next() != 0;
        let per_cpu_mmaps = f.next() != 0;

        let have_mtc_group = f.remaining() >= MTC_GROUP_FIELDS;
        let (mtc_bit, mtc_freq_bits, tsc_ctc_ratio_n, tsc_ctc_ratio_d) = if have_mtc_group {
            (f.next(), f.next(), f.next(), f.next())
        } else {
            (0, 0, 0, 0)
        };

        let cyc_bit = if f.remaining() >= CYC_FIELDS {
            f.next()
        } else {
            0
        };

        let mut max_non_turbo_ratio = 0u32;
        let mut filters = AddrFilters::empty();
        if f.remaining() >= TAIL_FIELDS {
            max_non_turbo_ratio = f.next() as u32;
            let filter_str_len = f.next() as usize;
            if filter_str_len != 0 {
                // The string is stored NUL-terminated and padded to a
                // multiple of eight bytes.
                let stored = (filter_str_len + 1 + 7) & !7;
                let rest = f.rest();
                if stored > rest.len() {
                    return Err(Error::BadTraceInfo(format!(
                        "filter string length {filter_str_len} overruns record \
                         ({} bytes left)",
                        rest.len()
                    )));
                }
                if rest[stored - 1] != 0 {
                    return Err(Error::BadTraceInfo(
                        "filter string is not NUL terminated".into(),
                    ));
                }
                let text = std::str::from_utf8(&rest[..filter_str_len])
                    .map_err(|_| Error::BadTraceInfo("filter string is not UTF-8".into()))?;
                filters = AddrFilters::parse(text)?;
                f.skip(stored / 8);
            }
        }

        debug!(
            pmu_type,
            time_shift,
            time_mult,
            time_zero,
            snapshot_mode,
            per_cpu_mmaps,
            "parsed trace info"
        );

        Ok(TraceInfo {
            pmu_type,
            time_shift,
            time_mult,
            time_zero,
            cap_user_time_zero,
            tsc_bit,
            noretcomp_bit,
            have_sched_switch,
            snapshot_mode,
            per_cpu_mmaps,
            mtc_bit,
            mtc_freq_bits,
            tsc_ctc_ratio_n,
            tsc_ctc_ratio_d,
            cyc_bit,
            max_non_turbo_ratio,
            filters,
        })
    }
}
