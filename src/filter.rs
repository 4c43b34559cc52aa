//! Address filters.
//!
//! The trace-info descriptor may carry a filter specification restricting
//! which code regions were traced. Each entry names an action, an address
//! range and optionally the module the range is relative to:
//!
//! ```text
//! filter 0x1000/0x200@/usr/bin/foo, stop 0x4b0/0x10@/usr/bin/foo
//! ```
//!
//! `filter` (alias `start`) entries mark regions inside which tracing is
//! active; `stop` (alias `tracestop`) entries mark addresses where tracing
//! halts. Ranges without a module apply to unresolved (kernel) addresses.
//!
//! The decoder consults the filters when a packet-generation-disable packet
//! arrives with a target address: a disable landing in a filtered-out region
//! is a filter boundary, not the end of the traced window.

use crate::errors::Error;
use intervaltree::{Element, IntervalTree};
use std::collections::HashMap;
use tracing::debug;

/// One parsed filter entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddrFilter {
    /// False for `filter`/`start` entries, true for `stop`/`tracestop`.
    pub stop: bool,
    /// Module path the range is relative to; `None` for absolute ranges.
    pub module: Option<String>,
    pub addr: u64,
    pub size: u64,
}

/// All filter entries of a session, indexed for range queries.
#[derive(Clone, Debug)]
pub struct AddrFilters {
    // Value is the `stop` flag of the entry.
    trees: HashMap<Option<String>, IntervalTree<u64, bool>>,
    have_start_filter: bool,
}

impl AddrFilters {
    /// An empty set: nothing is ever filtered out.
    pub fn empty() -> Self {
        Self {
            trees: HashMap::new(),
            have_start_filter: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    /// Parse a filter specification string. Entries are separated by commas.
    pub fn parse(spec: &str) -> Result<Self, Error> {
        let mut entries = Vec::new();
        for raw in spec.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            entries.push(parse_entry(raw)?);
        }
        Ok(Self::from_entries(entries))
    }

    pub fn from_entries(entries: Vec<AddrFilter>) -> Self {
        let have_start_filter = entries.iter().any(|f| !f.stop);
        let mut by_module: HashMap<Option<String>, Vec<Element<u64, bool>>> = HashMap::new();
        for f in entries {
            let end = f.addr.saturating_add(f.size.max(1));
            by_module.entry(f.module).or_default().push(Element {
                range: f.addr..end,
                value: f.stop,
            });
        }
        let trees = by_module
            .into_iter()
            .map(|(m, elems)| (m, elems.into_iter().collect()))
            .collect();
        Self {
            trees,
            have_start_filter,
        }
    }

    /// Whether a packet-generation disable at `offset` within `module` lands
    /// in a filtered-out region.
    ///
    /// True when the address hits a trace-stop range, or when start filters
    /// exist and the address is inside none of them. With no entries at all
    /// nothing is filtered.
    pub fn is_filtered_out(&self, module: Option<&str>, offset: u64) -> bool {
        let mut hit_filter = false;
        let mut hit_stop = false;
        if let Some(tree) = self.trees.get(&module.map(str::to_owned)) {
            for e in tree.query_point(offset) {
                if e.value {
                    hit_stop = true;
                } else {
                    hit_filter = true;
                }
            }
        }
        let out = hit_stop || (self.have_start_filter && !hit_filter);
        if out {
            debug!(offset, module, "address filtered out");
        }
        out
    }
}

fn parse_entry(raw: &str) -> Result<AddrFilter, Error> {
    let bad = |what: &str| Error::BadTraceInfo(format!("{what} in filter entry {raw:?}"));

    let mut words = raw.split_whitespace();
    let action = words.next().ok_or_else(|| bad("missing action"))?;
    let stop = match action {
        "filter" | "start" => false,
        "stop" | "tracestop" => true,
        _ => return Err(bad("unknown action")),
    };
    let rest = words.next().ok_or_else(|| bad("missing range"))?;
    if words.next().is_some() {
        return Err(bad("trailing tokens"));
    }

    let (range, module) = match rest.split_once('@') {
        Some((r, m)) => (r, Some(m.to_owned())),
        None => (rest, None),
    };
    let (addr, size) = match range.split_once('/') {
        Some((a, s)) => (parse_num(a).ok_or_else(|| bad("bad address"))?, {
            parse_num(s).ok_or_else(|| bad("bad size"))?
        }),
        None => (parse_num(range).ok_or_else(|| bad("bad address"))?, 1),
    };
    Ok(AddrFilter {
        stop,
        module,
        addr,
        size,
    })
}

fn parse_num(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}
