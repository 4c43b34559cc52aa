//! The instruction walker.
//!
//! The packet stream only records control-flow decisions, so between branch
//! packets the decoder must disassemble the traced binary to find out where
//! the next branch is. The walker resolves an instruction pointer to a module,
//! reads raw bytes through the [ModuleResolver] and decodes one instruction at
//! a time until it hits a branch, an instruction-count limit or a target
//! address. Results for branch-terminated walks are cached per module.

use crate::{
    cache::{CacheEntry, InsnCache},
    Bitness, ModuleId, ModuleResolver,
};
use std::collections::HashMap;
use thiserror::Error;

/// Maximum bytes fetched per instruction decode. x86 instructions are at most
/// 15 bytes.
const INSN_BUF_SIZE: usize = 16;

/// Classification of the instruction terminating a walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchKind {
    /// The walk did not end at a branch (limit or target address reached).
    None,
    Conditional,
    Unconditional,
    Indirect,
    Call,
    IndirectCall,
    Return,
}

/// The terminating instruction of a walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BranchInfo {
    pub kind: BranchKind,
    /// Encoded length of the instruction.
    pub length: u8,
    /// Displacement relative to the end of the instruction (direct branches).
    pub rel: i32,
}

impl BranchInfo {
    pub fn none() -> Self {
        BranchInfo {
            kind: BranchKind::None,
            length: 0,
            rel: 0,
        }
    }

    /// The target address of a direct branch located at `branch_ip`.
    pub fn target(&self, branch_ip: u64) -> u64 {
        branch_ip
            .wrapping_add(u64::from(self.length))
            .wrapping_add(self.rel as i64 as u64)
    }
}

/// A completed walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Walk {
    /// The address of the terminating branch instruction, or of the next
    /// unexecuted instruction when no branch was reached.
    pub next_ip: u64,
    /// Instructions consumed, including the terminating branch if any.
    pub insn_cnt: u64,
    pub branch: BranchInfo,
}

#[derive(Debug, Error)]
pub enum WalkError {
    #[error("address {0:#x} is not mapped")]
    Unmapped(u64),
    #[error("cannot read bytes at {module:?}+{offset:#x}")]
    Unreadable { module: ModuleId, offset: u64 },
    #[error("undecodable instruction at {0:#x}")]
    BadEncoding(u64),
}

/// Walks instructions, consulting and populating per-module caches.
pub struct Walker {
    caches: HashMap<ModuleId, InsnCache>,
    divisor: u64,
}

impl Walker {
    pub fn new(cache_divisor: u64) -> Self {
        Self {
            caches: HashMap::new(),
            divisor: cache_divisor,
        }
    }

    /// Discard the cache of an unloaded module.
    pub fn invalidate(&mut self, module: ModuleId) {
        self.caches.remove(&module);
    }

    fn cache_for(&mut self, resolver: &dyn ModuleResolver, module: ModuleId) -> &mut InsnCache {
        self.caches
            .entry(module)
            .or_insert_with(|| InsnCache::new(resolver.data_size(module), self.divisor))
    }

    /// Walk from `ip` until a branch, `max_insn_cnt` instructions (0 meaning
    /// no limit), or `to_ip` is reached.
    ///
    /// `bitness` overrides the mapping's address width; the trace's own
    /// execution-mode reports take precedence over what the resolver believes.
    ///
    /// A walk that crosses the end of a mapping re-resolves the address and
    /// carries on, but its result is then entry-point dependent and is not
    /// cached.
    pub fn walk(
        &mut self,
        resolver: &dyn ModuleResolver,
        ip: u64,
        to_ip: Option<u64>,
        max_insn_cnt: u64,
        bitness: Option<Bitness>,
    ) -> Result<Walk, WalkError> {
        // A zero-length walk: used to detect back-to-back branches.
        if to_ip == Some(ip) {
            return Ok(Walk {
                next_ip: ip,
                insn_cnt: 0,
                branch: BranchInfo::none(),
            });
        }

        let mut insn_cnt = 0u64;
        let mut one_map = true;
        let mut cur_ip = ip;

        loop {
            let loc = resolver
                .resolve(cur_ip)
                .ok_or(WalkError::Unmapped(cur_ip))?;
            let mut offset = loc.offset;

            if to_ip.is_none() && one_map {
                if let Some(e) = self.cache_for(resolver, loc.module).lookup(offset) {
                    if max_insn_cnt == 0 || e.insn_cnt <= max_insn_cnt {
                        return Ok(Walk {
                            next_ip: cur_ip + e.byte_cnt,
                            insn_cnt: e.insn_cnt,
                            branch: BranchInfo {
                                kind: e.branch,
                                length: e.length,
                                rel: e.rel,
                            },
                        });
                    }
                }
            }

            let start_offset = offset;
            let start_ip = cur_ip;

            loop {
                let inst = decode_one(
                    resolver,
                    loc.module,
                    offset,
                    cur_ip,
                    bitness.unwrap_or(loc.bitness),
                )?;
                let (kind, rel) = classify(&inst);
                let length = inst.len() as u64;
                insn_cnt += 1;

                if kind != BranchKind::None {
                    let branch = BranchInfo {
                        kind,
                        length: length as u8,
                        rel,
                    };
                    if one_map {
                        // In the `to_ip` case the cache was not consulted up
                        // front, so look the entry up now to avoid duplicates.
                        let cache = self.cache_for(resolver, loc.module);
                        if to_ip.is_none() || cache.lookup(start_offset).is_none() {
                            let _ = cache.insert(
                                start_offset,
                                CacheEntry {
                                    insn_cnt,
                                    byte_cnt: cur_ip - start_ip,
                                    branch: kind,
                                    length: length as u8,
                                    rel,
                                },
                            );
                        }
                    }
                    return Ok(Walk {
                        next_ip: cur_ip,
                        insn_cnt,
                        branch,
                    });
                }

                if max_insn_cnt != 0 && insn_cnt >= max_insn_cnt {
                    return Ok(Walk {
                        next_ip: cur_ip + length,
                        insn_cnt,
                        branch: BranchInfo::none(),
                    });
                }

                cur_ip += length;

                if to_ip == Some(cur_ip) {
                    return Ok(Walk {
                        next_ip: cur_ip,
                        insn_cnt,
                        branch: BranchInfo::none(),
                    });
                }

                if cur_ip >= loc.map_end {
                    // Walked off the end of the mapping: re-resolve.
                    one_map = false;
                    break;
                }

                offset += length;
            }
        }
    }
}

fn decode_one(
    resolver: &dyn ModuleResolver,
    module: ModuleId,
    offset: u64,
    ip: u64,
    bitness: Bitness,
) -> Result<iced_x86::Instruction, WalkError> {
    let mut buf = [0u8; INSN_BUF_SIZE];
    let len = resolver.read(module, offset, &mut buf);
    if len == 0 {
        return Err(WalkError::Unreadable { module, offset });
    }
    let bits = match bitness {
        Bitness::Bits16 => 16,
        Bitness::Bits32 => 32,
        Bitness::Bits64 => 64,
    };
    let mut dis = iced_x86::Decoder::with_ip(bits, &buf[..len], ip, iced_x86::DecoderOptions::NONE);
    let inst = dis.decode();
    if inst.is_invalid() {
        return Err(WalkError::BadEncoding(ip));
    }
    Ok(inst)
}

/// Classify an instruction's control flow and compute the relative target of
/// direct branches.
fn classify(inst: &iced_x86::Instruction) -> (BranchKind, i32) {
    use iced_x86::FlowControl;

    let rel = || inst.near_branch_target().wrapping_sub(inst.next_ip()) as i64 as i32;

    match inst.flow_control() {
        FlowControl::Next | FlowControl::Exception | FlowControl::XbeginXabortXend => {
            (BranchKind::None, 0)
        }
        // Syscalls and software interrupts leave the traced address space;
        // the trace expresses them as packet-generation disable/enable pairs
        // which are handled at the packet level.
        FlowControl::Interrupt => (BranchKind::None, 0),
        FlowControl::ConditionalBranch => (BranchKind::Conditional, rel()),
        FlowControl::UnconditionalBranch => (BranchKind::Unconditional, rel()),
        FlowControl::IndirectBranch => (BranchKind::Indirect, 0),
        FlowControl::Call => match inst.code() {
            iced_x86::Code::Syscall | iced_x86::Code::Sysenter => (BranchKind::None, 0),
            _ => (BranchKind::Call, rel()),
        },
        FlowControl::IndirectCall => (BranchKind::IndirectCall, 0),
        FlowControl::Return => (BranchKind::Return, 0),
    }
}
