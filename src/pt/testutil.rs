//! Builders for fabricated packet byte streams, shared by the unit tests.

/// Packet Stream Boundary.
pub(crate) fn psb() -> Vec<u8> {
    b"\x02\x82".repeat(8)
}

pub(crate) fn psbend() -> Vec<u8> {
    vec![0x02, 0x23]
}

pub(crate) fn pad() -> Vec<u8> {
    vec![0x00]
}

pub(crate) fn ovf() -> Vec<u8> {
    vec![0x02, 0xf3]
}

/// TSC packet carrying the low 56 bits of `tsc`.
pub(crate) fn tsc(tsc: u64) -> Vec<u8> {
    let mut out = vec![0x19];
    out.extend_from_slice(&tsc.to_le_bytes()[..7]);
    out
}

pub(crate) fn mtc(ctc: u8) -> Vec<u8> {
    vec![0x59, ctc]
}

pub(crate) fn cbr(ratio: u8) -> Vec<u8> {
    vec![0x02, 0x03, ratio, 0x00]
}

/// An IP-bearing packet with an uncompressed 64-bit target.
fn ip_packet(opcode: u8, ip: u64) -> Vec<u8> {
    let mut out = vec![(0b110 << 5) | opcode];
    out.extend_from_slice(&ip.to_le_bytes());
    out
}

pub(crate) fn tip(ip: u64) -> Vec<u8> {
    ip_packet(0x0d, ip)
}

/// A TIP whose target is compressed to its low 16 bits.
pub(crate) fn tip16(low: u16) -> Vec<u8> {
    let mut out = vec![(0b001 << 5) | 0x0d];
    out.extend_from_slice(&low.to_le_bytes());
    out
}

pub(crate) fn tip_pge(ip: u64) -> Vec<u8> {
    ip_packet(0x11, ip)
}

pub(crate) fn tip_pgd(ip: u64) -> Vec<u8> {
    ip_packet(0x01, ip)
}

/// A TIP.PGD with an out-of-context (absent) target.
pub(crate) fn tip_pgd_noip() -> Vec<u8> {
    vec![0x01]
}

pub(crate) fn fup(ip: u64) -> Vec<u8> {
    ip_packet(0x1d, ip)
}

/// Short TNT carrying up to 6 decisions, oldest first.
pub(crate) fn short_tnt(decisions: &[bool]) -> Vec<u8> {
    assert!(!decisions.is_empty() && decisions.len() <= 6);
    let mut branches = 1u8; // stop bit
    for d in decisions {
        branches = (branches << 1) | u8::from(*d);
    }
    vec![branches << 1]
}

/// Cycle-count packet, with extended bytes as needed.
pub(crate) fn cyc(count: u64) -> Vec<u8> {
    let exp = count >> 5 != 0;
    let mut out = vec![((count as u8 & 0x1f) << 3) | (u8::from(exp) << 2) | 0b11];
    let mut rest = count >> 5;
    while rest != 0 {
        let more = rest >> 7 != 0;
        out.push(((rest as u8 & 0x7f) << 1) | u8::from(more));
        rest >>= 7;
    }
    out
}

/// MODE.Exec selecting 64-bit code.
pub(crate) fn mode_exec_64() -> Vec<u8> {
    vec![0x99, 0x01]
}

pub(crate) fn mode_tsx(in_tx: bool, tx_abort: bool) -> Vec<u8> {
    vec![0x99, 0x20 | (u8::from(tx_abort) << 1) | u8::from(in_tx)]
}
