//! Trace packets and their constituents.

use deku::prelude::*;

/// The `IPBytes` field common to all IP packets.
///
/// This tells us what kind of compression was used for a `TargetIP`.
#[derive(Clone, Copy, Debug, DekuRead)]
pub(crate) struct IPBytes {
    #[deku(bits = "3")]
    val: u8,
}

impl IPBytes {
    #[cfg(test)]
    pub(crate) fn new(val: u8) -> Self {
        debug_assert!(val >> 3 == 0);
        Self { val }
    }

    /// Returns `true` if we need the previous TIP value to make sense of the new one.
    pub(crate) fn needs_prev_tip(&self) -> bool {
        matches!(self.val, 0b001 | 0b010 | 0b100)
    }
}

/// The `TargetIP` fields in packets which update the TIP.
///
/// This is a variable-width field depending upon the value of `IPBytes` in the containing packet.
#[derive(Debug, DekuRead)]
#[deku(id = "ip_bytes_val", ctx = "ip_bytes_val: u8")]
pub(crate) enum TargetIP {
    #[deku(id = "0b000")]
    OutOfContext,
    #[deku(id = "0b001")]
    Ip16(u16),
    #[deku(id = "0b010")]
    Ip32(u32),
    #[deku(id_pat = "0b011 | 0b100")]
    Ip48(#[deku(bits = "48")] u64),
    #[deku(id = "0b110")]
    Ip64(u64),
}

impl TargetIP {
    #[cfg(test)]
    pub(crate) fn from_bits(bits: u8, val: u64) -> Self {
        match bits {
            0 => Self::OutOfContext,
            16 => Self::Ip16(u16::try_from(val).unwrap()),
            32 => Self::Ip32(u32::try_from(val).unwrap()),
            48 => Self::Ip48(val),
            64 => Self::Ip64(val),
            _ => panic!(),
        }
    }

    /// Decompress a `TargetIP` and `IPBytes` pair into an instruction pointer address.
    ///
    /// Returns `None` if the target IP was "out of context", or if the compression scheme
    /// requires a previous TIP value that we don't have (e.g. right after synchronising
    /// mid-stream).
    pub(crate) fn decompress(&self, ip_bytes: IPBytes, prev_tip: Option<u64>) -> Option<u64> {
        let res = match ip_bytes.val {
            0b000 => {
                debug_assert!(matches!(self, Self::OutOfContext));
                return None;
            }
            0b001 => {
                // The result is bytes 63..=16 from `prev_tip` and bytes 15..=0 from `ip`.
                if let Self::Ip16(v) = self {
                    prev_tip? & 0xffff_ffff_ffff_0000 | u64::from(*v)
                } else {
                    unreachable!();
                }
            }
            0b010 => {
                // The result is bytes 63..=32 from `prev_tip` and bytes 31..=0 from `ip`.
                if let Self::Ip32(v) = self {
                    prev_tip? & 0xffff_ffff_0000_0000 | u64::from(*v)
                } else {
                    unreachable!();
                }
            }
            0b011 => {
                // The result is bits 0..=47 from the IP, with the remaining high-order bits
                // extended with the value of bit 47.
                if let Self::Ip48(v) = self {
                    debug_assert!(v >> 48 == 0);
                    // Extract the value of bit 47.
                    let b47 = (v & (1 << 47)) >> 47;
                    // Copy the value of bit 47 across all 64 bits.
                    let all = u64::wrapping_sub(!b47 & 0x1, 1);
                    // Restore bits 47..=0 to arrive at the result.
                    all & 0xffff_0000_0000_0000 | v
                } else {
                    unreachable!();
                }
            }
            0b100 => {
                // Bits 47..=0 from the IP, bytes 63..=48 from `prev_tip`.
                if let Self::Ip48(v) = self {
                    prev_tip? & 0xffff_0000_0000_0000 | v
                } else {
                    unreachable!();
                }
            }
            0b101 => unreachable!(), // reserved.
            0b110 => {
                // Uncompressed IP.
                if let Self::Ip64(v) = self {
                    *v
                } else {
                    unreachable!();
                }
            }
            0b111 => unreachable!(), // reserved.
            _ => unreachable!("IPBytes: {:03b}", ip_bytes.val),
        };
        Some(res)
    }
}

/// Packet Stream Boundary (PSB) packet.
#[derive(Debug, PartialEq, DekuRead)]
#[deku(magic = b"\x02\x82\x02\x82\x02\x82\x02\x82\x02\x82\x02\x82\x02\x82\x02\x82")]
pub(crate) struct PSBPacket {}

/// Core Bus Ratio (CBR) packet.
#[deku_derive(DekuRead)]
#[derive(Debug)]
#[deku(magic = b"\x02\x03")]
pub(crate) struct CBRPacket {
    ratio: u8,
    #[deku(temp)]
    reserved: u8,
}

impl CBRPacket {
    pub(crate) fn ratio(&self) -> u8 {
        self.ratio
    }
}

/// End of PSB+ sequence (PSBEND) packet.
#[derive(Debug, DekuRead)]
#[deku(magic = b"\x02\x23")]
pub(crate) struct PSBENDPacket {}

/// Padding (PAD) packet.
#[derive(Debug, DekuRead)]
#[deku(magic = b"\x00")]
pub(crate) struct PADPacket {}

/// Timestamp counter (TSC) packet: a 56-bit little-endian counter value.
#[deku_derive(DekuRead)]
#[derive(Debug)]
#[deku(magic = b"\x19")]
pub(crate) struct TSCPacket {
    #[deku(count = "7")]
    payload: Vec<u8>,
}

impl TSCPacket {
    pub(crate) fn tsc(&self) -> u64 {
        self.payload
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }
}

/// Mini timestamp counter (MTC) packet.
#[deku_derive(DekuRead)]
#[derive(Debug)]
#[deku(magic = b"\x59")]
pub(crate) struct MTCPacket {
    ctc: u8,
}

impl MTCPacket {
    pub(crate) fn ctc(&self) -> u8 {
        self.ctc
    }
}

/// Mode (MODE.Exec) packet.
#[deku_derive(DekuRead)]
#[derive(Debug)]
#[deku(magic = b"\x99")]
pub(crate) struct MODEExecPacket {
    #[deku(bits = "3", assert = "*magic1 == 0x0", temp)]
    magic1: u8,
    #[deku(bits = "2", temp)]
    reserved: u8,
    #[deku(bits = "1", temp)]
    if_: u8,
    #[deku(bits = "1")]
    csd: u8,
    #[deku(bits = "1")]
    csl_lma: u8,
}

impl MODEExecPacket {
    pub(crate) fn bitness(&self) -> crate::Bitness {
        match (self.csd, self.csl_lma) {
            (0, 1) => crate::Bitness::Bits64,
            (1, 0) => crate::Bitness::Bits32,
            (0, 0) => crate::Bitness::Bits16,
            _ => crate::Bitness::Bits64, // reserved encoding
        }
    }
}

/// Mode (MODE.TSX) packet.
#[deku_derive(DekuRead)]
#[derive(Debug)]
#[deku(magic = b"\x99")]
pub(crate) struct MODETSXPacket {
    #[deku(bits = "3", assert = "*magic1 == 0x1", temp)]
    magic1: u8,
    #[deku(bits = "3", temp)]
    reserved: u8,
    #[deku(bits = "1")]
    txabort: u8,
    #[deku(bits = "1")]
    intx: u8,
}

impl MODETSXPacket {
    pub(crate) fn in_tx(&self) -> bool {
        self.intx == 1
    }

    pub(crate) fn tx_abort(&self) -> bool {
        self.txabort == 1
    }
}

/// Packet Generation Enable (TIP.PGE) packet.
#[deku_derive(DekuRead)]
#[derive(Debug)]
pub(crate) struct TIPPGEPacket {
    ip_bytes: IPBytes,
    #[deku(bits = "5", assert = "*magic & 0x1f == 0x11", temp)]
    magic: u8,
    #[deku(ctx = "ip_bytes.val")]
    target_ip: TargetIP,
}

impl TIPPGEPacket {
    fn target_ip(&self, prev_tip: Option<u64>) -> Option<u64> {
        self.target_ip.decompress(self.ip_bytes, prev_tip)
    }
}

/// Short Taken/Not-Taken (TNT) packet.
#[deku_derive(DekuRead)]
#[derive(Debug)]
pub(crate) struct ShortTNTPacket {
    /// Bits encoding the branch decisions **and** a stop bit.
    ///
    /// The first part of the assertion here (`branches != 0x1`) is subtle: we know that the
    /// `branches` field must contain a stop bit terminating the field, but if the stop bit appears
    /// in place of the first branch, then this is not a short TNT packet at all; it's a long TNT
    /// packet.
    ///
    /// The second part of the assertion (`branches != 0x0`) prevents a pad packet (`0x0`) from
    /// being interpreted as a short TNT with no stop bit.
    #[deku(bits = "7", assert = "*branches != 0x1 && *branches != 0x0")]
    branches: u8,
    #[deku(bits = "1", assert = "!*magic", temp)]
    magic: bool,
}

impl ShortTNTPacket {
    pub(crate) fn tnts(&self) -> Vec<bool> {
        tnts_from_bits(u64::from(self.branches), 7)
    }
}

/// Long Taken/Not-Taken (TNT) packet.
#[deku_derive(DekuRead)]
#[derive(Debug)]
#[deku(magic = b"\x02\xa3")]
pub(crate) struct LongTNTPacket {
    /// Branch decisions and the stop bit, 48 bits little-endian.
    #[deku(count = "6")]
    payload: Vec<u8>,
}

impl LongTNTPacket {
    pub(crate) fn tnts(&self) -> Vec<bool> {
        let bits = self
            .payload
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        tnts_from_bits(bits, 48)
    }
}

/// Extract branch decisions from a TNT bit field: everything below the stop
/// bit, oldest decision first.
fn tnts_from_bits(bits: u64, width: u32) -> Vec<bool> {
    let mut push = false;
    let mut tnts = Vec::new();
    for i in (0..width).rev() {
        let bit = (bits >> i) & 0x1;
        if !push && bit == 1 {
            // We are witnessing the stop bit. Push from now on.
            push = true;
        } else if push {
            tnts.push(bit == 1);
        }
    }
    debug_assert!(push); // or we didn't see a stop bit!
    tnts
}

/// Target IP (TIP) packet.
#[deku_derive(DekuRead)]
#[derive(Debug)]
pub(crate) struct TIPPacket {
    ip_bytes: IPBytes,
    #[deku(bits = "5", assert = "*magic & 0x1f == 0x0d", temp)]
    magic: u8,
    #[deku(ctx = "ip_bytes.val")]
    target_ip: TargetIP,
}

impl TIPPacket {
    fn target_ip(&self, prev_tip: Option<u64>) -> Option<u64> {
        self.target_ip.decompress(self.ip_bytes, prev_tip)
    }
}

/// Packet Generation Disable (TIP.PGD) packet.
#[deku_derive(DekuRead)]
#[derive(Debug)]
pub(crate) struct TIPPGDPacket {
    ip_bytes: IPBytes,
    #[deku(bits = "5", assert = "*magic & 0x1f == 0x1", temp)]
    magic: u8,
    #[deku(ctx = "ip_bytes.val")]
    target_ip: TargetIP,
}

impl TIPPGDPacket {
    fn target_ip(&self, prev_tip: Option<u64>) -> Option<u64> {
        self.target_ip.decompress(self.ip_bytes, prev_tip)
    }
}

/// Flow Update (FUP) packet.
#[deku_derive(DekuRead)]
#[derive(Debug)]
pub(crate) struct FUPPacket {
    ip_bytes: IPBytes,
    #[deku(bits = "5", assert = "*magic & 0x1f == 0b11101", temp)]
    magic: u8,
    #[deku(ctx = "ip_bytes.val")]
    target_ip: TargetIP,
}

impl FUPPacket {
    fn target_ip(&self, prev_tip: Option<u64>) -> Option<u64> {
        self.target_ip.decompress(self.ip_bytes, prev_tip)
    }
}

/// Cycle count (CYC) packet.
#[deku_derive(DekuRead)]
#[derive(Debug)]
pub(crate) struct CYCPacket {
    #[deku(bits = "5")]
    count_lo: u8,
    #[deku(bits = "1", temp)]
    exp: bool,
    #[deku(bits = "2", assert = "*magic & 0x3 == 0b11", temp)]
    magic: u8,
    /// A CYC packet is variable length and has 0 or more "extended" bytes.
    #[deku(bits = 8, cond = "*exp", until = "|e: &u8| e & 0x01 != 0x01")]
    extended: Vec<u8>,
}

impl CYCPacket {
    /// The cycle count: 5 bits from the first byte, then 7 bits per extended byte.
    pub(crate) fn cycles(&self) -> u64 {
        let mut val = u64::from(self.count_lo);
        for (i, e) in self.extended.iter().enumerate() {
            val |= u64::from(e >> 1) << (5 + 7 * i);
        }
        val
    }
}

/// Execution Stop (EXSTOP) packet.
#[deku_derive(DekuRead)]
#[derive(Debug)]
pub(crate) struct EXSTOPPacket {
    #[deku(bits = "8", assert = "*magic1 == 0x2", temp)]
    magic1: u8,
    #[deku(bits = "1", temp)]
    ip: u8,
    #[deku(bits = "7", assert = "*magic2 == 0x2", temp)]
    magic2: u8,
}

/// Overflow (OVF) packet.
#[derive(Debug, PartialEq, DekuRead)]
#[deku(magic = b"\x02\xf3")]
pub(crate) struct OVFPacket {}

/// Virtual Machine Control Structure (VMCS) packet.
#[deku_derive(DekuRead)]
#[derive(Debug)]
pub(crate) struct VMCSPacket {
    #[deku(bits = "8", assert = "*magic1 == 0x2", temp)]
    magic1: u8,
    #[deku(bits = "8", assert = "*magic2 == 0b11001000", temp)]
    magic2: u8,
    #[deku(temp)]
    unused: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum PacketKind {
    PSB,
    CBR,
    PSBEND,
    PAD,
    TSC,
    MTC,
    MODEExec,
    MODETSX,
    TIPPGE,
    TIPPGD,
    ShortTNT,
    LongTNT,
    TIP,
    FUP,
    CYC,
    EXSTOP,
    OVF,
    VMCS,
}

/// The top-level representation of a trace packet.
///
/// Variants with an `Option<u64>` cache the previous TIP value (at the time the packet was
/// created). This may be needed to get the updated TIP value from the packet.
#[derive(Debug)]
pub(crate) enum Packet {
    PSB(PSBPacket),
    CBR(CBRPacket),
    PSBEND(PSBENDPacket),
    PAD(PADPacket),
    TSC(TSCPacket),
    MTC(MTCPacket),
    MODEExec(MODEExecPacket),
    MODETSX(MODETSXPacket),
    TIPPGE(TIPPGEPacket, Option<u64>),
    TIPPGD(TIPPGDPacket, Option<u64>),
    ShortTNT(ShortTNTPacket),
    LongTNT(LongTNTPacket),
    TIP(TIPPacket, Option<u64>),
    FUP(FUPPacket, Option<u64>),
    CYC(CYCPacket),
    EXSTOP(EXSTOPPacket),
    OVF(OVFPacket),
    VMCS(VMCSPacket),
}

impl Packet {
    /// If the packet contains a (non "out of context") TIP update, return the IP value.
    pub(crate) fn target_ip(&self) -> Option<u64> {
        match self {
            Self::TIPPGE(p, prev_tip) => p.target_ip(*prev_tip),
            Self::TIPPGD(p, prev_tip) => p.target_ip(*prev_tip),
            Self::TIP(p, prev_tip) => p.target_ip(*prev_tip),
            Self::FUP(p, prev_tip) => p.target_ip(*prev_tip),
            _ => None,
        }
    }

    pub(crate) fn kind(&self) -> PacketKind {
        match self {
            Self::PSB(_) => PacketKind::PSB,
            Self::CBR(_) => PacketKind::CBR,
            Self::PSBEND(_) => PacketKind::PSBEND,
            Self::PAD(_) => PacketKind::PAD,
            Self::TSC(_) => PacketKind::TSC,
            Self::MTC(_) => PacketKind::MTC,
            Self::MODEExec(_) => PacketKind::MODEExec,
            Self::MODETSX(_) => PacketKind::MODETSX,
            Self::TIPPGE(..) => PacketKind::TIPPGE,
            Self::TIPPGD(..) => PacketKind::TIPPGD,
            Self::ShortTNT(_) => PacketKind::ShortTNT,
            Self::LongTNT(_) => PacketKind::LongTNT,
            Self::TIP(..) => PacketKind::TIP,
            Self::FUP(..) => PacketKind::FUP,
            Self::CYC(_) => PacketKind::CYC,
            Self::EXSTOP(_) => PacketKind::EXSTOP,
            Self::OVF(_) => PacketKind::OVF,
            Self::VMCS(_) => PacketKind::VMCS,
        }
    }

    /// Extract the taken/not-taken decisions from a TNT packet.
    ///
    /// Returns `None` if the packet is not a TNT packet.
    pub(crate) fn tnts(&self) -> Option<Vec<bool>> {
        match self {
            Self::ShortTNT(p) => Some(p.tnts()),
            Self::LongTNT(p) => Some(p.tnts()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{LongTNTPacket, ShortTNTPacket, TSCPacket};
    use deku::DekuContainerRead;

    #[test]
    fn short_tnt() {
        let mk = |branches: u8| ShortTNTPacket { branches };

        assert_eq!(mk(0b1000000).tnts(), vec![false; 6]);
        assert_eq!(mk(0b1111111).tnts(), vec![true; 6]);
        assert_eq!(mk(0b0000011).tnts(), vec![true]);
        assert_eq!(mk(0b0000010).tnts(), vec![false]);
        assert_eq!(
            mk(0b1001001).tnts(),
            vec![false, false, true, false, false, true]
        );
    }

    #[test]
    fn long_tnt() {
        let mk = |bits: u64| LongTNTPacket {
            payload: bits.to_le_bytes()[..6].to_vec(),
        };
        assert_eq!(mk(0b11).tnts(), vec![true]);
        assert_eq!(mk(0b10).tnts(), vec![false]);
        assert_eq!(mk(1 << 47 | 0b1).tnts(), {
            let mut v = vec![false; 46];
            v.push(true);
            v
        });
    }

    #[test]
    fn tsc_value() {
        let bytes = [0x19u8, 0xef, 0xcd, 0xab, 0x89, 0x67, 0x45, 0x23];
        let ((rest, _), pkt) = TSCPacket::from_bytes((&bytes, 0)).unwrap();
        assert!(rest.is_empty());
        assert_eq!(pkt.tsc(), 0x23456789abcdef);
    }
}
