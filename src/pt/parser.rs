//! The packet parser.
//!
//! Unlike a one-shot parser over a single borrowed buffer, this parser is fed
//! chunk by chunk: the stream decoder refills it whenever the queue manager
//! hands out the next byte range. Refilling with non-consecutive bytes (a
//! snapshot re-read or lost data) discards the inter-packet state, since IP
//! compression and the PSB+ state cannot be trusted across a gap.

use super::packets::*;
use deku::DekuContainerRead;
use std::sync::Arc;

/// The full PSB magic, used to synchronise mid-stream.
const PSB_MAGIC: &[u8] = b"\x02\x82\x02\x82\x02\x82\x02\x82\x02\x82\x02\x82\x02\x82\x02\x82";

#[derive(Clone, Copy, Debug)]
enum PacketParserState {
    /// The "normal" decoding state.
    Normal,
    /// We are decoding a PSB+ sequence.
    PSBPlus,
}

impl PacketParserState {
    /// Returns the kinds of packet that are valid for the state.
    fn valid_packets(&self) -> &'static [PacketKind] {
        // The parser attempts to match packet kinds in the order they appear
        // in the returned slice, so most frequently expected kinds come
        // first.
        match self {
            Self::Normal => &[
                PacketKind::ShortTNT,
                PacketKind::PAD,
                PacketKind::TIP,
                PacketKind::FUP,
                PacketKind::CYC,
                PacketKind::TSC,
                PacketKind::MTC,
                PacketKind::LongTNT,
                PacketKind::PSB,
                PacketKind::MODEExec,
                PacketKind::MODETSX,
                PacketKind::CBR,
                PacketKind::TIPPGE,
                PacketKind::TIPPGD,
                PacketKind::EXSTOP,
                PacketKind::OVF,
            ],
            Self::PSBPlus => &[
                PacketKind::PAD,
                PacketKind::TSC,
                PacketKind::MTC,
                PacketKind::CBR,
                PacketKind::FUP,
                PacketKind::MODEExec,
                PacketKind::MODETSX,
                PacketKind::PSBEND,
                PacketKind::OVF,
                PacketKind::VMCS,
            ],
        }
    }

    /// Check if the parser needs to transition to a new state as a result of
    /// parsing a certain kind of packet.
    fn transition(&mut self, pkt_kind: PacketKind) {
        let new = match (*self, pkt_kind) {
            (Self::Normal, PacketKind::PSB) => Self::PSBPlus,
            (Self::PSBPlus, PacketKind::PSBEND) => Self::Normal,
            // An overflow inside PSB+ aborts the sequence.
            (Self::PSBPlus, PacketKind::OVF) => Self::Normal,
            _ => return, // No state transition.
        };
        *self = new;
    }
}

/// Raised by [PacketParser::next_packet].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ParserError {
    /// The current buffer is exhausted. Refill and retry.
    NoMoreBytes,
    /// No packet kind matched at this buffer offset.
    BadPacket { off: usize },
}

pub(crate) struct PacketParser {
    /// The raw trace bytes currently being parsed.
    data: Arc<[u8]>,
    /// Next unconsumed position within `data`.
    pos: usize,
    /// The parser operates as a state machine. This field keeps track of which state we are in.
    state: PacketParserState,
    /// The most recent Target IP (TIP) value that we've seen. This is needed because updated TIP
    /// values are sometimes compressed using bits from the previous TIP value. `None` until the
    /// first full IP after a gap.
    prev_tip: Option<u64>,
}

/// Attempt to read the packet of type `$packet` using deku. On success wrap the packet up into the
/// corresponding discriminant of `Packet`.
macro_rules! read_to_packet {
    ($packet: ty, $pt_bytes: expr, $discr: expr) => {
        <$packet>::from_bytes(($pt_bytes, 0)).map(|(r, p)| (r, $discr(p)))
    };
}

/// Same as `read_to_packet!`, but with extra logic for dealing with packets which encode a TIP.
macro_rules! read_to_packet_tip {
    ($packet: ty, $pt_bytes: expr, $discr: expr, $prev_tip: expr) => {
        <$packet>::from_bytes(($pt_bytes, 0)).map(|(r, p)| (r, $discr(p, $prev_tip)))
    };
}

impl PacketParser {
    pub(crate) fn new() -> Self {
        Self {
            data: Arc::from(&[][..]),
            pos: 0,
            state: PacketParserState::Normal,
            prev_tip: None,
        }
    }

    /// Replace the exhausted buffer with the next one. `consecutive` says
    /// whether `data` directly follows the previous buffer in the original
    /// byte stream.
    pub(crate) fn refill(&mut self, data: Arc<[u8]>, consecutive: bool) {
        self.data = data;
        self.pos = 0;
        if !consecutive {
            self.state = PacketParserState::Normal;
            self.prev_tip = None;
        }
    }

    pub(crate) fn exhausted(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Byte offset of the next unconsumed byte in the current buffer.
    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    /// Scan forward for the next PSB and position the parser on it. Returns
    /// false (with the buffer exhausted) if there is none.
    pub(crate) fn sync_to_psb(&mut self) -> bool {
        let rest = &self.data[self.pos.min(self.data.len())..];
        match rest
            .windows(PSB_MAGIC.len())
            .position(|w| w == PSB_MAGIC)
        {
            Some(i) => {
                self.pos += i;
                self.state = PacketParserState::Normal;
                self.prev_tip = None;
                true
            }
            None => {
                self.pos = self.data.len();
                false
            }
        }
    }

    /// Attempt to parse a packet of the specified `PacketKind`.
    fn parse_kind(&mut self, kind: PacketKind) -> Option<Packet> {
        let bytes = &self.data[self.pos..];
        let parse_res = match kind {
            PacketKind::PSB => read_to_packet!(PSBPacket, bytes, Packet::PSB),
            PacketKind::CBR => read_to_packet!(CBRPacket, bytes, Packet::CBR),
            PacketKind::PSBEND => read_to_packet!(PSBENDPacket, bytes, Packet::PSBEND),
            PacketKind::PAD => read_to_packet!(PADPacket, bytes, Packet::PAD),
            PacketKind::TSC => read_to_packet!(TSCPacket, bytes, Packet::TSC),
            PacketKind::MTC => read_to_packet!(MTCPacket, bytes, Packet::MTC),
            PacketKind::MODEExec => read_to_packet!(MODEExecPacket, bytes, Packet::MODEExec),
            PacketKind::MODETSX => read_to_packet!(MODETSXPacket, bytes, Packet::MODETSX),
            PacketKind::TIPPGE => {
                read_to_packet_tip!(TIPPGEPacket, bytes, Packet::TIPPGE, self.prev_tip)
            }
            PacketKind::TIPPGD => {
                read_to_packet_tip!(TIPPGDPacket, bytes, Packet::TIPPGD, self.prev_tip)
            }
            PacketKind::ShortTNT => read_to_packet!(ShortTNTPacket, bytes, Packet::ShortTNT),
            PacketKind::LongTNT => read_to_packet!(LongTNTPacket, bytes, Packet::LongTNT),
            PacketKind::TIP => read_to_packet_tip!(TIPPacket, bytes, Packet::TIP, self.prev_tip),
            PacketKind::FUP => read_to_packet_tip!(FUPPacket, bytes, Packet::FUP, self.prev_tip),
            PacketKind::CYC => read_to_packet!(CYCPacket, bytes, Packet::CYC),
            PacketKind::EXSTOP => read_to_packet!(EXSTOPPacket, bytes, Packet::EXSTOP),
            PacketKind::OVF => read_to_packet!(OVFPacket, bytes, Packet::OVF),
            PacketKind::VMCS => read_to_packet!(VMCSPacket, bytes, Packet::VMCS),
        };
        if let Ok(((remain, bit_off), pkt)) = parse_res {
            // Packets are always byte-aligned.
            debug_assert_eq!(bit_off, 0);
            self.pos += bytes.len() - remain.len();
            Some(pkt)
        } else {
            None
        }
    }

    /// Attempt to parse a packet for the current parser state.
    fn parse_state(&mut self) -> Result<Packet, ParserError> {
        for kind in self.state.valid_packets() {
            if let Some(pkt) = self.parse_kind(*kind) {
                return Ok(pkt);
            }
        }
        // Nothing matched. Report the position and step over the offending
        // byte so the caller can resynchronise.
        let off = self.pos;
        self.pos += 1;
        Err(ParserError::BadPacket { off })
    }

    /// Attempt to parse a packet.
    pub(crate) fn next_packet(&mut self) -> Result<Packet, ParserError> {
        if self.exhausted() {
            return Err(ParserError::NoMoreBytes);
        }
        let pkt = self.parse_state()?;

        // If the packet contains an updated TIP, then cache it.
        if let Some(tip) = pkt.target_ip() {
            self.prev_tip = Some(tip);
        }

        // See if the packet we just parsed triggers a state transition.
        self.state.transition(pkt.kind());

        Ok(pkt)
    }
}
