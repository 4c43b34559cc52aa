//! Packet-level decoding of the raw trace byte stream.

pub(crate) mod packets;
pub(crate) mod parser;

#[cfg(test)]
pub(crate) mod testutil;
