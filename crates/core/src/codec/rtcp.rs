//! Compound RTCP packets (RFC 3550 §6).
//!
//! A single RTCP datagram carries one or more sub-packets back to back.
//! Each starts with a common header word:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|  count  |      PT       |  length (words - 1)           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Decoding walks the datagram by each sub-packet's length field. The
//! lengths must account for every byte: a length that would run past the
//! end of the datagram aborts decoding with
//! [`DecodeError::LengthOverrun`].

use super::cursor::Cursor;
use super::{DecodeError, RTP_VERSION, strip_padding};

pub const RTCP_SR: u8 = 200;
pub const RTCP_RR: u8 = 201;
pub const RTCP_SDES: u8 = 202;
pub const RTCP_BYE: u8 = 203;
pub const RTCP_APP: u8 = 204;

/// SDES item types (RFC 3550 §6.5).
pub mod sdes {
    pub const END: u8 = 0;
    pub const CNAME: u8 = 1;
    pub const NAME: u8 = 2;
    pub const EMAIL: u8 = 3;
    pub const PHONE: u8 = 4;
    pub const LOC: u8 = 5;
    pub const TOOL: u8 = 6;
    pub const NOTE: u8 = 7;
    pub const PRIV: u8 = 8;
    /// Non-standard item emitted by some early tools.
    pub const SOURCE: u8 = 11;

    /// Display name of an item type, if it has one.
    pub fn name(kind: u8) -> Option<&'static str> {
        Some(match kind {
            END => "end",
            CNAME => "CNAME",
            NAME => "NAME",
            EMAIL => "EMAIL",
            PHONE => "PHONE",
            LOC => "LOC",
            TOOL => "TOOL",
            NOTE => "NOTE",
            PRIV => "PRIV",
            SOURCE => "SOURCE",
            _ => return None,
        })
    }
}

const REPORT_BLOCK_LEN: usize = 24;

/// The header word shared by all RTCP sub-packets, as found on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub padding: bool,
    /// Type-dependent 5-bit count (report blocks, SDES chunks, BYE sources).
    pub count: u8,
    pub packet_type: u8,
    /// Length in 32-bit words minus one, including header and padding.
    pub length: u16,
}

impl CommonHeader {
    /// Total size of the sub-packet in bytes.
    pub fn packet_len(&self) -> usize {
        (self.length as usize + 1) * 4
    }
}

/// Reception report block carried by SR and RR packets (RFC 3550 §6.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: u32,
    /// Fraction lost since the last report, in 1/256 units.
    pub fraction: u8,
    /// Cumulative packets lost; a signed 24-bit quantity on the wire.
    pub lost: i32,
    pub last_seq: u32,
    pub jitter: u32,
    pub lsr: u32,
    pub dlsr: u32,
}

impl ReportBlock {
    fn decode(c: &mut Cursor<'_>) -> Result<Self, DecodeError> {
        let ssrc = c.u32()?;
        let word = c.u32()?;
        let raw_lost = word & 0x00ff_ffff;
        Ok(Self {
            ssrc,
            fraction: (word >> 24) as u8,
            lost: ((raw_lost << 8) as i32) >> 8,
            last_seq: c.u32()?,
            jitter: c.u32()?,
            lsr: c.u32()?,
            dlsr: c.u32()?,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        let word = ((self.fraction as u32) << 24) | (self.lost as u32 & 0x00ff_ffff);
        out.extend_from_slice(&word.to_be_bytes());
        for v in [self.last_seq, self.jitter, self.lsr, self.dlsr] {
            out.extend_from_slice(&v.to_be_bytes());
        }
    }
}

/// One SDES item: type, then up to 255 octets of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesItem {
    pub kind: u8,
    pub data: Vec<u8>,
}

impl SdesItem {
    pub fn new(kind: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }
}

/// Description of one source: an SSRC/CSRC followed by its items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub src: u32,
    pub items: Vec<SdesItem>,
}

/// Body of one RTCP sub-packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport {
        ssrc: u32,
        ntp_sec: u32,
        ntp_frac: u32,
        rtp_timestamp: u32,
        packet_count: u32,
        octet_count: u32,
        reports: Vec<ReportBlock>,
    },
    ReceiverReport {
        ssrc: u32,
        reports: Vec<ReportBlock>,
    },
    SourceDescription {
        chunks: Vec<SdesChunk>,
    },
    Bye {
        sources: Vec<u32>,
        reason: Option<Vec<u8>>,
    },
    /// APP or an unknown packet type; the body is kept opaque.
    Other {
        packet_type: u8,
        count: u8,
        body: Vec<u8>,
    },
}

impl RtcpPacket {
    pub fn packet_type(&self) -> u8 {
        match self {
            Self::SenderReport { .. } => RTCP_SR,
            Self::ReceiverReport { .. } => RTCP_RR,
            Self::SourceDescription { .. } => RTCP_SDES,
            Self::Bye { .. } => RTCP_BYE,
            Self::Other { packet_type, .. } => *packet_type,
        }
    }

    fn count(&self) -> u8 {
        let n = match self {
            Self::SenderReport { reports, .. } | Self::ReceiverReport { reports, .. } => {
                reports.len()
            }
            Self::SourceDescription { chunks } => chunks.len(),
            Self::Bye { sources, .. } => sources.len(),
            Self::Other { count, .. } => *count as usize,
        };
        n.min(31) as u8
    }

    fn decode_body(header: &CommonHeader, body: &[u8]) -> Result<Self, DecodeError> {
        let mut c = Cursor::new(body, "RTCP body");
        let count = header.count as usize;
        let packet = match header.packet_type {
            RTCP_SR => {
                let ssrc = c.u32()?;
                let ntp_sec = c.u32()?;
                let ntp_frac = c.u32()?;
                let rtp_timestamp = c.u32()?;
                let packet_count = c.u32()?;
                let octet_count = c.u32()?;
                Self::SenderReport {
                    ssrc,
                    ntp_sec,
                    ntp_frac,
                    rtp_timestamp,
                    packet_count,
                    octet_count,
                    reports: decode_reports(&mut c, count)?,
                }
            }
            RTCP_RR => {
                let ssrc = c.u32()?;
                Self::ReceiverReport {
                    ssrc,
                    reports: decode_reports(&mut c, count)?,
                }
            }
            RTCP_SDES => {
                let mut chunks = Vec::with_capacity(count);
                for _ in 0..count {
                    chunks.push(decode_sdes_chunk(&mut c)?);
                }
                Self::SourceDescription { chunks }
            }
            RTCP_BYE => {
                let mut sources = Vec::with_capacity(count);
                for _ in 0..count {
                    sources.push(c.u32()?);
                }
                let reason = if c.is_empty() || c.peek_u8()? == 0 && c.remaining() < 4 {
                    None
                } else {
                    let len = c.u8()? as usize;
                    Some(c.bytes(len)?.to_vec())
                };
                Self::Bye { sources, reason }
            }
            packet_type => Self::Other {
                packet_type,
                count: header.count,
                body: body.to_vec(),
            },
        };
        Ok(packet)
    }

    /// Serialize this sub-packet, header included, onto `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&[0; 4]);

        match self {
            Self::SenderReport {
                ssrc,
                ntp_sec,
                ntp_frac,
                rtp_timestamp,
                packet_count,
                octet_count,
                reports,
            } => {
                for v in [ssrc, ntp_sec, ntp_frac, rtp_timestamp, packet_count, octet_count] {
                    out.extend_from_slice(&v.to_be_bytes());
                }
                reports.iter().take(31).for_each(|r| r.write(out));
            }
            Self::ReceiverReport { ssrc, reports } => {
                out.extend_from_slice(&ssrc.to_be_bytes());
                reports.iter().take(31).for_each(|r| r.write(out));
            }
            Self::SourceDescription { chunks } => {
                for chunk in chunks.iter().take(31) {
                    let chunk_start = out.len();
                    out.extend_from_slice(&chunk.src.to_be_bytes());
                    for item in &chunk.items {
                        let len = item.data.len().min(255);
                        out.push(item.kind);
                        out.push(len as u8);
                        out.extend_from_slice(&item.data[..len]);
                    }
                    out.push(sdes::END);
                    pad_to_word(out, chunk_start);
                }
            }
            Self::Bye { sources, reason } => {
                for src in sources.iter().take(31) {
                    out.extend_from_slice(&src.to_be_bytes());
                }
                if let Some(reason) = reason {
                    let len = reason.len().min(255);
                    out.push(len as u8);
                    out.extend_from_slice(&reason[..len]);
                    pad_to_word(out, start);
                }
            }
            Self::Other { body, .. } => {
                out.extend_from_slice(body);
                pad_to_word(out, start);
            }
        }

        let words = ((out.len() - start) / 4 - 1) as u16;
        out[start] = (RTP_VERSION << 6) | self.count();
        out[start + 1] = self.packet_type();
        out[start + 2..start + 4].copy_from_slice(&words.to_be_bytes());
    }
}

fn pad_to_word(out: &mut Vec<u8>, from: usize) {
    while (out.len() - from) % 4 != 0 {
        out.push(0);
    }
}

fn decode_reports(c: &mut Cursor<'_>, count: usize) -> Result<Vec<ReportBlock>, DecodeError> {
    if c.remaining() < count * REPORT_BLOCK_LEN {
        return Err(DecodeError::Truncated {
            what: "RTCP report blocks",
            needed: c.position() + count * REPORT_BLOCK_LEN,
            available: c.position() + c.remaining(),
        });
    }
    (0..count).map(|_| ReportBlock::decode(c)).collect()
}

fn decode_sdes_chunk(c: &mut Cursor<'_>) -> Result<SdesChunk, DecodeError> {
    let src = c.u32()?;
    let mut items = Vec::new();
    loop {
        let kind = c.u8()?;
        if kind == sdes::END {
            break;
        }
        let len = c.u8()? as usize;
        items.push(SdesItem {
            kind,
            data: c.bytes(len)?.to_vec(),
        });
    }
    // chunks end on a word boundary; bodies begin on one, so align locally
    let pad = (4 - (c.position() & 3)) & 3;
    c.skip(pad.min(c.remaining()))?;
    Ok(SdesChunk { src, items })
}

/// A decoded sub-packet together with the header it was found under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpSubPacket {
    pub header: CommonHeader,
    pub packet: RtcpPacket,
}

/// A compound RTCP datagram.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcpCompound {
    pub packets: Vec<RtcpSubPacket>,
}

impl RtcpCompound {
    /// Build a compound packet for encoding; headers are computed on write.
    pub fn from_packets(packets: impl IntoIterator<Item = RtcpPacket>) -> Self {
        Self {
            packets: packets
                .into_iter()
                .map(|packet| RtcpSubPacket {
                    header: CommonHeader {
                        padding: false,
                        count: packet.count(),
                        packet_type: packet.packet_type(),
                        length: 0,
                    },
                    packet,
                })
                .collect(),
        }
    }

    /// Decode every sub-packet in `buf`.
    ///
    /// On success the declared lengths summed exactly to `buf.len()`.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.is_empty() {
            return Err(DecodeError::Truncated {
                what: "RTCP packet",
                needed: 4,
                available: 0,
            });
        }
        let mut c = Cursor::new(buf, "RTCP packet");
        let mut packets = Vec::new();

        while !c.is_empty() {
            let offset = c.position();
            let mut head = Cursor::new(c.rest(), "RTCP header");
            let b0 = head.u8()?;
            let version = b0 >> 6;
            if version != RTP_VERSION {
                return Err(DecodeError::UnsupportedVersion(version));
            }
            let packet_type = head.u8()?;
            let length = head.u16()?;
            let header = CommonHeader {
                padding: b0 & 0x20 != 0,
                count: b0 & 0x1f,
                packet_type,
                length,
            };

            let total = header.packet_len();
            if total > c.remaining() {
                return Err(DecodeError::LengthOverrun {
                    offset,
                    words: length,
                    available: buf.len(),
                });
            }
            let mut sub = c.split(total, "RTCP sub-packet")?;
            sub.skip(4)?;
            let body = if header.padding {
                strip_padding(sub.rest())?
            } else {
                sub.rest()
            };
            let packet = RtcpPacket::decode_body(&header, body)?;
            packets.push(RtcpSubPacket { header, packet });
        }

        Ok(Self { packets })
    }

    /// Serialize all sub-packets back to back.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for sub in &self.packets {
            sub.packet.write(&mut out);
        }
        out
    }
}
