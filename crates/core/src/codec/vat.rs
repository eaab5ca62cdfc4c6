//! Legacy vat audio format (version 0 in the RTP version bits).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=0|   NSID    |T|   | format  |         Conference ID         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                Timestamp (in audio samples)                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |              NSID speaker ids (32 bits each)                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! vat carries no sequence number, which is why relaying it as RTP needs
//! the [`StreamTracker`](crate::translate::StreamTracker).

use super::cursor::Cursor;
use super::{DecodeError, VAT_VERSION};

pub const DATA_HEADER_LEN: usize = 8;
pub const CONTROL_HEADER_LEN: usize = 4;

/// New-talkspurt flag in the data header.
pub const FLAG_NEW_TALKSPURT: u8 = 0x80;
const FORMAT_MASK: u8 = 0x1f;
const NSID_MASK: u8 = 0x3f;

/// Control message type carrying a site id string.
pub const CONTROL_ID: u8 = 1;

/// vat audio encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Mulaw8,
    Celp,
    G721,
    Gsm,
    G723,
    L16Mono16k,
    L16Stereo44k,
    Lpc4,
    Lpc1,
    Idvi,
    Undefined(u8),
}

impl AudioFormat {
    pub fn from_bits(bits: u8) -> Self {
        match bits & FORMAT_MASK {
            0 => Self::Mulaw8,
            1 => Self::Celp,
            2 => Self::G721,
            3 => Self::Gsm,
            4 => Self::G723,
            26 => Self::L16Mono16k,
            27 => Self::L16Stereo44k,
            28 => Self::Lpc4,
            29 => Self::Lpc1,
            30 => Self::Idvi,
            other => Self::Undefined(other),
        }
    }

    /// RTP payload type and sample count for `payload_len` bytes of this
    /// format, or `None` when no static RTP payload type matches.
    ///
    /// G.721 and G.723 keep their vat numbers, which happen to match the
    /// historical RTP assignments; their sample counts are approximate.
    pub fn rtp_mapping(self, payload_len: usize) -> Option<(u8, u32)> {
        let len = payload_len as u32;
        match self {
            Self::Mulaw8 => Some((0, len)),
            Self::G721 => Some((2, len)),
            Self::Gsm => Some((3, (len / 33) * 160)),
            Self::G723 => Some((4, len)),
            // 4-byte DVI state header, then two samples per byte
            Self::Idvi => Some((5, len.saturating_sub(4) * 2)),
            _ => None,
        }
    }
}

/// vat data packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VatHeader {
    pub flags: u8,
    pub conference_id: u16,
    /// Timestamp in audio samples.
    pub timestamp: u32,
    pub speaker_ids: Vec<u32>,
}

impl VatHeader {
    pub fn new_talkspurt(&self) -> bool {
        self.flags & FLAG_NEW_TALKSPURT != 0
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::from_bits(self.flags)
    }

    /// Header length: eight bytes plus four per speaker id.
    pub fn len(&self) -> usize {
        DATA_HEADER_LEN + 4 * self.speaker_ids.len()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut c = Cursor::new(buf, "vat header");
        let b0 = c.u8()?;
        if b0 >> 6 != VAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(b0 >> 6));
        }
        let flags = c.u8()?;
        let conference_id = c.u16()?;
        let timestamp = c.u32()?;
        let nsid = (b0 & NSID_MASK) as usize;
        let mut speaker_ids = Vec::with_capacity(nsid);
        for _ in 0..nsid {
            speaker_ids.push(c.u32()?);
        }
        Ok(Self {
            flags,
            conference_id,
            timestamp,
            speaker_ids,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        let nsid = self.speaker_ids.len().min(NSID_MASK as usize);
        out.push((VAT_VERSION << 6) | nsid as u8);
        out.push(self.flags);
        out.extend_from_slice(&self.conference_id.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        for id in &self.speaker_ids[..nsid] {
            out.extend_from_slice(&id.to_be_bytes());
        }
    }
}

/// vat control (session port) message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VatControl {
    pub flags: u8,
    pub message_type: u8,
    pub conference_id: u16,
    /// Message body after the four-byte header.
    pub body: Vec<u8>,
}

impl VatControl {
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut c = Cursor::new(buf, "vat control header");
        let flags = c.u8()?;
        if flags >> 6 != VAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(flags >> 6));
        }
        let message_type = c.u8()?;
        let conference_id = c.u16()?;
        Ok(Self {
            flags,
            message_type,
            conference_id,
            body: c.rest().to_vec(),
        })
    }

    /// Site id of an ID message: the body up to its NUL terminator.
    pub fn site_id(&self) -> Option<&[u8]> {
        if self.message_type != CONTROL_ID {
            return None;
        }
        let end = self
            .body
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.body.len());
        Some(&self.body[..end])
    }
}
