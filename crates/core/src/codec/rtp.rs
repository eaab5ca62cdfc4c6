use super::cursor::Cursor;
use super::{DecodeError, RTP_VERSION, strip_padding};

/// Size of the fixed part of an RTP header.
pub const FIXED_HEADER_LEN: usize = 12;

/// Maximum number of CSRC entries (4-bit CC field).
pub const MAX_CSRC: usize = 15;

/// RTP header extension (RFC 3550 §5.3.1).
///
/// Only the framing is interpreted: a 16-bit profile-defined tag and the
/// extension body, whose length on the wire is counted in 32-bit words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderExtension {
    pub profile: u16,
    /// Extension body; a multiple of four bytes.
    pub data: Vec<u8>,
}

impl HeaderExtension {
    /// Body length in 32-bit words as written to the wire.
    pub fn words(&self) -> u16 {
        (self.data.len() / 4) as u16
    }
}

/// RTP fixed header plus CSRC list and optional extension (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |                       CSRC list (0-15)                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |      profile tag (X=1)        |     length in 32-bit words    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The version is not stored: decoding rejects anything but version 2 and
/// encoding always writes 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// Padding flag (P). Set when the payload carries trailing padding.
    pub padding: bool,
    /// Marker bit (M), profile-defined; for audio the start of a talkspurt.
    pub marker: bool,
    /// RTP payload type (7-bit, RFC 3551).
    pub payload_type: u8,
    pub sequence: u16,
    /// Media timestamp in payload clock ticks.
    pub timestamp: u32,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    /// Contributing sources; at most [`MAX_CSRC`] are written.
    pub csrc: Vec<u32>,
    pub extension: Option<HeaderExtension>,
}

impl RtpHeader {
    /// Header with no padding, CSRCs or extension.
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            padding: false,
            marker: false,
            payload_type: payload_type & 0x7f,
            sequence,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension: None,
        }
    }

    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    fn csrc_count(&self) -> usize {
        self.csrc.len().min(MAX_CSRC)
    }

    /// Encoded header length: `12 + 4*CC`, plus `4 + 4*len` with an extension.
    pub fn len(&self) -> usize {
        let mut len = FIXED_HEADER_LEN + 4 * self.csrc_count();
        if let Some(ext) = &self.extension {
            len += 4 + 4 * ext.words() as usize;
        }
        len
    }

    /// Serialize the header onto `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        let cc = self.csrc_count();
        let first_byte = (RTP_VERSION << 6)
            | ((self.padding as u8) << 5)
            | ((self.extension.is_some() as u8) << 4)
            | cc as u8;
        let second_byte = ((self.marker as u8) << 7) | (self.payload_type & 0x7f);

        out.reserve(self.len());
        out.push(first_byte);
        out.push(second_byte);
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        for csrc in &self.csrc[..cc] {
            out.extend_from_slice(&csrc.to_be_bytes());
        }
        if let Some(ext) = &self.extension {
            let words = ext.words();
            out.extend_from_slice(&ext.profile.to_be_bytes());
            out.extend_from_slice(&words.to_be_bytes());
            out.extend_from_slice(&ext.data[..words as usize * 4]);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        self.write(&mut out);
        out
    }

    /// Decode a header from the front of `buf`. Returns the header and the
    /// number of bytes it occupies.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        let mut c = Cursor::new(buf, "RTP header");
        let b0 = c.u8()?;
        let version = b0 >> 6;
        if version != RTP_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let b1 = c.u8()?;
        let sequence = c.u16()?;
        let timestamp = c.u32()?;
        let ssrc = c.u32()?;

        let cc = (b0 & 0x0f) as usize;
        let mut csrc = Vec::with_capacity(cc);
        for _ in 0..cc {
            csrc.push(c.u32()?);
        }

        let extension = if b0 & 0x10 != 0 {
            let profile = c.u16()?;
            let words = c.u16()?;
            let data = c.bytes(words as usize * 4)?.to_vec();
            Some(HeaderExtension { profile, data })
        } else {
            None
        };

        let header = Self {
            padding: b0 & 0x20 != 0,
            marker: b1 & 0x80 != 0,
            payload_type: b1 & 0x7f,
            sequence,
            timestamp,
            ssrc,
            csrc,
            extension,
        };
        Ok((header, c.position()))
    }
}

/// Length of the RTP header at the front of `buf` without materializing it.
///
/// Used to truncate captured packets to their header or to a fixed number
/// of payload bytes.
pub fn header_len(buf: &[u8]) -> Result<usize, DecodeError> {
    let mut c = Cursor::new(buf, "RTP header");
    let b0 = c.u8()?;
    if b0 >> 6 != RTP_VERSION {
        return Err(DecodeError::UnsupportedVersion(b0 >> 6));
    }
    c.skip(FIXED_HEADER_LEN - 1)?;
    c.skip(4 * (b0 & 0x0f) as usize)?;
    if b0 & 0x10 != 0 {
        c.skip(2)?;
        let words = c.u16()?;
        c.skip(words as usize * 4)?;
    }
    Ok(c.position())
}

/// A decoded RTP packet borrowing its payload from the datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket<'a> {
    pub header: RtpHeader,
    /// Payload with any padding removed.
    pub payload: &'a [u8],
    /// Number of padding bytes that followed the payload.
    pub padding_len: usize,
}

impl<'a> RtpPacket<'a> {
    pub fn decode(buf: &'a [u8]) -> Result<Self, DecodeError> {
        let (header, hlen) = RtpHeader::decode(buf)?;
        let body = &buf[hlen..];
        let payload = if header.padding {
            strip_padding(body)?
        } else {
            body
        };
        Ok(Self {
            padding_len: body.len() - payload.len(),
            header,
            payload,
        })
    }

    /// Serialize header and payload. Padding is not re-added; the padding
    /// flag is cleared in the output.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut header = self.header.clone();
        header.padding = false;
        let mut out = Vec::with_capacity(header.len() + self.payload.len());
        header.write(&mut out);
        out.extend_from_slice(self.payload);
        out
    }
}
