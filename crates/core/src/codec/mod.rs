//! Wire codecs for RTP, RTCP and the legacy vat format.
//!
//! All decoders are pure functions over a byte slice. They walk the input
//! with a length-checked [`Cursor`](cursor::Cursor) and return a
//! [`DecodeError`] for anything short, inconsistent or of an unknown
//! version; they never panic on hostile input.
//!
//! ## RTP vs. vat on the same port
//!
//! The top two bits of the first byte carry the protocol version. RTP
//! (RFC 3550) uses version 2; the older vat audio tool put version 0 there.
//! [`classify`] uses this to route a datagram to the right decoder.
//!
//! | Module | Format | Reference |
//! |--------|--------|-----------|
//! | [`rtp`] | RTP data header, CSRC list, header extension | RFC 3550 §5.1, §5.3.1 |
//! | [`rtcp`] | compound RTCP (SR, RR, SDES, BYE, others opaque) | RFC 3550 §6 |
//! | [`vat`] | vat data and control headers | vat 3.x |
//! | [`payload`] | static payload-type registry | RFC 3551 §6 |

pub mod cursor;
pub mod payload;
pub mod rtcp;
pub mod rtp;
pub mod vat;

pub use payload::{PayloadInfo, PayloadTable};
pub use rtcp::{RtcpCompound, RtcpPacket};
pub use rtp::{RtpHeader, RtpPacket};

/// Current RTP/RTCP protocol version (RFC 3550 §5.1).
pub const RTP_VERSION: u8 = 2;

/// Version number used by vat in the same two bits.
pub const VAT_VERSION: u8 = 0;

/// Why a packet could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Fewer bytes than a fixed header or a declared length requires.
    #[error("{what} truncated: need {needed} bytes, have {available}")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    /// Version bits are not the expected protocol version.
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),

    /// An RTCP sub-packet's length field runs past the end of the datagram.
    #[error("RTCP length {words} words at offset {offset} overruns {available}-byte packet")]
    LengthOverrun {
        offset: usize,
        words: u16,
        available: usize,
    },

    /// Padding count is zero or larger than the data it pads.
    #[error("invalid padding count {count} for {len}-byte body")]
    InvalidPadding { count: u8, len: usize },

    /// A structurally valid packet whose fields contradict each other.
    #[error("malformed {what}: {reason}")]
    Malformed {
        what: &'static str,
        reason: &'static str,
    },
}

/// Protocol a datagram appears to carry, judged from the version bits and
/// the port it arrived on (even = data, odd = control).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Rtp,
    Rtcp,
    VatData,
    VatControl,
    Unknown,
}

impl PacketKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Rtp => "RTP",
            Self::Rtcp => "RTCP",
            Self::VatData => "VATD",
            Self::VatControl => "VATC",
            Self::Unknown => "UKWN",
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Rtcp | Self::VatControl)
    }
}

/// Classify a datagram by its version bits.
///
/// `control` selects between the data and control interpretation, which
/// the wire format cannot distinguish on its own.
pub fn classify(buf: &[u8], control: bool) -> PacketKind {
    let Some(&first) = buf.first() else {
        return PacketKind::Unknown;
    };
    match (first >> 6, control) {
        (RTP_VERSION, false) => PacketKind::Rtp,
        (RTP_VERSION, true) => PacketKind::Rtcp,
        (VAT_VERSION, false) => PacketKind::VatData,
        (VAT_VERSION, true) => PacketKind::VatControl,
        _ => PacketKind::Unknown,
    }
}

/// Strip RTP/RTCP padding (the last octet counts padding bytes, itself
/// included). Returns the body without padding.
pub(crate) fn strip_padding(body: &[u8]) -> Result<&[u8], DecodeError> {
    let Some(&count) = body.last() else {
        return Err(DecodeError::InvalidPadding { count: 0, len: 0 });
    };
    if count == 0 || count as usize > body.len() {
        return Err(DecodeError::InvalidPadding {
            count,
            len: body.len(),
        });
    }
    Ok(&body[..body.len() - count as usize])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_version_and_port() {
        assert_eq!(classify(&[0x80, 0], false), PacketKind::Rtp);
        assert_eq!(classify(&[0x80, 200], true), PacketKind::Rtcp);
        assert_eq!(classify(&[0x00, 0], false), PacketKind::VatData);
        assert_eq!(classify(&[0x00, 1], true), PacketKind::VatControl);
        assert_eq!(classify(&[0x40], false), PacketKind::Unknown);
        assert_eq!(classify(&[], false), PacketKind::Unknown);
    }

    #[test]
    fn padding_is_validated() {
        assert_eq!(strip_padding(&[1, 2, 0, 2]).unwrap(), &[1, 2]);
        assert!(strip_padding(&[1, 0]).is_err());
        assert!(strip_padding(&[9]).is_err());
    }
}
