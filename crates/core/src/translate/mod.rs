//! RTP relay between unicast and multicast sides, with vat-to-RTP
//! translation.
//!
//! Each side is an [`Endpoint`] with a receive socket on its data and
//! control ports and one send socket. A datagram received on one side is
//! relayed to every other side:
//!
//! | Received | From side | Relayed as |
//! |----------|-----------|------------|
//! | RTP or RTCP (version 2) | any | unchanged |
//! | anything | unicast | unchanged |
//! | vat data | multicast | RTP, sequenced by a [`StreamTracker`] |
//! | vat ID control | multicast | RTCP: empty RR + SDES (CNAME, NAME) |
//!
//! Sides whose address is unspecified (`/port`) only receive; nothing is
//! sent to them.

mod endpoint;
mod stream;

pub use endpoint::{DEFAULT_TTL, Endpoint};
pub use stream::{StreamIdentity, StreamTracker};

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use crate::codec::rtcp::{SdesChunk, SdesItem, sdes};
use crate::codec::vat::{VatControl, VatHeader};
use crate::codec::{DecodeError, PacketKind, RtcpCompound, RtcpPacket, RtpHeader, classify};
use crate::error::Result;
use crate::net::{self, MAX_DATAGRAM, PortPair};
use crate::reactor::{Interest, Reactor};

/// Most sides a relay accepts.
pub const MAX_ENDPOINTS: usize = 10;

/// Payload type given to vat audio without a static RTP equivalent.
pub const UNMAPPED_PAYLOAD_TYPE: u8 = 115;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatorConfig {
    pub endpoints: Vec<Endpoint>,
    /// TTL of endpoints that name none.
    pub default_ttl: u8,
}

impl TranslatorConfig {
    /// Parse `[host]/port[/ttl]` arguments. Ports must be even; sides past
    /// [`MAX_ENDPOINTS`] are ignored.
    pub fn parse<S: AsRef<str>>(args: &[S], default_ttl: u8) -> Result<Self> {
        if args.len() > MAX_ENDPOINTS {
            tracing::warn!(
                given = args.len(),
                max = MAX_ENDPOINTS,
                "too many endpoints, ignoring the rest"
            );
        }
        let endpoints = args
            .iter()
            .take(MAX_ENDPOINTS)
            .map(|a| Endpoint::parse(a.as_ref(), default_ttl)?.require_even_port())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            endpoints,
            default_ttl,
        })
    }
}

/// A datagram to send on behalf of a side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    /// Index of the destination side; its send socket is used.
    pub side: usize,
    pub dest: SocketAddrV4,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslatorStats {
    pub received: u64,
    /// Relayed unchanged.
    pub forwarded: u64,
    /// Converted from vat.
    pub translated: u64,
    pub dropped: u64,
}

/// Relay decisions, independent of sockets.
#[derive(Debug)]
pub struct Translator {
    sides: Vec<Endpoint>,
    tracker: StreamTracker,
    stats: TranslatorStats,
}

impl Translator {
    pub fn new(config: TranslatorConfig) -> Self {
        Self::with_tracker(config, StreamTracker::new())
    }

    pub fn with_tracker(config: TranslatorConfig, tracker: StreamTracker) -> Self {
        Self {
            sides: config.endpoints,
            tracker,
            stats: TranslatorStats::default(),
        }
    }

    pub fn sides(&self) -> &[Endpoint] {
        &self.sides
    }

    pub fn stats(&self) -> TranslatorStats {
        self.stats
    }

    pub fn tracker(&self) -> &StreamTracker {
        &self.tracker
    }

    /// Datagrams to send for `packet`, received on `side`'s data or control
    /// port from `from`.
    pub fn handle(
        &mut self,
        side: usize,
        control: bool,
        from: SocketAddrV4,
        packet: &[u8],
    ) -> Vec<Forward> {
        self.stats.received += 1;
        let kind = classify(packet, control);
        let multicast = self.sides.get(side).is_some_and(Endpoint::is_multicast);
        tracing::trace!(side, kind = kind.label(), len = packet.len(), %from, "received");

        if matches!(kind, PacketKind::Rtp | PacketKind::Rtcp) || !multicast {
            self.stats.forwarded += 1;
            return self.fan_out(side, control, packet);
        }

        let translated = match kind {
            PacketKind::VatData => self.vat_to_rtp(*from.ip(), packet).map(Some),
            PacketKind::VatControl => VatControl::decode(packet)
                .map(|ctl| Self::vat_id_to_rtcp(*from.ip(), &ctl)),
            _ => Err(DecodeError::UnsupportedVersion(packet.first().map_or(0, |b| b >> 6))),
        };
        match translated {
            Ok(Some(data)) => {
                self.stats.translated += 1;
                self.fan_out(side, control, &data)
            }
            Ok(None) => {
                self.stats.dropped += 1;
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(side, %from, error = %e, "dropping undecodable packet");
                self.stats.dropped += 1;
                Vec::new()
            }
        }
    }

    fn fan_out(&self, from_side: usize, control: bool, data: &[u8]) -> Vec<Forward> {
        self.sides
            .iter()
            .enumerate()
            .filter(|(i, ep)| *i != from_side && !ep.is_unspecified())
            .map(|(i, ep)| Forward {
                side: i,
                dest: ep.addr_for(control),
                data: data.to_vec(),
            })
            .collect()
    }

    /// Rewrite a vat data packet from `from` as RTP. The SSRC is the
    /// sender's address and the marker bit is the new-talkspurt flag.
    pub fn vat_to_rtp(
        &mut self,
        from: Ipv4Addr,
        packet: &[u8],
    ) -> std::result::Result<Vec<u8>, DecodeError> {
        let vat = VatHeader::decode(packet)?;
        let payload = &packet[vat.len()..];
        let format = vat.format();
        let (pt, samples) = format.rtp_mapping(payload.len()).unwrap_or_else(|| {
            tracing::warn!(?format, "no RTP payload type for vat format");
            (UNMAPPED_PAYLOAD_TYPE, payload.len() as u32)
        });

        let ssrc = u32::from(from);
        let marker = vat.new_talkspurt();
        let seq = self.tracker.next_sequence(
            ssrc,
            vat.timestamp,
            vat.timestamp.wrapping_add(samples),
            marker,
        );
        let header = RtpHeader::new(pt, seq, vat.timestamp, ssrc).with_marker(marker);
        let mut out = Vec::with_capacity(header.len() + payload.len());
        header.write(&mut out);
        out.extend_from_slice(payload);
        Ok(out)
    }

    /// RTCP equivalent of a vat ID message, `None` for other control
    /// messages.
    pub fn vat_id_to_rtcp(from: Ipv4Addr, ctl: &VatControl) -> Option<Vec<u8>> {
        let site = ctl.site_id()?;
        let ssrc = u32::from(from);
        let compound = RtcpCompound::from_packets([
            RtcpPacket::ReceiverReport {
                ssrc,
                reports: Vec::new(),
            },
            RtcpPacket::SourceDescription {
                chunks: vec![SdesChunk {
                    src: ssrc,
                    items: vec![
                        SdesItem::new(sdes::CNAME, from.to_string()),
                        SdesItem::new(sdes::NAME, site),
                    ],
                }],
            },
        ]);
        Some(compound.to_bytes())
    }
}

/// A [`Translator`] bound to sockets, run as the state of a [`Reactor`].
#[derive(Debug)]
pub struct Relay {
    translator: Translator,
    receivers: Vec<PortPair>,
    senders: Vec<UdpSocket>,
    buf: Vec<u8>,
}

impl Relay {
    /// Open the receive pair and send socket of every side.
    pub fn bind(translator: Translator) -> Result<Self> {
        let mut receivers = Vec::with_capacity(translator.sides.len());
        let mut senders = Vec::with_capacity(translator.sides.len());
        for ep in &translator.sides {
            receivers.push(PortPair::bind(ep)?);
            senders.push(net::bind_sender(ep.ttl, None)?);
            tracing::info!(side = %ep, multicast = ep.is_multicast(), "side open");
        }
        Ok(Self {
            translator,
            receivers,
            senders,
            buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    /// Register every receive socket with `reactor`.
    pub fn register(reactor: &mut Reactor<Relay>) -> Result<()> {
        use std::os::fd::AsRawFd;

        let mut fds = Vec::new();
        for (side, pair) in reactor.state().receivers.iter().enumerate() {
            fds.push((side, false, pair.data.as_raw_fd()));
            fds.push((side, true, pair.control.as_raw_fd()));
        }
        for (side, control, fd) in fds {
            reactor.register(fd, Interest::Read, move |r: &mut Reactor<Relay>, _| {
                r.state_mut().on_readable(side, control);
            })?;
        }
        Ok(())
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    fn on_readable(&mut self, side: usize, control: bool) {
        loop {
            let socket = self.receivers[side].socket(control);
            let (len, from) = match net::recv(socket, &mut self.buf) {
                Ok(Some(got)) => got,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(side, control, error = %e, "receive failed");
                    return;
                }
            };
            let forwards = self.translator.handle(side, control, from, &self.buf[..len]);
            for fwd in forwards {
                if let Err(e) = self.senders[fwd.side].send_to(&fwd.data, fwd.dest) {
                    tracing::warn!(dest = %fwd.dest, error = %e, "send failed, packet dropped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RtpPacket;
    use crate::codec::vat::{CONTROL_ID, FLAG_NEW_TALKSPURT};

    const SENDER: Ipv4Addr = Ipv4Addr::new(10, 1, 2, 3);

    fn translator(args: &[&str]) -> Translator {
        let config = TranslatorConfig::parse(args, DEFAULT_TTL).unwrap();
        Translator::with_tracker(config, StreamTracker::with_seed(|| 500))
    }

    fn from() -> SocketAddrV4 {
        SocketAddrV4::new(SENDER, 40000)
    }

    fn vat_data(flags: u8, ts: u32, payload_len: usize) -> Vec<u8> {
        let mut buf = Vec::new();
        VatHeader {
            flags,
            conference_id: 1,
            timestamp: ts,
            speaker_ids: Vec::new(),
        }
        .write(&mut buf);
        buf.extend(std::iter::repeat_n(0x55, payload_len));
        buf
    }

    // --- configuration ---

    #[test]
    fn config_requires_even_ports() {
        assert!(TranslatorConfig::parse(&["224.2.0.1/5004", "10.0.0.1/6001"], 16).is_err());
        let config = TranslatorConfig::parse(&["224.2.0.1/5004/4", "10.0.0.1/6000"], 16).unwrap();
        assert_eq!(config.endpoints[0].ttl, 4);
        assert_eq!(config.endpoints[1].ttl, 16);
    }

    #[test]
    fn config_caps_endpoint_count() {
        let args: Vec<String> = (0..12).map(|i| format!("10.0.0.{i}/6000")).collect();
        let config = TranslatorConfig::parse(&args, 16).unwrap();
        assert_eq!(config.endpoints.len(), MAX_ENDPOINTS);
    }

    // --- forwarding ---

    #[test]
    fn rtp_forwarded_unchanged_to_other_sides() {
        let mut t = translator(&["224.2.0.1/5004", "10.0.0.1/6000", "10.0.0.2/7000"]);
        let pkt = RtpHeader::new(0, 1, 2, 3).to_bytes();
        let out = t.handle(0, false, from(), &pkt);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].side, 1);
        assert_eq!(out[0].dest, "10.0.0.1:6000".parse().unwrap());
        assert_eq!(out[1].dest, "10.0.0.2:7000".parse().unwrap());
        assert!(out.iter().all(|f| f.data == pkt));
    }

    #[test]
    fn control_goes_to_odd_port() {
        let mut t = translator(&["224.2.0.1/5004", "10.0.0.1/6000"]);
        let rr = [0x80, 201, 0, 1, 0, 0, 0, 7];
        let out = t.handle(0, true, from(), &rr);
        assert_eq!(out[0].dest.port(), 6001);
    }

    #[test]
    fn unspecified_sides_only_receive() {
        let mut t = translator(&["/5004", "10.0.0.1/6000"]);
        let pkt = RtpHeader::new(0, 1, 2, 3).to_bytes();
        assert!(t.handle(1, false, from(), &pkt).is_empty());
        assert_eq!(t.handle(0, false, from(), &pkt).len(), 1);
    }

    #[test]
    fn vat_from_unicast_side_is_not_translated() {
        let mut t = translator(&["224.2.0.1/5004", "10.0.0.1/6000"]);
        let pkt = vat_data(0, 0, 160);
        let out = t.handle(1, false, from(), &pkt);
        assert_eq!(out[0].data, pkt);
        assert_eq!(t.stats().forwarded, 1);
    }

    // --- vat translation ---

    #[test]
    fn vat_data_becomes_rtp() {
        let mut t = translator(&["224.2.0.1/5004", "10.0.0.1/6000"]);
        let out = t.handle(0, false, from(), &vat_data(FLAG_NEW_TALKSPURT, 8000, 160));
        assert_eq!(out.len(), 1);

        let rtp = RtpPacket::decode(&out[0].data).unwrap();
        assert_eq!(rtp.header.payload_type, 0);
        assert_eq!(rtp.header.ssrc, u32::from(SENDER));
        assert_eq!(rtp.header.timestamp, 8000);
        assert_eq!(rtp.header.sequence, 500);
        assert!(rtp.header.marker);
        assert_eq!(rtp.payload.len(), 160);

        // next packet continues the talkspurt
        let out = t.handle(0, false, from(), &vat_data(0, 8160, 160));
        let rtp = RtpPacket::decode(&out[0].data).unwrap();
        assert_eq!(rtp.header.sequence, 501);
        assert!(!rtp.header.marker);

        // one packet missing
        let out = t.handle(0, false, from(), &vat_data(0, 8480, 160));
        let rtp = RtpPacket::decode(&out[0].data).unwrap();
        assert_eq!(rtp.header.sequence, 503);
        assert_eq!(t.stats().translated, 3);
    }

    #[test]
    fn gsm_sample_count_drives_expected_timestamp() {
        let mut t = translator(&["224.2.0.1/5004", "10.0.0.1/6000"]);
        t.handle(0, false, from(), &vat_data(3, 0, 66));
        assert_eq!(
            t.tracker().get(u32::from(SENDER)).map(|s| s.next_ts),
            Some(320)
        );
    }

    #[test]
    fn unmapped_vat_format_uses_fallback_payload_type() {
        let mut t = translator(&["224.2.0.1/5004", "10.0.0.1/6000"]);
        let out = t.handle(0, false, from(), &vat_data(28, 0, 14));
        let rtp = RtpPacket::decode(&out[0].data).unwrap();
        assert_eq!(rtp.header.payload_type, UNMAPPED_PAYLOAD_TYPE);
    }

    #[test]
    fn vat_id_becomes_rr_and_sdes() {
        let mut t = translator(&["224.2.0.1/5004", "10.0.0.1/6000"]);
        let mut ctl = vec![0x00, CONTROL_ID, 0x00, 0x01];
        ctl.extend_from_slice(b"Alice <alice@example.org>\0");
        let out = t.handle(0, true, from(), &ctl);
        assert_eq!(out[0].dest.port(), 6001);

        let compound = RtcpCompound::decode(&out[0].data).unwrap();
        assert_eq!(compound.packets.len(), 2);
        assert_eq!(
            compound.packets[0].packet,
            RtcpPacket::ReceiverReport {
                ssrc: u32::from(SENDER),
                reports: Vec::new()
            }
        );
        let RtcpPacket::SourceDescription { chunks } = &compound.packets[1].packet else {
            panic!("expected SDES");
        };
        assert_eq!(chunks[0].src, u32::from(SENDER));
        assert_eq!(chunks[0].items[0], SdesItem::new(sdes::CNAME, "10.1.2.3"));
        assert_eq!(
            chunks[0].items[1],
            SdesItem::new(sdes::NAME, "Alice <alice@example.org>")
        );
    }

    #[test]
    fn other_vat_control_and_garbage_dropped() {
        let mut t = translator(&["224.2.0.1/5004", "10.0.0.1/6000"]);
        assert!(t.handle(0, true, from(), &[0x00, 2, 0, 1, 0, 0]).is_empty());
        assert!(t.handle(0, false, from(), &[0x00, 0, 0]).is_empty());
        assert!(t.handle(0, false, from(), &[0x40; 12]).is_empty());
        assert_eq!(t.stats().dropped, 3);
    }
}
