//! Capture recording and decode-line output.
//!
//! A [`Recorder`] turns received datagrams (or records of an existing
//! capture) into one of several output formats:
//!
//! | Format | Output |
//! |--------|--------|
//! | `dump` | capture file, RTP payload truncated to `truncate` bytes |
//! | `header` | capture file, RTP/vat header only, original length kept |
//! | `payload` | raw RTP payload bytes, control packets skipped |
//! | `short` | `<sec>.<usec> <ts> <seq>`, seconds negated on marker |
//! | `ascii` | one decode line per packet |
//! | `hex` | `ascii` plus the payload in hex |
//! | `rtcp` | decode lines of control packets only |
//!
//! A decode line starts with `<sec>.<usec> <kind> len=<n> from=<ip>:<port>`
//! and continues with the decoded header fields. Packets that fail to decode
//! are reported inline and never stop the recording.

use std::fmt;
use std::io::{self, BufRead, Write};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::capture::{CaptureHeader, CaptureReader, CaptureRecord, CaptureWriter};
use crate::codec::rtcp::{ReportBlock, RtcpSubPacket, sdes};
use crate::codec::vat::{VatControl, VatHeader};
use crate::codec::{PacketKind, RtcpCompound, RtcpPacket, RtpPacket, classify, payload, rtp};
use crate::error::{Result, RtpError};
use crate::net::{self, MAX_DATAGRAM};
use crate::reactor::{Interest, Reactor};
use crate::timer::{Deadline, HasTimers};
use crate::translate::Endpoint;

/// Payload type decoded as telephone events unless configured otherwise.
pub const DEFAULT_EVENT_PAYLOAD_TYPE: u8 = 101;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DumpFormat {
    Dump,
    Header,
    Hex,
    Rtcp,
    Short,
    Payload,
    #[default]
    Ascii,
}

impl DumpFormat {
    const ALL: [(&'static str, DumpFormat); 7] = [
        ("dump", Self::Dump),
        ("header", Self::Header),
        ("hex", Self::Hex),
        ("rtcp", Self::Rtcp),
        ("short", Self::Short),
        ("payload", Self::Payload),
        ("ascii", Self::Ascii),
    ];

    pub fn name(self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(_, f)| *f == self)
            .map_or("ascii", |(name, _)| name)
    }

    /// Whether the output is a capture file.
    pub fn is_capture(self) -> bool {
        matches!(self, Self::Dump | Self::Header)
    }

    /// Whether data packets contribute anything to the output.
    pub fn wants_data(self) -> bool {
        self != Self::Rtcp
    }
}

impl fmt::Display for DumpFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Unknown or empty format name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown output format {0:?}")]
pub struct UnknownFormat(pub String);

impl FromStr for DumpFormat {
    type Err = UnknownFormat;

    /// Case-insensitive prefix match, first match wins (`h` is `header`).
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.to_ascii_lowercase();
        Self::ALL
            .iter()
            .find(|(name, _)| !wanted.is_empty() && name.starts_with(&wanted))
            .map(|(_, f)| *f)
            .ok_or_else(|| UnknownFormat(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpConfig {
    pub format: DumpFormat,
    /// Payload bytes kept by `dump` and shown by `hex`.
    pub truncate: usize,
    /// Stop recording after this long.
    pub duration: Option<Duration>,
    pub event_payload_type: u8,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            format: DumpFormat::default(),
            truncate: 1_000_000,
            duration: None,
            event_payload_type: DEFAULT_EVENT_PAYLOAD_TYPE,
        }
    }
}

/// One datagram handed to a [`Recorder`].
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    /// Arrival time, on the same clock as the recorder's start.
    pub time: Duration,
    pub control: bool,
    pub from: SocketAddrV4,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpStats {
    pub data: u64,
    pub control: u64,
}

enum Output<W: Write> {
    Capture(CaptureWriter<W>),
    Text(W),
}

/// Writes packets in the configured [`DumpFormat`].
pub struct Recorder<W: Write> {
    output: Output<W>,
    config: DumpConfig,
    start: Duration,
    stats: DumpStats,
}

impl<W: Write> Recorder<W> {
    /// Start a recording. Capture formats write `header` first; `start` is
    /// the time record offsets count from.
    pub fn new(
        out: W,
        config: DumpConfig,
        header: &CaptureHeader,
        start: Duration,
    ) -> Result<Self> {
        let output = if config.format.is_capture() {
            Output::Capture(CaptureWriter::new(out, header)?)
        } else {
            Output::Text(out)
        };
        Ok(Self {
            output,
            config,
            start,
            stats: DumpStats::default(),
        })
    }

    pub fn config(&self) -> &DumpConfig {
        &self.config
    }

    pub fn stats(&self) -> DumpStats {
        self.stats
    }

    pub fn record(&mut self, packet: &Packet<'_>) -> Result<()> {
        if packet.control {
            self.stats.control += 1;
        } else {
            self.stats.data += 1;
        }
        let elapsed = packet.time.saturating_sub(self.start);
        let offset_ms = u32::try_from(elapsed.as_millis()).unwrap_or(u32::MAX);
        let format = self.config.format;

        match &mut self.output {
            Output::Capture(writer) => {
                let hlen = if packet.control {
                    packet.data.len()
                } else {
                    header_len(packet.data)
                };
                let kept = match format {
                    DumpFormat::Header => hlen,
                    _ if packet.control => packet.data.len(),
                    _ => packet.data.len().min(hlen.saturating_add(self.config.truncate)),
                };
                writer.write_record(&CaptureRecord {
                    offset_ms,
                    original_len: if packet.control {
                        0
                    } else {
                        packet.data.len() as u16
                    },
                    data: packet.data[..kept].to_vec(),
                })?;
            }
            Output::Text(out) => {
                write_text(out, format, &self.config, packet)?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        match &mut self.output {
            Output::Capture(writer) => writer.flush(),
            Output::Text(out) => Ok(out.flush()?),
        }
    }

    pub fn into_inner(self) -> W {
        match self.output {
            Output::Capture(writer) => writer.into_inner(),
            Output::Text(out) => out,
        }
    }
}

fn write_text<W: Write>(
    out: &mut W,
    format: DumpFormat,
    config: &DumpConfig,
    packet: &Packet<'_>,
) -> io::Result<()> {
    let data = packet.data;
    match format {
        DumpFormat::Payload if !packet.control => {
            out.write_all(&data[header_len(data).min(data.len())..])
        }
        DumpFormat::Short if !packet.control => {
            writeln!(out, "{}", ShortLine::new(packet.time, data))
        }
        DumpFormat::Ascii | DumpFormat::Hex if !packet.control => {
            write!(
                out,
                "{} {} ",
                LinePrefix(packet),
                DataSummary {
                    data,
                    event_payload_type: config.event_payload_type,
                }
            )?;
            if format == DumpFormat::Hex {
                let hlen = header_len(data).min(data.len());
                let end = data.len().min(hlen.saturating_add(config.truncate));
                write!(out, "data={}", Hex(&data[hlen..end]))?;
            }
            writeln!(out)
        }
        DumpFormat::Ascii | DumpFormat::Hex | DumpFormat::Rtcp if packet.control => {
            writeln!(out, "{} {}", LinePrefix(packet), ControlSummary { data })
        }
        _ => Ok(()),
    }
}

/// Length of the RTP or vat header at the front of `data`. Packets that do
/// not decode count as all header.
pub fn header_len(data: &[u8]) -> usize {
    match classify(data, false) {
        PacketKind::Rtp => rtp::header_len(data).unwrap_or(data.len()),
        PacketKind::VatData => VatHeader::decode(data).map_or(data.len(), |h| h.len()),
        _ => data.len(),
    }
}

/// Current time as an offset from the Unix epoch.
pub fn now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

// --- decode lines ---

struct Timestamp(Duration);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0.as_secs(), self.0.subsec_micros())
    }
}

struct Hex<'a>(&'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|b| write!(f, "{b:02x}"))
    }
}

struct LinePrefix<'a, 'b>(&'a Packet<'b>);

impl fmt::Display for LinePrefix<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.0;
        write!(
            f,
            "{} {} len={} from={}",
            Timestamp(p.time),
            classify(p.data, p.control).label(),
            p.data.len(),
            p.from
        )
    }
}

/// `<sec>.<usec> <ts> [<seq>]`, with the seconds negated when the RTP
/// marker bit or any vat flag is set.
pub struct ShortLine<'a> {
    time: Duration,
    data: &'a [u8],
}

impl<'a> ShortLine<'a> {
    pub fn new(time: Duration, data: &'a [u8]) -> Self {
        Self { time, data }
    }
}

impl fmt::Display for ShortLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.time.as_secs() as i64;
        let usec = self.time.subsec_micros();
        match classify(self.data, false) {
            PacketKind::Rtp => match rtp::RtpHeader::decode(self.data) {
                Ok((h, _)) => {
                    let secs = if h.marker { -secs } else { secs };
                    write!(f, "{secs}.{usec:06} {} {}", h.timestamp, h.sequence)
                }
                Err(e) => write!(f, "{secs}.{usec:06} ({e})"),
            },
            PacketKind::VatData => match VatHeader::decode(self.data) {
                Ok(v) => {
                    let secs = if v.flags != 0 { -secs } else { secs };
                    write!(f, "{secs}.{usec:06} {}", v.timestamp)
                }
                Err(e) => write!(f, "{secs}.{usec:06} ({e})"),
            },
            _ => write!(f, "RTP version wrong ({}).", version(self.data)),
        }
    }
}

fn version(data: &[u8]) -> u8 {
    data.first().map_or(0, |b| b >> 6)
}

/// Decoded fields of an RTP or vat data packet.
pub struct DataSummary<'a> {
    pub data: &'a [u8],
    pub event_payload_type: u8,
}

impl fmt::Display for DataSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match classify(self.data, false) {
            PacketKind::VatData => match VatHeader::decode(self.data) {
                Ok(v) => write!(
                    f,
                    "nsid={} flags=0x{:x} confid={} ts={}",
                    v.speaker_ids.len(),
                    v.flags,
                    v.conference_id,
                    v.timestamp
                ),
                Err(e) => write!(f, "({e})"),
            },
            PacketKind::Rtp => match RtpPacket::decode(self.data) {
                Ok(pkt) => self.fmt_rtp(f, &pkt),
                Err(e) => write!(f, "({e})"),
            },
            _ => write!(f, "RTP version wrong ({}).", version(self.data)),
        }
    }
}

impl DataSummary<'_> {
    fn fmt_rtp(&self, f: &mut fmt::Formatter<'_>, pkt: &RtpPacket<'_>) -> fmt::Result {
        let h = &pkt.header;
        let info = payload::standard(h.payload_type);
        write!(
            f,
            "v=2 p={} x={} cc={} m={} pt={} ({},{},{}) seq={} ts={} ssrc=0x{:x}",
            h.padding as u8,
            h.extension.is_some() as u8,
            h.csrc.len(),
            h.marker as u8,
            h.payload_type,
            info.name,
            info.channels,
            info.rate,
            h.sequence,
            h.timestamp,
            h.ssrc
        )?;
        for (i, csrc) in h.csrc.iter().enumerate() {
            write!(f, " csrc[{i}]=0x{csrc:x}")?;
        }
        if h.payload_type == self.event_payload_type
            && let Some(event) = TelephoneEvent::decode(pkt.payload)
        {
            write!(f, " {event}")?;
        }
        if let Some(ext) = &h.extension {
            write!(f, " ext_type=0x{:x} ext_len={}", ext.profile, ext.words())?;
            if !ext.data.is_empty() {
                write!(f, " ext_data={}", Hex(&ext.data))?;
            }
        }
        Ok(())
    }
}

/// DTMF event payload (RFC 4733 §2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelephoneEvent {
    pub event: u8,
    pub end: bool,
    /// Duration in timestamp units.
    pub duration: u16,
}

impl TelephoneEvent {
    pub fn decode(payload: &[u8]) -> Option<Self> {
        let &[event, flags, d0, d1, ..] = payload else {
            return None;
        };
        Some(Self {
            event,
            end: flags & 0x80 != 0,
            duration: u16::from_be_bytes([d0, d1]),
        })
    }

    /// Keypad character of the event, `?` for non-DTMF events.
    pub fn digit(&self) -> char {
        match self.event {
            0..=9 => (b'0' + self.event) as char,
            10 => '*',
            11 => '#',
            12..=15 => (b'A' + self.event - 12) as char,
            _ => '?',
        }
    }
}

impl fmt::Display for TelephoneEvent {
    /// Duration assumes the 8 kHz event clock.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dtmf={} duration={}ms end={}",
            self.digit(),
            self.duration / 8,
            self.end as u8
        )
    }
}

/// Decoded RTCP compound packet or vat control header. RTCP output spans
/// several lines, one per sub-packet and report block.
pub struct ControlSummary<'a> {
    pub data: &'a [u8],
}

impl fmt::Display for ControlSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match classify(self.data, true) {
            PacketKind::VatControl => match VatControl::decode(self.data) {
                Ok(v) => write!(
                    f,
                    "flags=0x{:x} type=0x{:x} confid={}",
                    v.flags, v.message_type, v.conference_id
                ),
                Err(e) => write!(f, "({e})"),
            },
            PacketKind::Rtcp => match RtcpCompound::decode(self.data) {
                Ok(compound) => compound.packets.iter().try_for_each(|p| fmt_rtcp(f, p)),
                Err(e) => write!(f, "({e})"),
            },
            _ => write!(f, "invalid version {}", version(self.data)),
        }
    }
}

fn fmt_rtcp(f: &mut fmt::Formatter<'_>, sub: &RtcpSubPacket) -> fmt::Result {
    let h = &sub.header;
    let common = format!("p={} count={} len={}", h.padding as u8, h.count, h.length);
    match &sub.packet {
        RtcpPacket::SenderReport {
            ssrc,
            ntp_sec,
            ntp_frac,
            rtp_timestamp,
            packet_count,
            octet_count,
            reports,
        } => {
            write!(f, "\n (SR ssrc=0x{ssrc:x} {common}")?;
            write!(
                f,
                "\n  ntp={ntp_sec}.{ntp_frac} ts={rtp_timestamp} \
                 psent={packet_count} osent={octet_count}"
            )?;
            fmt_reports(f, reports)?;
        }
        RtcpPacket::ReceiverReport { ssrc, reports } => {
            write!(f, "\n (RR ssrc=0x{ssrc:x} {common}")?;
            fmt_reports(f, reports)?;
        }
        RtcpPacket::SourceDescription { chunks } => {
            write!(f, "\n (SDES {common}")?;
            for chunk in chunks {
                write!(f, "\n  (src=0x{:x}", chunk.src)?;
                for item in &chunk.items {
                    let data = String::from_utf8_lossy(&item.data);
                    match sdes::name(item.kind) {
                        Some(name) => write!(f, " {name}=\"{data}\"")?,
                        None => write!(f, " {}=\"{data}\"", item.kind)?,
                    }
                }
                write!(f, " )")?;
            }
        }
        RtcpPacket::Bye { sources, reason } => {
            write!(f, "\n (BYE {common}")?;
            for (i, src) in sources.iter().enumerate() {
                write!(f, " ssrc[{i}]=0x{src:x}")?;
            }
            if let Some(reason) = reason {
                write!(f, " reason=\"{}\"", String::from_utf8_lossy(reason))?;
            }
        }
        RtcpPacket::Other {
            packet_type, body, ..
        } => {
            let src = match body.get(..4) {
                Some(b) => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
                None => 0,
            };
            write!(f, "\n (? pt={packet_type} src=0x{src:x}")?;
        }
    }
    write!(f, " )")
}

fn fmt_reports(f: &mut fmt::Formatter<'_>, reports: &[ReportBlock]) -> fmt::Result {
    for r in reports {
        write!(
            f,
            "\n  (ssrc=0x{:x} fraction={} lost={} last_seq={} jit={} lsr={} dlsr={} )",
            r.ssrc,
            r.fraction as f64 / 256.0,
            r.lost,
            r.last_seq,
            r.jitter,
            r.lsr,
            r.dlsr
        )?;
    }
    Ok(())
}

// --- sources ---

/// Re-emit every record of a capture through `recorder`, using record
/// offsets as arrival times. Returns the number of records.
pub fn dump_capture<R: BufRead, W: Write>(
    reader: &mut CaptureReader<R>,
    recorder: &mut Recorder<W>,
) -> Result<u64> {
    let from = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    let mut count = 0;
    while let Some(record) = reader.read_record()? {
        recorder.record(&Packet {
            time: Duration::from_millis(record.offset_ms as u64),
            control: record.is_control(),
            from,
            data: &record.data,
        })?;
        count += 1;
    }
    recorder.flush()?;
    Ok(count)
}

/// A [`Recorder`] fed from the data and control ports of an endpoint, run
/// as the state of a [`Reactor`].
pub struct Listener<W: Write> {
    recorder: Recorder<W>,
    data: Option<UdpSocket>,
    control: UdpSocket,
    buf: Vec<u8>,
    failure: Option<RtpError>,
}

impl<W: Write + 'static> Listener<W> {
    /// Bind the endpoint's ports. The data port is skipped when the format
    /// shows control packets only.
    pub fn bind(endpoint: &Endpoint, recorder: Recorder<W>) -> Result<Self> {
        let data = if recorder.config().format.wants_data() {
            Some(net::bind_receiver(endpoint.addr, endpoint.port)?)
        } else {
            None
        };
        let control = net::bind_receiver(endpoint.addr, endpoint.port.wrapping_add(1))?;
        tracing::info!(%endpoint, format = %recorder.config().format, "listening");
        Ok(Self {
            recorder,
            data,
            control,
            buf: vec![0u8; MAX_DATAGRAM],
            failure: None,
        })
    }

    /// Register the sockets and, if configured, the recording time limit.
    pub fn register(reactor: &mut Reactor<Self>) -> Result<()> {
        use std::os::fd::AsRawFd;

        let listener = reactor.state();
        let control_fd = listener.control.as_raw_fd();
        let data_fd = listener.data.as_ref().map(AsRawFd::as_raw_fd);
        let duration = listener.recorder.config().duration;

        reactor.register(control_fd, Interest::Read, |r: &mut Reactor<Self>, _| {
            Self::on_readable(r, true);
        })?;
        if let Some(fd) = data_fd {
            reactor.register(fd, Interest::Read, |r: &mut Reactor<Self>, _| {
                Self::on_readable(r, false);
            })?;
        }
        if let Some(limit) = duration {
            reactor
                .timers()
                .schedule(0, Deadline::After(limit), |r: &mut Reactor<Self>, _| {
                    tracing::info!("time limit reached");
                    r.stop();
                });
        }
        Ok(())
    }

    fn on_readable(reactor: &mut Reactor<Self>, control: bool) {
        if let Err(e) = reactor.state_mut().drain(control) {
            tracing::error!(error = %e, "recording failed");
            reactor.state_mut().failure = Some(e);
            reactor.stop();
        }
    }

    fn drain(&mut self, control: bool) -> Result<()> {
        loop {
            let socket = match (control, &self.data) {
                (true, _) => &self.control,
                (false, Some(data)) => data,
                (false, None) => return Ok(()),
            };
            let (len, from) = match net::recv(socket, &mut self.buf) {
                Ok(Some(got)) => got,
                Ok(None) => return Ok(()),
                Err(e) => {
                    tracing::warn!(control, error = %e, "receive failed");
                    return Ok(());
                }
            };
            self.recorder.record(&Packet {
                time: now(),
                control,
                from,
                data: &self.buf[..len],
            })?;
        }
    }

    pub fn recorder(&self) -> &Recorder<W> {
        &self.recorder
    }

    /// Flush the output and report a write failure that stopped the loop.
    pub fn finish(self) -> Result<Recorder<W>> {
        if let Some(e) = self.failure {
            return Err(e);
        }
        let mut recorder = self.recorder;
        recorder.flush()?;
        Ok(recorder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RtpHeader;
    use crate::codec::rtcp::{SdesChunk, SdesItem};
    use std::io::BufReader;

    fn header() -> CaptureHeader {
        CaptureHeader {
            start_sec: 1000,
            start_usec: 0,
            source: Ipv4Addr::new(224, 2, 0, 1),
            port: 5004,
        }
    }

    fn from() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 4000)
    }

    fn rtp(marker: bool, payload: &[u8]) -> Vec<u8> {
        let mut buf = RtpHeader::new(0, 7, 160, 0xabc).with_marker(marker).to_bytes();
        buf.extend_from_slice(payload);
        buf
    }

    fn text(config: DumpConfig, packets: &[Packet<'_>]) -> String {
        let mut rec = Recorder::new(Vec::new(), config, &header(), Duration::ZERO).unwrap();
        for p in packets {
            rec.record(p).unwrap();
        }
        String::from_utf8(rec.into_inner()).unwrap()
    }

    fn packet(time_ms: u64, control: bool, data: &[u8]) -> Packet<'_> {
        Packet {
            time: Duration::from_millis(time_ms),
            control,
            from: from(),
            data,
        }
    }

    fn with_format(format: DumpFormat) -> DumpConfig {
        DumpConfig {
            format,
            ..DumpConfig::default()
        }
    }

    // --- formats ---

    #[test]
    fn format_prefix_match() {
        assert_eq!("a".parse::<DumpFormat>(), Ok(DumpFormat::Ascii));
        assert_eq!("H".parse::<DumpFormat>(), Ok(DumpFormat::Header));
        assert_eq!("he".parse::<DumpFormat>(), Ok(DumpFormat::Header));
        assert_eq!("hex".parse::<DumpFormat>(), Ok(DumpFormat::Hex));
        assert_eq!("SHORT".parse::<DumpFormat>(), Ok(DumpFormat::Short));
        assert!("xml".parse::<DumpFormat>().is_err());
        assert!("".parse::<DumpFormat>().is_err());
        assert!("dumpster".parse::<DumpFormat>().is_err());
    }

    // --- capture output ---

    #[test]
    fn dump_truncates_payload_and_keeps_original_length() {
        let config = DumpConfig {
            format: DumpFormat::Dump,
            truncate: 4,
            ..DumpConfig::default()
        };
        let data = rtp(false, &[1u8; 100]);
        let rtcp = [0x80, 201, 0, 1, 0, 0, 0, 9];
        let start = Duration::from_secs(1000);
        let mut rec = Recorder::new(Vec::new(), config, &header(), start).unwrap();
        rec.record(&Packet {
            time: Duration::from_millis(1_000_250),
            ..packet(0, false, &data)
        })
        .unwrap();
        rec.record(&Packet {
            time: Duration::from_millis(1_000_300),
            ..packet(0, true, &rtcp)
        })
        .unwrap();
        let bytes = rec.into_inner();

        let mut reader = CaptureReader::new(BufReader::new(&bytes[..])).unwrap();
        assert_eq!(reader.header(), &header());
        let first = reader.read_record().unwrap().unwrap();
        assert_eq!(first.offset_ms, 250);
        assert_eq!(first.original_len, 112);
        assert_eq!(first.data.len(), 16);
        let second = reader.read_record().unwrap().unwrap();
        assert!(second.is_control());
        assert_eq!(second.data, rtcp);
        assert!(reader.read_record().unwrap().is_none());
    }

    #[test]
    fn header_format_keeps_header_only() {
        let data = rtp(true, &[9u8; 40]);
        let config = with_format(DumpFormat::Header);
        let mut rec = Recorder::new(Vec::new(), config, &header(), Duration::ZERO).unwrap();
        rec.record(&packet(5, false, &data)).unwrap();
        let bytes = rec.into_inner();
        let record = CaptureReader::new(BufReader::new(&bytes[..]))
            .unwrap()
            .read_record()
            .unwrap()
            .unwrap();
        assert_eq!(record.data.len(), 12);
        assert_eq!(record.original_len, 52);
    }

    // --- text output ---

    #[test]
    fn payload_format_strips_headers_and_control() {
        let data = rtp(false, b"abc");
        let out = text(
            with_format(DumpFormat::Payload),
            &[packet(0, false, &data), packet(0, true, &[0x80, 201, 0, 1, 0, 0, 0, 9])],
        );
        assert_eq!(out, "abc");
    }

    #[test]
    fn short_lines_negate_marked_packets() {
        let marked = rtp(true, &[]);
        let plain = rtp(false, &[]);
        let out = text(
            with_format(DumpFormat::Short),
            &[packet(1500, false, &marked), packet(2000, false, &plain)],
        );
        assert_eq!(out, "-1.500000 160 7\n2.000000 160 7\n");
    }

    #[test]
    fn ascii_line_for_rtp() {
        let data = rtp(true, &[0; 4]);
        let out = text(DumpConfig::default(), &[packet(1, false, &data)]);
        assert_eq!(
            out,
            "0.001000 RTP len=16 from=10.0.0.1:4000 \
             v=2 p=0 x=0 cc=0 m=1 pt=0 (PCMU,1,8000) seq=7 ts=160 ssrc=0xabc \n"
        );
    }

    #[test]
    fn hex_appends_truncated_payload() {
        let config = DumpConfig {
            format: DumpFormat::Hex,
            truncate: 2,
            ..DumpConfig::default()
        };
        let data = rtp(false, &[0xde, 0xad, 0xbe, 0xef]);
        let out = text(config, &[packet(0, false, &data)]);
        assert!(out.ends_with("ssrc=0xabc data=dead\n"), "{out}");
    }

    #[test]
    fn telephone_event_decoded() {
        let mut data = RtpHeader::new(101, 1, 0, 1).to_bytes();
        data.extend_from_slice(&[11, 0x80, 0x03, 0x20]);
        let out = text(DumpConfig::default(), &[packet(0, false, &data)]);
        assert!(out.contains(" dtmf=# duration=100ms end=1"), "{out}");

        let config = DumpConfig {
            event_payload_type: 96,
            ..DumpConfig::default()
        };
        let out = text(config, &[packet(0, false, &data)]);
        assert!(!out.contains("dtmf"));
    }

    #[test]
    fn rtcp_decode_lines() {
        let compound = RtcpCompound::from_packets([
            RtcpPacket::ReceiverReport {
                ssrc: 0x10,
                reports: Vec::new(),
            },
            RtcpPacket::SourceDescription {
                chunks: vec![SdesChunk {
                    src: 0x10,
                    items: vec![SdesItem::new(sdes::CNAME, "alice@host")],
                }],
            },
        ])
        .to_bytes();
        let out = text(with_format(DumpFormat::Rtcp), &[packet(0, true, &compound)]);
        let lines: Vec<&str> = out.lines().collect();
        assert!(lines[0].starts_with("0.000000 RTCP len="));
        assert_eq!(lines[1], " (RR ssrc=0x10 p=0 count=0 len=1 )");
        assert!(lines[2].starts_with(" (SDES p=0 count=1"));
        assert_eq!(lines[3], "  (src=0x10 CNAME=\"alice@host\" ) )");
    }

    #[test]
    fn rtcp_format_ignores_data() {
        let data = rtp(false, &[]);
        assert!(text(with_format(DumpFormat::Rtcp), &[packet(0, false, &data)]).is_empty());
    }

    #[test]
    fn malformed_packets_reported_inline() {
        let out = text(
            DumpConfig::default(),
            &[
                packet(0, false, &[0x81, 0, 0, 1]),
                packet(0, false, &[0x40, 0]),
                packet(0, true, &[0x80, 201, 0, 9, 0, 0, 0, 0]),
            ],
        );
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("truncated"), "{}", lines[0]);
        assert!(lines[1].contains("RTP version wrong (1)."));
        assert!(lines[2].contains("overruns"), "{}", lines[2]);
    }

    #[test]
    fn vat_lines() {
        let mut data = Vec::new();
        VatHeader {
            flags: 0x80,
            conference_id: 3,
            timestamp: 320,
            speaker_ids: Vec::new(),
        }
        .write(&mut data);
        let out = text(DumpConfig::default(), &[packet(0, false, &data)]);
        assert!(out.contains("VATD len=8 from=10.0.0.1:4000 nsid=0 flags=0x80 confid=3 ts=320"));
        let out = text(with_format(DumpFormat::Short), &[packet(0, false, &data)]);
        assert_eq!(out, "0.000000 320\n");
    }

    // --- sources ---

    #[test]
    fn capture_file_re_emitted_with_offsets() {
        let mut writer = CaptureWriter::new(Vec::new(), &header()).unwrap();
        writer.write_record(&CaptureRecord::data(20, rtp(false, &[]))).unwrap();
        writer.write_record(&CaptureRecord::data(3040, rtp(true, &[]))).unwrap();
        let bytes = writer.into_inner();

        let mut reader = CaptureReader::new(BufReader::new(&bytes[..])).unwrap();
        let config = with_format(DumpFormat::Short);
        let mut rec = Recorder::new(Vec::new(), config, reader.header(), Duration::ZERO).unwrap();
        assert_eq!(dump_capture(&mut reader, &mut rec).unwrap(), 2);
        assert_eq!(rec.stats().data, 2);
        let out = String::from_utf8(rec.into_inner()).unwrap();
        assert_eq!(out, "0.020000 160 7\n-3.040000 160 7\n");
    }

    #[test]
    fn listener_records_loopback_traffic() {
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port() & !1;
        drop(probe);
        let endpoint = Endpoint::new(Ipv4Addr::LOCALHOST, port);
        let config = DumpConfig {
            format: DumpFormat::Short,
            duration: Some(Duration::from_millis(300)),
            ..DumpConfig::default()
        };
        let rec = Recorder::new(Vec::new(), config, &header(), Duration::ZERO).unwrap();
        let Ok(listener) = Listener::bind(&endpoint, rec) else {
            // port taken between probe and bind
            return;
        };
        let mut reactor = Reactor::new(listener);
        Listener::register(&mut reactor).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&rtp(false, &[]), endpoint.data_addr()).unwrap();
        reactor.run().unwrap();

        let recorder = reactor.into_state().finish().unwrap();
        assert_eq!(recorder.stats().data, 1);
        let out = String::from_utf8(recorder.into_inner()).unwrap();
        assert!(out.ends_with(" 160 7\n"), "{out}");
    }
}
