//! rtpdump capture file format.
//!
//! ```text
//! "#!rtpplay1.0 224.2.0.1/5004\n"            identification line
//! +---------------+---------------+
//! | start_sec u32 | start_usec u32|            file header, 16 bytes,
//! +---------------+-------+-------+            network byte order
//! | source   u32  | port  |  pad  |
//! +---------------+-------+-------+
//! | len u16 | plen u16 | offset u32 | data…    one record per packet
//! +---------+----------+------------+
//! ```
//!
//! `len` counts the 8-byte record header plus the stored data. `plen` is
//! the packet's length before truncation, or 0 for an RTCP record. `offset`
//! is milliseconds since the capture started. This layout is shared with
//! every historical capture and must stay byte-for-byte identical.

use std::fmt;
use std::io::{self, BufRead, Read, Write};
use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::codec::DecodeError;
use crate::error::{Result, RtpError};

pub const FILE_MAGIC: &str = "#!rtpplay1.0 ";
pub const FILE_HEADER_LEN: usize = 16;
pub const RECORD_HEADER_LEN: usize = 8;

/// Largest packet a record can hold.
pub const MAX_RECORD_DATA: usize = u16::MAX as usize - RECORD_HEADER_LEN;

const MAX_MAGIC_LINE: usize = 256;

/// Identification line plus fixed binary header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureHeader {
    pub start_sec: u32,
    pub start_usec: u32,
    /// Address the capture was taken from.
    pub source: Ipv4Addr,
    pub port: u16,
}

impl CaptureHeader {
    /// Header for a capture of `source:port` starting now.
    pub fn starting_now(source: Ipv4Addr, port: u16) -> Self {
        Self::starting_at(SystemTime::now(), source, port)
    }

    pub fn starting_at(start: SystemTime, source: Ipv4Addr, port: u16) -> Self {
        let since = start.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            start_sec: since.as_secs() as u32,
            start_usec: since.subsec_micros(),
            source,
            port,
        }
    }

    pub fn start_time(&self) -> SystemTime {
        UNIX_EPOCH
            + Duration::from_secs(self.start_sec as u64)
            + Duration::from_micros(self.start_usec as u64)
    }

    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut out = [0u8; FILE_HEADER_LEN];
        out[0..4].copy_from_slice(&self.start_sec.to_be_bytes());
        out[4..8].copy_from_slice(&self.start_usec.to_be_bytes());
        out[8..12].copy_from_slice(&self.source.octets());
        out[12..14].copy_from_slice(&self.port.to_be_bytes());
        out
    }

    fn decode(buf: &[u8; FILE_HEADER_LEN]) -> Self {
        let be32 = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Self {
            start_sec: be32(0),
            start_usec: be32(4),
            source: Ipv4Addr::new(buf[8], buf[9], buf[10], buf[11]),
            port: u16::from_be_bytes([buf[12], buf[13]]),
        }
    }
}

impl fmt::Display for CaptureHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "start {}.{:06} source {}/{}",
            self.start_sec, self.start_usec, self.source, self.port
        )
    }
}

/// One captured packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    /// Milliseconds since the start of the capture.
    pub offset_ms: u32,
    /// Length on the wire before truncation; 0 marks RTCP.
    pub original_len: u16,
    pub data: Vec<u8>,
}

impl CaptureRecord {
    pub fn data(offset_ms: u32, data: Vec<u8>) -> Self {
        Self {
            offset_ms,
            original_len: data.len().min(u16::MAX as usize) as u16,
            data,
        }
    }

    pub fn control(offset_ms: u32, data: Vec<u8>) -> Self {
        Self {
            offset_ms,
            original_len: 0,
            data,
        }
    }

    pub fn is_control(&self) -> bool {
        self.original_len == 0
    }

    /// Value of the on-disk length field.
    pub fn stored_len(&self) -> usize {
        self.data.len() + RECORD_HEADER_LEN
    }
}

/// Writes the identification line and header, then records.
pub struct CaptureWriter<W: Write> {
    inner: W,
    records: u64,
}

impl<W: Write> CaptureWriter<W> {
    pub fn new(mut inner: W, header: &CaptureHeader) -> Result<Self> {
        writeln!(inner, "{}{}/{}", FILE_MAGIC, header.source, header.port)?;
        inner.write_all(&header.encode())?;
        tracing::debug!(%header, "capture started");
        Ok(Self { inner, records: 0 })
    }

    pub fn write_record(&mut self, record: &CaptureRecord) -> Result<()> {
        if record.data.len() > MAX_RECORD_DATA {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{}-byte packet does not fit a capture record", record.data.len()),
            )
            .into());
        }
        let mut hdr = [0u8; RECORD_HEADER_LEN];
        hdr[0..2].copy_from_slice(&(record.stored_len() as u16).to_be_bytes());
        hdr[2..4].copy_from_slice(&record.original_len.to_be_bytes());
        hdr[4..8].copy_from_slice(&record.offset_ms.to_be_bytes());
        self.inner.write_all(&hdr)?;
        self.inner.write_all(&record.data)?;
        self.records += 1;
        Ok(())
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(self.inner.flush()?)
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads a capture file record by record.
pub struct CaptureReader<R: BufRead> {
    inner: R,
    header: CaptureHeader,
}

impl<R: BufRead> CaptureReader<R> {
    /// Validate the identification line and read the file header.
    pub fn new(mut inner: R) -> Result<Self> {
        let mut line = Vec::new();
        (&mut inner)
            .take(MAX_MAGIC_LINE as u64)
            .read_until(b'\n', &mut line)?;
        if !line.starts_with(FILE_MAGIC.as_bytes()) || line.last() != Some(&b'\n') {
            let shown = String::from_utf8_lossy(&line[..line.len().min(32)]).into_owned();
            return Err(RtpError::InvalidCaptureHeader(format!(
                "missing {:?} line, found {shown:?}",
                FILE_MAGIC.trim_end()
            )));
        }

        let mut buf = [0u8; FILE_HEADER_LEN];
        inner.read_exact(&mut buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                RtpError::InvalidCaptureHeader("file header truncated".into())
            }
            _ => e.into(),
        })?;
        let header = CaptureHeader::decode(&buf);
        tracing::debug!(%header, "capture opened");
        Ok(Self { inner, header })
    }

    pub fn header(&self) -> &CaptureHeader {
        &self.header
    }

    /// Next record, or `None` at end of file. A record cut short by the end
    /// of the file is an error.
    pub fn read_record(&mut self) -> Result<Option<CaptureRecord>> {
        let mut hdr = [0u8; RECORD_HEADER_LEN];
        let got = read_full(&mut self.inner, &mut hdr)?;
        if got == 0 {
            return Ok(None);
        }
        if got < RECORD_HEADER_LEN {
            return Err(truncated("capture record header", RECORD_HEADER_LEN, got));
        }

        let stored_len = u16::from_be_bytes([hdr[0], hdr[1]]) as usize;
        let original_len = u16::from_be_bytes([hdr[2], hdr[3]]);
        let offset_ms = u32::from_be_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
        if stored_len < RECORD_HEADER_LEN {
            return Err(DecodeError::Malformed {
                what: "capture record",
                reason: "length shorter than record header",
            }
            .into());
        }

        let mut data = vec![0u8; stored_len - RECORD_HEADER_LEN];
        let got = read_full(&mut self.inner, &mut data)?;
        if got < data.len() {
            return Err(truncated("capture record", data.len(), got));
        }
        Ok(Some(CaptureRecord {
            offset_ms,
            original_len,
            data,
        }))
    }
}

impl<R: BufRead> Iterator for CaptureReader<R> {
    type Item = Result<CaptureRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record().transpose()
    }
}

fn truncated(what: &'static str, needed: usize, available: usize) -> RtpError {
    DecodeError::Truncated {
        what,
        needed,
        available,
    }
    .into()
}

/// Fill `buf` until it is full or the reader hits end of file.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
