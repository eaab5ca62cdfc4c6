//! RTP/AV payload-type registry (RFC 3551 §6, plus the historical
//! assignments still found in old captures).
//!
//! The table maps each of the 128 payload types to an encoding name, media
//! clock rate and channel count. The clock rate drives replay timing: a
//! timestamp delta of `d` ticks at rate `r` is `d / r` seconds.
//!
//! A replay session may override entries with a profile file, one entry per
//! line:
//!
//! ```text
//! # pt  encoding  rate   [channels]
//! 96    opus      48000  2
//! 97    H264      90000
//! ```

use std::borrow::Cow;
use std::path::Path;

use crate::error::{Result, RtpError};

/// Encoding name, clock rate and channel count of one payload type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadInfo {
    pub name: Cow<'static, str>,
    /// Media clock rate in ticks per second; 0 when unknown.
    pub rate: u32,
    /// Audio channel count; 0 for video and unknown types.
    pub channels: u8,
}

impl PayloadInfo {
    const fn fixed(name: &'static str, rate: u32, channels: u8) -> Self {
        Self {
            name: Cow::Borrowed(name),
            rate,
            channels,
        }
    }

    /// Seconds per media clock tick, if the rate is known.
    pub fn seconds_per_tick(&self) -> Option<f64> {
        (self.rate > 0).then(|| 1.0 / self.rate as f64)
    }
}

const RESERVED: PayloadInfo = PayloadInfo::fixed("reserved", 0, 0);
const UNASSIGNED: PayloadInfo = PayloadInfo::fixed("unassigned", 0, 0);
const DYNAMIC: PayloadInfo = PayloadInfo::fixed("dynamic", 0, 0);

const fn standard_entry(pt: usize) -> PayloadInfo {
    match pt {
        0 => PayloadInfo::fixed("PCMU", 8000, 1),
        1 | 2 | 19 => RESERVED,
        3 => PayloadInfo::fixed("GSM", 8000, 1),
        4 => PayloadInfo::fixed("G723", 8000, 1),
        5 => PayloadInfo::fixed("DVI4", 8000, 1),
        6 => PayloadInfo::fixed("DVI4", 16000, 1),
        7 => PayloadInfo::fixed("LPC", 8000, 1),
        8 => PayloadInfo::fixed("PCMA", 8000, 1),
        9 => PayloadInfo::fixed("G722", 8000, 1),
        10 => PayloadInfo::fixed("L16", 44100, 2),
        11 => PayloadInfo::fixed("L16", 44100, 1),
        12 => PayloadInfo::fixed("QCELP", 8000, 1),
        13 => PayloadInfo::fixed("CN", 8000, 0),
        14 => PayloadInfo::fixed("MPA", 90000, 0),
        15 => PayloadInfo::fixed("G728", 8000, 1),
        16 => PayloadInfo::fixed("DVI4", 11025, 1),
        17 => PayloadInfo::fixed("DVI4", 22050, 1),
        18 => PayloadInfo::fixed("G729", 8000, 1),
        25 => PayloadInfo::fixed("CelB", 90000, 0),
        26 => PayloadInfo::fixed("JPEG", 90000, 0),
        28 => PayloadInfo::fixed("nv", 90000, 0),
        31 => PayloadInfo::fixed("H261", 90000, 0),
        32 => PayloadInfo::fixed("MPV", 90000, 0),
        33 => PayloadInfo::fixed("MP2T", 90000, 0),
        34 => PayloadInfo::fixed("H263", 90000, 0),
        // 72-76 collide with RTCP packet types once the marker bit is set
        72..=76 => RESERVED,
        96..=127 => DYNAMIC,
        _ => UNASSIGNED,
    }
}

static STANDARD: [PayloadInfo; 128] = {
    let mut table = [UNASSIGNED; 128];
    let mut pt = 0;
    while pt < 128 {
        // the old slot is a borrowed placeholder; nothing to drop
        std::mem::forget(std::mem::replace(&mut table[pt], standard_entry(pt)));
        pt += 1;
    }
    table
};

/// Static lookup into the standard registry. `pt` is masked to 7 bits.
pub fn standard(pt: u8) -> &'static PayloadInfo {
    &STANDARD[(pt & 0x7f) as usize]
}

/// Per-session payload table: the standard registry plus profile overrides.
#[derive(Debug, Clone)]
pub struct PayloadTable {
    entries: Vec<PayloadInfo>,
}

impl PayloadTable {
    pub fn standard() -> Self {
        Self {
            entries: STANDARD.to_vec(),
        }
    }

    pub fn get(&self, pt: u8) -> &PayloadInfo {
        &self.entries[(pt & 0x7f) as usize]
    }

    pub fn set(&mut self, pt: u8, info: PayloadInfo) {
        tracing::debug!(pt, name = %info.name, rate = info.rate, "payload type override");
        self.entries[(pt & 0x7f) as usize] = info;
    }

    /// Apply profile text (see the module docs). Entries replace the
    /// standard ones; nothing is applied if any line is malformed.
    pub fn apply_profile(&mut self, text: &str) -> Result<()> {
        let mut parsed = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            parsed.push(parse_profile_line(idx + 1, line)?);
        }
        for (pt, info) in parsed {
            self.set(pt, info);
        }
        Ok(())
    }

    /// Read and apply a profile file.
    pub fn load_profile(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        self.apply_profile(&text)
    }
}

impl Default for PayloadTable {
    fn default() -> Self {
        Self::standard()
    }
}

fn parse_profile_line(line: usize, text: &str) -> Result<(u8, PayloadInfo)> {
    let invalid = |reason: &str| RtpError::InvalidProfile {
        line,
        reason: reason.to_string(),
    };
    let fields: Vec<&str> = text.split_whitespace().collect();
    if !(3..=4).contains(&fields.len()) {
        return Err(invalid("expected: <pt> <encoding> <rate> [channels]"));
    }
    let pt: u8 = fields[0]
        .parse()
        .ok()
        .filter(|pt| *pt < 128)
        .ok_or_else(|| invalid("payload type must be 0-127"))?;
    let rate: u32 = fields[2]
        .parse()
        .ok()
        .filter(|rate| *rate > 0)
        .ok_or_else(|| invalid("rate must be a positive integer"))?;
    let channels: u8 = match fields.get(3) {
        Some(ch) => ch.parse().map_err(|_| invalid("invalid channel count"))?,
        None => 0,
    };
    Ok((
        pt,
        PayloadInfo {
            name: Cow::Owned(fields[1].to_string()),
            rate,
            channels,
        },
    ))
}
