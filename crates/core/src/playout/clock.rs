use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::capture::CaptureRecord;
use crate::codec::{PayloadTable, RtpHeader};

/// Last scheduled (wall-clock instant, media timestamp) pair of one SSRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayoutClock {
    pub real: Instant,
    pub timestamp: u32,
}

impl PlayoutClock {
    /// Playout instant of a packet carrying `timestamp`, derived from the
    /// media clock alone.
    ///
    /// The timestamp difference is taken as a signed 32-bit value, so
    /// wrap-around and mild reordering both work. An unknown rate (0) maps
    /// every packet onto the previous instant.
    pub fn advance(&self, timestamp: u32, rate: u32) -> Instant {
        if rate == 0 {
            return self.real;
        }
        let ticks = timestamp.wrapping_sub(self.timestamp) as i32;
        let gap = Duration::from_secs_f64(ticks.unsigned_abs() as f64 / rate as f64);
        if ticks >= 0 {
            self.real + gap
        } else {
            self.real.checked_sub(gap).unwrap_or(self.real)
        }
    }
}

/// Computes playout instants for capture records.
///
/// RTP records are paced by their own media clock once their SSRC has been
/// seen; the first packet of an SSRC, RTCP, vat and anything that does not
/// decode as RTP are paced by their capture offset. In wallclock mode every
/// record is paced by its capture offset.
#[derive(Debug)]
pub struct Scheduler {
    payloads: PayloadTable,
    clocks: HashMap<u32, PlayoutClock>,
    wallclock: bool,
}

impl Scheduler {
    pub fn new(payloads: PayloadTable, wallclock: bool) -> Self {
        Self {
            payloads,
            clocks: HashMap::new(),
            wallclock,
        }
    }

    /// Playout instant for `record`, given the session start and the
    /// record's offset from the first played record.
    pub fn schedule(
        &mut self,
        start: Instant,
        record: &CaptureRecord,
        offset: Duration,
    ) -> Instant {
        let by_offset = start + offset;
        if self.wallclock || record.is_control() {
            return by_offset;
        }
        let Ok((header, _)) = RtpHeader::decode(&record.data) else {
            return by_offset;
        };

        let next = match self.clocks.get(&header.ssrc) {
            Some(clock) => {
                let rate = self.payloads.get(header.payload_type).rate;
                clock.advance(header.timestamp, rate)
            }
            None => {
                tracing::debug!(
                    ssrc = format_args!("{:#010X}", header.ssrc),
                    pt = header.payload_type,
                    "new source"
                );
                by_offset
            }
        };
        self.clocks.insert(
            header.ssrc,
            PlayoutClock {
                real: next,
                timestamp: header.timestamp,
            },
        );
        next
    }

    pub fn clock(&self, ssrc: u32) -> Option<&PlayoutClock> {
        self.clocks.get(&ssrc)
    }

    pub fn payloads(&self) -> &PayloadTable {
        &self.payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtp(pt: u8, ts: u32, ssrc: u32, offset_ms: u32) -> CaptureRecord {
        let mut data = RtpHeader::new(pt, 0, ts, ssrc).to_bytes();
        data.extend_from_slice(&[0u8; 160]);
        CaptureRecord::data(offset_ms, data)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn media_clock_sets_the_gap() {
        let start = Instant::now();
        let mut s = Scheduler::new(PayloadTable::standard(), false);

        let first = s.schedule(start, &rtp(0, 1000, 7, 0), ms(0));
        assert_eq!(first, start);
        // captured 500 ms later (jitter), but only 160 ticks at 8 kHz apart
        let second = s.schedule(start, &rtp(0, 1160, 7, 500), ms(500));
        assert_eq!(second - first, ms(20));
        assert_eq!(s.clock(7).map(|c| c.timestamp), Some(1160));
    }

    #[test]
    fn sources_are_paced_independently() {
        let start = Instant::now();
        let mut s = Scheduler::new(PayloadTable::standard(), false);
        s.schedule(start, &rtp(0, 0, 1, 0), ms(0));
        let other = s.schedule(start, &rtp(31, 0, 2, 40), ms(40));
        assert_eq!(other, start + ms(40));
        let video = s.schedule(start, &rtp(31, 9000, 2, 41), ms(41));
        assert_eq!(video - other, ms(100));
    }

    #[test]
    fn reordered_timestamp_moves_backwards() {
        let start = Instant::now() + ms(1000);
        let mut s = Scheduler::new(PayloadTable::standard(), false);
        let a = s.schedule(start, &rtp(0, 8000, 1, 0), ms(0));
        let b = s.schedule(start, &rtp(0, 7840, 1, 5), ms(5));
        assert_eq!(a - b, ms(20));
    }

    #[test]
    fn timestamp_wraparound() {
        let start = Instant::now();
        let mut s = Scheduler::new(PayloadTable::standard(), false);
        let a = s.schedule(start, &rtp(0, u32::MAX - 79, 1, 0), ms(0));
        let b = s.schedule(start, &rtp(0, 80, 1, 20), ms(20));
        assert_eq!(b - a, ms(20));
    }

    #[test]
    fn unknown_rate_has_no_gap() {
        let start = Instant::now();
        let mut s = Scheduler::new(PayloadTable::standard(), false);
        let a = s.schedule(start, &rtp(96, 0, 1, 0), ms(0));
        let b = s.schedule(start, &rtp(96, 3000, 1, 33), ms(33));
        assert_eq!(a, b);
    }

    #[test]
    fn profile_rate_is_used() {
        let start = Instant::now();
        let mut table = PayloadTable::standard();
        table.apply_profile("96 opus 48000 2").unwrap();
        let mut s = Scheduler::new(table, false);
        let a = s.schedule(start, &rtp(96, 0, 1, 0), ms(0));
        let b = s.schedule(start, &rtp(96, 960, 1, 33), ms(33));
        assert_eq!(b - a, ms(20));
    }

    #[test]
    fn control_vat_and_wallclock_use_offsets() {
        let start = Instant::now();
        let mut s = Scheduler::new(PayloadTable::standard(), false);
        s.schedule(start, &rtp(0, 0, 1, 0), ms(0));

        let rtcp = CaptureRecord::control(300, vec![0x80, 201, 0, 1, 0, 0, 0, 1]);
        assert_eq!(s.schedule(start, &rtcp, ms(300)), start + ms(300));

        let vat = CaptureRecord::data(310, vec![0x00; 40]);
        assert_eq!(s.schedule(start, &vat, ms(310)), start + ms(310));

        let mut wall = Scheduler::new(PayloadTable::standard(), true);
        wall.schedule(start, &rtp(0, 0, 1, 0), ms(0));
        assert_eq!(
            wall.schedule(start, &rtp(0, 160, 1, 37), ms(37)),
            start + ms(37)
        );
        assert!(wall.clock(1).is_none());
    }
}
