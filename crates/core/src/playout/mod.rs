//! Capture file replay.
//!
//! A [`Player`] is the state of a [`Reactor`]. It keeps a read-ahead ring of
//! [`PlayoutConfig::read_ahead`] slots, each holding one record waiting for
//! its playout instant. The slot index is the timer client id: when a slot's
//! timer fires the record is sent, the slot is freed and the next record
//! from the file is read into a free slot and scheduled.
//!
//! ```text
//!  capture file ──► [ slot 0 | slot 1 | ... | slot N-1 ] ──timer──► sink
//!                     one pending timer per occupied slot
//! ```
//!
//! The ring absorbs reordering of up to N records in the capture: a record
//! read late may still be scheduled before records already in the ring.

mod clock;

pub use clock::{PlayoutClock, Scheduler};

use std::io::{self, BufRead};
use std::time::{Duration, Instant};

use crate::capture::{CaptureReader, CaptureRecord};
use crate::codec::{PayloadTable, RtpHeader};
use crate::reactor::Reactor;
use crate::timer::{ClientId, Deadline, HasTimers};

/// Default depth of the read-ahead ring.
pub const DEFAULT_READ_AHEAD: usize = 16;

/// Replay options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayoutConfig {
    /// Records captured before this offset are skipped.
    pub begin: Duration,
    /// Reading stops at the first record captured after this offset.
    pub end: Option<Duration>,
    /// Pace every record by its capture offset instead of its media clock.
    pub wallclock: bool,
    pub read_ahead: usize,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            begin: Duration::ZERO,
            end: None,
            wallclock: false,
            read_ahead: DEFAULT_READ_AHEAD,
        }
    }
}

/// Destination of replayed packets.
pub trait PacketSink {
    /// Send one packet; `control` selects the RTCP destination.
    fn send(&mut self, packet: &[u8], control: bool) -> io::Result<()>;
}

/// A sent packet as seen by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    pub at: Instant,
    pub control: bool,
    pub data: Vec<u8>,
}

/// Sink that keeps every packet in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub packets: Vec<SentPacket>,
}

impl PacketSink for MemorySink {
    fn send(&mut self, packet: &[u8], control: bool) -> io::Result<()> {
        self.packets.push(SentPacket {
            at: Instant::now(),
            control,
            data: packet.to_vec(),
        });
        Ok(())
    }
}

/// Replay counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayoutStats {
    pub read: u64,
    /// Records before the begin offset.
    pub skipped: u64,
    pub sent: u64,
    pub send_errors: u64,
}

pub struct Player<R: BufRead, K: PacketSink> {
    reader: CaptureReader<R>,
    sink: K,
    scheduler: Scheduler,
    config: PlayoutConfig,
    slots: Vec<Option<CaptureRecord>>,
    first_offset: Option<u32>,
    session_start: Option<Instant>,
    reading_done: bool,
    stats: PlayoutStats,
}

impl<R, K> Player<R, K>
where
    R: BufRead + 'static,
    K: PacketSink + 'static,
{
    pub fn new(
        reader: CaptureReader<R>,
        sink: K,
        payloads: PayloadTable,
        config: PlayoutConfig,
    ) -> Self {
        let depth = config.read_ahead.max(1);
        Self {
            reader,
            sink,
            scheduler: Scheduler::new(payloads, config.wallclock),
            config,
            slots: (0..depth).map(|_| None).collect(),
            first_offset: None,
            session_start: None,
            reading_done: false,
            stats: PlayoutStats::default(),
        }
    }

    /// Fill the read-ahead ring and schedule every buffered record. Run the
    /// reactor afterwards to play them out.
    pub fn start(reactor: &mut Reactor<Self>) {
        let depth = reactor.state().slots.len();
        for _ in 0..depth {
            Self::fill_slot(reactor);
        }
        let player = reactor.state();
        tracing::debug!(
            buffered = player.buffered(),
            done = player.reading_done,
            "replay primed"
        );
        if player.is_drained() {
            reactor.stop();
        }
    }

    fn on_timer(reactor: &mut Reactor<Self>, client: ClientId) {
        reactor.state_mut().transmit(client as usize);
        Self::fill_slot(reactor);
        if reactor.state().is_drained() {
            tracing::debug!(stats = ?reactor.state().stats, "replay finished");
            reactor.stop();
        }
    }

    /// Read the next playable record into a free slot and schedule it.
    fn fill_slot(reactor: &mut Reactor<Self>) {
        let player = reactor.state_mut();
        if player.reading_done {
            return;
        }
        let Some(slot) = player.slots.iter().position(Option::is_none) else {
            return;
        };
        let Some(record) = player.next_record() else {
            return;
        };

        let now = Instant::now();
        let first = *player.first_offset.get_or_insert(record.offset_ms);
        let start = *player.session_start.get_or_insert(now);
        let offset = Duration::from_millis(record.offset_ms.saturating_sub(first) as u64);
        let due = player.scheduler.schedule(start, &record, offset);
        tracing::trace!(
            slot,
            offset_ms = record.offset_ms,
            delay_us = due.saturating_duration_since(now).as_micros() as u64,
            "record scheduled"
        );
        player.slots[slot] = Some(record);
        reactor
            .timers()
            .schedule(slot as ClientId, Deadline::At(due), Self::on_timer);
    }
}

impl<R: BufRead, K: PacketSink> Player<R, K> {
    /// Next record inside the begin/end window, or `None` once reading is
    /// over.
    fn next_record(&mut self) -> Option<CaptureRecord> {
        loop {
            let record = match self.reader.read_record() {
                Ok(Some(record)) => record,
                Ok(None) => {
                    tracing::debug!(read = self.stats.read, "end of capture");
                    self.reading_done = true;
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "capture unreadable, stopping replay");
                    self.reading_done = true;
                    return None;
                }
            };
            self.stats.read += 1;
            let offset = Duration::from_millis(record.offset_ms as u64);
            if offset < self.config.begin {
                self.stats.skipped += 1;
                continue;
            }
            if self.config.end.is_some_and(|end| offset > end) {
                tracing::debug!(offset_ms = record.offset_ms, "end of replay window");
                self.reading_done = true;
                return None;
            }
            return Some(record);
        }
    }

    fn transmit(&mut self, slot: usize) {
        let Some(record) = self.slots.get_mut(slot).and_then(Option::take) else {
            return;
        };
        let control = record.is_control();
        let header = match control {
            true => None,
            false => RtpHeader::decode(&record.data).ok().map(|(h, _)| h),
        };
        if let Some(header) = header {
            tracing::debug!(
                len = record.data.len(),
                offset_ms = record.offset_ms,
                pt = header.payload_type,
                ssrc = format_args!("{:#010X}", header.ssrc),
                ts = header.timestamp,
                seq = header.sequence,
                marker = header.marker,
                "send RTP"
            );
        } else {
            tracing::debug!(
                len = record.data.len(),
                offset_ms = record.offset_ms,
                control,
                "send"
            );
        }
        match self.sink.send(&record.data, control) {
            Ok(()) => self.stats.sent += 1,
            Err(e) => {
                tracing::warn!(error = %e, control, "send failed, packet dropped");
                self.stats.send_errors += 1;
            }
        }
    }

    /// Records waiting in the read-ahead ring.
    pub fn buffered(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_drained(&self) -> bool {
        self.reading_done && self.buffered() == 0
    }

    pub fn stats(&self) -> PlayoutStats {
        self.stats
    }

    /// Wall-clock instant the first played record was scheduled against.
    pub fn session_start(&self) -> Option<Instant> {
        self.session_start
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn into_sink(self) -> K {
        self.sink
    }
}
