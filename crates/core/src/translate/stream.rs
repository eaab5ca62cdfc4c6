use std::fmt;

use rand::RngExt;

/// Synthesized RTP sequencing state of one sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamIdentity {
    /// Sender IPv4 address, also used as the SSRC.
    pub addr: u32,
    /// Sequence number given to the sender's latest packet.
    pub seq: u16,
    /// Timestamp expected on the sender's next packet.
    pub next_ts: u32,
}

/// Per-sender sequence numbers for a timestamp-only source format.
///
/// Streams are kept ordered by address and found by binary search. The
/// most recently used stream is checked first, since consecutive packets
/// usually come from the same talker.
pub struct StreamTracker {
    streams: Vec<StreamIdentity>,
    last: Option<usize>,
    seed: Box<dyn FnMut() -> u16>,
}

impl StreamTracker {
    /// Tracker seeding new streams from the thread-local RNG.
    pub fn new() -> Self {
        Self::with_seed(|| rand::rng().random::<u16>())
    }

    /// Tracker with a custom source of initial sequence numbers.
    pub fn with_seed(seed: impl FnMut() -> u16 + 'static) -> Self {
        Self {
            streams: Vec::new(),
            last: None,
            seed: Box::new(seed),
        }
    }

    /// Sequence number for a packet from `addr` with timestamp `ts`, whose
    /// successor is expected at `next_ts`.
    ///
    /// A known stream advances by one, and by one more when `ts` is not the
    /// expected timestamp and `marker` is clear (a packet was probably
    /// lost). A new stream starts at a random sequence number.
    pub fn next_sequence(&mut self, addr: u32, ts: u32, next_ts: u32, marker: bool) -> u16 {
        let idx = match self.last {
            Some(i) if self.streams[i].addr == addr => Ok(i),
            _ => self.streams.binary_search_by_key(&addr, |s| s.addr),
        };
        match idx {
            Ok(i) => {
                let stream = &mut self.streams[i];
                let step = if ts != stream.next_ts && !marker { 2 } else { 1 };
                stream.seq = stream.seq.wrapping_add(step);
                stream.next_ts = next_ts;
                self.last = Some(i);
                stream.seq
            }
            Err(i) => {
                let seq = (self.seed)();
                self.streams.insert(
                    i,
                    StreamIdentity {
                        addr,
                        seq,
                        next_ts,
                    },
                );
                self.last = Some(i);
                tracing::debug!(
                    addr = %std::net::Ipv4Addr::from(addr),
                    seq,
                    streams = self.streams.len(),
                    "new stream"
                );
                seq
            }
        }
    }

    pub fn get(&self, addr: u32) -> Option<&StreamIdentity> {
        self.streams
            .binary_search_by_key(&addr, |s| s.addr)
            .ok()
            .map(|i| &self.streams[i])
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl Default for StreamTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StreamTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTracker")
            .field("streams", &self.streams)
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(seq: u16) -> StreamTracker {
        StreamTracker::with_seed(move || seq)
    }

    #[test]
    fn new_stream_takes_seed() {
        let mut t = fixed(1000);
        assert_eq!(t.next_sequence(0x0a000001, 0, 160, true), 1000);
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(0x0a000001).map(|s| s.next_ts), Some(160));
    }

    #[test]
    fn random_seed_then_sequential() {
        let mut t = StreamTracker::new();
        let first = t.next_sequence(9, 0, 160, true);
        assert_eq!(t.next_sequence(9, 160, 320, false), first.wrapping_add(1));
    }

    #[test]
    fn expected_timestamp_advances_by_one() {
        let mut t = fixed(1000);
        t.next_sequence(7, 0, 160, true);
        assert_eq!(t.next_sequence(7, 160, 320, false), 1001);
        assert_eq!(t.next_sequence(7, 320, 480, false), 1002);
    }

    #[test]
    fn unexpected_timestamp_advances_by_two() {
        let mut t = fixed(1000);
        t.next_sequence(7, 0, 160, true);
        assert_eq!(t.next_sequence(7, 480, 640, false), 1002);
        // a marked packet starts a talkspurt: the gap is silence, not loss
        assert_eq!(t.next_sequence(7, 8000, 8160, true), 1003);
    }

    #[test]
    fn sequence_wraps() {
        let mut t = fixed(u16::MAX);
        t.next_sequence(1, 0, 10, false);
        assert_eq!(t.next_sequence(1, 10, 20, false), 0);
    }

    #[test]
    fn streams_stay_ordered_and_independent() {
        let mut seeds = [300u16, 200, 100].into_iter();
        let mut t = StreamTracker::with_seed(move || seeds.next().unwrap_or(0));
        t.next_sequence(30, 0, 10, false);
        t.next_sequence(10, 0, 10, false);
        t.next_sequence(20, 0, 10, false);
        let addrs: Vec<_> = t.streams.iter().map(|s| s.addr).collect();
        assert_eq!(addrs, vec![10, 20, 30]);

        // interleaved senders, each missing the MRU slot in turn
        assert_eq!(t.next_sequence(30, 10, 20, false), 301);
        assert_eq!(t.next_sequence(10, 10, 20, false), 201);
        assert_eq!(t.next_sequence(20, 10, 20, false), 101);
        assert_eq!(t.next_sequence(30, 20, 30, false), 302);
    }

    #[test]
    fn default_seed_is_not_derived_from_address() {
        let seeds: Vec<u16> = (0..8)
            .map(|_| StreamTracker::new().next_sequence(0xC0A8_0001, 0, 160, false))
            .collect();
        assert!(seeds.iter().any(|&s| s != seeds[0]));
    }
}
