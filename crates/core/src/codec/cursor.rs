use super::DecodeError;

/// Length-checked big-endian reader over a byte slice.
///
/// Every accessor validates the remaining length first and fails with
/// [`DecodeError::Truncated`] instead of reading past the end. Sub-structures
/// (an RTCP sub-packet, an SDES chunk) are walked by splitting off a child
/// cursor with [`split`](Self::split), so a bad inner length can never
/// escape the envelope it was declared in.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Cursor<'a> {
    /// Wrap `buf`. `what` names the structure in truncation errors.
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unread tail, without consuming it.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn ensure(&self, needed: usize) -> Result<(), DecodeError> {
        if self.remaining() < needed {
            return Err(DecodeError::Truncated {
                what: self.what,
                needed: self.pos + needed,
                available: self.buf.len(),
            });
        }
        Ok(())
    }

    /// Look at the next byte without consuming it.
    pub fn peek_u8(&self) -> Result<u8, DecodeError> {
        self.ensure(1)?;
        Ok(self.buf[self.pos])
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        self.ensure(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Consume exactly `n` bytes.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.ensure(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.bytes(n).map(|_| ())
    }

    /// Consume `n` bytes and return them as an independent cursor.
    pub fn split(&mut self, n: usize, what: &'static str) -> Result<Cursor<'a>, DecodeError> {
        let inner = self.bytes(n)?;
        Ok(Cursor::new(inner, what))
    }

    /// Skip forward to the next multiple of four, measured from the start
    /// of this cursor. Fails if the padding itself is missing.
    pub fn align4(&mut self) -> Result<(), DecodeError> {
        let pad = (4 - (self.pos & 3)) & 3;
        self.skip(pad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian() {
        let mut c = Cursor::new(&[0x12, 0x34, 0xde, 0xad, 0xbe, 0xef, 0x7f], "test");
        assert_eq!(c.u16().unwrap(), 0x1234);
        assert_eq!(c.u32().unwrap(), 0xdeadbeef);
        assert_eq!(c.u8().unwrap(), 0x7f);
        assert!(c.is_empty());
    }

    #[test]
    fn truncation_is_an_error() {
        let mut c = Cursor::new(&[1, 2, 3], "test");
        let err = c.u32().unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                what: "test",
                needed: 4,
                available: 3
            }
        );
        // a failed read consumes nothing
        assert_eq!(c.position(), 0);
    }

    #[test]
    fn split_bounds_inner_reads() {
        let mut c = Cursor::new(&[0, 0, 0, 1, 0xff], "outer");
        let mut inner = c.split(2, "inner").unwrap();
        assert_eq!(inner.u16().unwrap(), 0);
        assert!(inner.u8().is_err());
        assert_eq!(c.remaining(), 3);
    }

    #[test]
    fn align_to_word() {
        let mut c = Cursor::new(&[0; 8], "test");
        c.skip(5).unwrap();
        c.align4().unwrap();
        assert_eq!(c.position(), 8);
        c.align4().unwrap();
        assert_eq!(c.position(), 8);
    }
}
