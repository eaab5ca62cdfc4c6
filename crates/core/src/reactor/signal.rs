//! Self-pipe signal delivery.
//!
//! The installed handler only writes the signal number as one byte to a
//! non-blocking socket. The reactor polls the other end like any other
//! descriptor and runs the registered handlers on its own thread.
//!
//! The write end is process-global, so only one pipe is active at a time:
//! opening a second one redirects delivery to it.

use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicI32, Ordering};

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(signum: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        // SAFETY: write(2) is async-signal-safe; a full pipe drops the byte.
        unsafe {
            libc::write(fd, (&byte as *const u8).cast(), 1);
        }
    }
}

pub(crate) struct SignalPipe {
    reader: UnixStream,
    writer: UnixStream,
    installed: Vec<i32>,
}

impl SignalPipe {
    pub(crate) fn open() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        WRITE_FD.store(writer.as_raw_fd(), Ordering::SeqCst);
        Ok(Self {
            reader,
            writer,
            installed: Vec::new(),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Route `signum` into the pipe.
    pub(crate) fn install(&mut self, signum: i32) -> io::Result<()> {
        if self.installed.contains(&signum) {
            return Ok(());
        }
        let handler = on_signal as extern "C" fn(libc::c_int);
        // SAFETY: the handler only touches an atomic and calls write(2).
        let prev = unsafe { libc::signal(signum, handler as libc::sighandler_t) };
        if prev == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
        self.installed.push(signum);
        Ok(())
    }

    /// Read every pending signal number.
    pub(crate) fn drain(&mut self) -> Vec<i32> {
        let mut signals = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => signals.extend(buf[..n].iter().map(|&b| b as i32)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        tracing::warn!(error = %e, "signal pipe read failed");
                    }
                    break;
                }
            }
        }
        signals
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        for &signum in &self.installed {
            // SAFETY: restoring the default disposition.
            unsafe {
                libc::signal(signum, libc::SIG_DFL);
            }
        }
        let _ = WRITE_FD.compare_exchange(
            self.writer.as_raw_fd(),
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}
