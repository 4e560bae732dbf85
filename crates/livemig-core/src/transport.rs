use std::{
    collections::VecDeque,
    io::{self, IoSlice, Read, Write},
    net::{Shutdown, TcpStream},
    sync::Arc,
};

use parking_lot::{Condvar, Mutex};

/// An ordered, reliable byte stream carrying one multifd channel.
///
/// All methods take `&self` so that one thread can block in I/O while
/// another shuts the stream down. After [`shutdown`], blocked and future
/// calls fail with an error.
///
/// [`shutdown`]: Transport::shutdown
pub trait Transport: Send + Sync {
    /// Reads some bytes into `buf`, returning `Ok(0)` at end of stream.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes some bytes from `bufs`, returning the number written.
    fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Shuts down both directions of the stream.
    fn shutdown(&self) -> io::Result<()>;

    /// Closes the write direction. The peer reads the bytes already written
    /// and then end of stream.
    fn close_write(&self) -> io::Result<()>;

    /// Fills `buf` completely.
    fn read_all(&self, buf: &mut [u8]) -> io::Result<()> {
        if self.read_all_or_eof(buf)? || buf.is_empty() {
            return Ok(());
        }

        Err(io::ErrorKind::UnexpectedEof.into())
    }

    /// Fills `buf` completely, or returns `Ok(false)` if the stream ended
    /// cleanly before the first byte.
    fn read_all_or_eof(&self, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;

        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }

        Ok(true)
    }

    /// Writes every byte of `bufs`.
    fn write_all_vectored(&self, mut bufs: &mut [IoSlice<'_>]) -> io::Result<()> {
        IoSlice::advance_slices(&mut bufs, 0);

        while !bufs.is_empty() {
            match self.write_vectored(bufs) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => IoSlice::advance_slices(&mut bufs, n),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }
}

impl Transport for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        Write::write_vectored(&mut &*self, bufs)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn close_write(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Write)
    }
}

#[cfg(unix)]
impl Transport for std::os::unix::net::UnixStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        Write::write_vectored(&mut &*self, bufs)
    }

    fn shutdown(&self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, Shutdown::Both)
    }

    fn close_write(&self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, Shutdown::Write)
    }
}

#[derive(Default)]
struct PipeState {
    buf: VecDeque<u8>,
    writer_closed: bool,
    reader_closed: bool,
    aborted: bool,
}

/// One direction of a [`Pipe`].
struct PipeBuffer {
    state: Mutex<PipeState>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
}

impl PipeBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(PipeState::default()),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();

        loop {
            if state.aborted {
                return Err(io::ErrorKind::ConnectionAborted.into());
            }

            if !state.buf.is_empty() {
                break;
            }

            if state.writer_closed || buf.is_empty() {
                return Ok(0);
            }

            self.readable.wait(&mut state);
        }

        let n = buf.len().min(state.buf.len());
        for (dst, src) in buf.iter_mut().zip(state.buf.drain(..n)) {
            *dst = src;
        }

        self.writable.notify_all();
        Ok(n)
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();

        loop {
            if state.aborted {
                return Err(io::ErrorKind::ConnectionAborted.into());
            }

            if state.reader_closed || state.writer_closed {
                return Err(io::ErrorKind::BrokenPipe.into());
            }

            if state.buf.len() < self.capacity {
                break;
            }

            self.writable.wait(&mut state);
        }

        let n = data.len().min(self.capacity - state.buf.len());
        state.buf.extend(&data[..n]);

        self.readable.notify_all();
        Ok(n)
    }

    fn update(&self, f: impl FnOnce(&mut PipeState)) {
        f(&mut self.state.lock());
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

/// One end of an in-memory, bounded, bidirectional byte stream.
///
/// Writes block while the peer's buffer is full, the way a socket blocks on
/// a full send buffer. Dropping an end or [`Transport::close_write`] is a
/// clean close: the peer reads the remaining bytes and then end of stream.
/// [`Transport::shutdown`] on either
/// end aborts both directions and fails every pending call.
pub struct Pipe {
    rx: Arc<PipeBuffer>,
    tx: Arc<PipeBuffer>,
}

/// Creates a connected pair of [`Pipe`]s with a 64 KiB buffer per direction.
pub fn pipe() -> (Pipe, Pipe) {
    pipe_with_capacity(64 * 1024)
}

/// Creates a connected pair of [`Pipe`]s with `capacity` bytes of buffer per
/// direction.
pub fn pipe_with_capacity(capacity: usize) -> (Pipe, Pipe) {
    let a = Arc::new(PipeBuffer::new(capacity));
    let b = Arc::new(PipeBuffer::new(capacity));

    (
        Pipe {
            rx: a.clone(),
            tx: b.clone(),
        },
        Pipe { rx: b, tx: a },
    )
}

impl Transport for Pipe {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.rx.read(buf)
    }

    fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match bufs.iter().find(|buf| !buf.is_empty()) {
            Some(buf) => self.tx.write(buf),
            None => Ok(0),
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        self.rx.update(|state| state.aborted = true);
        self.tx.update(|state| state.aborted = true);
        Ok(())
    }

    fn close_write(&self) -> io::Result<()> {
        self.tx.update(|state| state.writer_closed = true);
        Ok(())
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        self.tx.update(|state| state.writer_closed = true);
        self.rx.update(|state| state.reader_closed = true);
    }
}
