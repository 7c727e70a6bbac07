//! Pipelined output writing.
//!
//! Block production (graph walk, patching, record copying) and the actual
//! writes run on separate threads, joined by a bounded channel so the
//! producer can never run arbitrarily far ahead of the disk. Small blocks
//! are merged in a staging cache before submission to keep the channel
//! traffic in large chunks.

use std::io::{self, Write};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use tracing::debug;

use crate::error::{Result, SortError};

/// Staging cache size; also the preferred chunk size on the channel.
const CACHE_SIZE: usize = 64 * 1024;
/// Chunks the writer thread may buffer before the producer blocks.
const CHANNEL_DEPTH: usize = 16;

/// Ordered byte sink with a dedicated writer thread.
///
/// [`put`](Self::put) returns the output address the bytes will land at;
/// addresses are assigned at submission, so link patching can rely on them
/// long before the bytes reach the disk.
pub struct BlockSink {
    tx: Option<Sender<Vec<u8>>>,
    cache: Vec<u8>,
    /// Output address of the next submitted byte (staged bytes included).
    position: u64,
    handle: Option<JoinHandle<io::Result<u64>>>,
}

impl BlockSink {
    /// Spawn the writer thread over `out`.
    pub fn spawn<W: Write + Send + 'static>(mut out: W) -> Self {
        let (tx, rx) = bounded::<Vec<u8>>(CHANNEL_DEPTH);
        let handle = thread::spawn(move || {
            let mut written = 0u64;
            for chunk in rx {
                out.write_all(&chunk)?;
                written += chunk.len() as u64;
            }
            out.flush()?;
            debug!(written, "writer thread drained");
            Ok(written)
        });
        Self {
            tx: Some(tx),
            cache: Vec::with_capacity(CACHE_SIZE),
            position: 0,
            handle: Some(handle),
        }
    }

    /// Output address of the next byte.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Append `bytes` to the output, returning their output address.
    pub fn put(&mut self, bytes: &[u8]) -> Result<u64> {
        let addr = self.position;
        if self.cache.len() + bytes.len() > CACHE_SIZE && !self.cache.is_empty() {
            self.submit()?;
        }
        if bytes.len() >= CACHE_SIZE {
            self.send(bytes.to_vec())?;
        } else {
            self.cache.extend_from_slice(bytes);
        }
        self.position += bytes.len() as u64;
        Ok(addr)
    }

    /// Flush the staging cache and stop the writer thread, returning the
    /// total byte count it confirmed on disk.
    pub fn finish(mut self) -> Result<u64> {
        self.submit()?;
        drop(self.tx.take());
        self.join()
    }

    fn submit(&mut self) -> Result<()> {
        if self.cache.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.cache, Vec::with_capacity(CACHE_SIZE));
        self.send(chunk)
    }

    fn send(&mut self, chunk: Vec<u8>) -> Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| {
            SortError::Corrupt("write submitted after the sink was finished".into())
        })?;
        if tx.send(chunk).is_err() {
            // The writer thread is gone; join it to surface its error.
            self.tx = None;
            return Err(self.join().expect_err_or_broken());
        }
        Ok(())
    }

    fn join(&mut self) -> Result<u64> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(res) => res.map_err(SortError::Io),
                Err(_) => Err(SortError::Corrupt("writer thread panicked".into())),
            },
            None => Err(SortError::Corrupt("writer thread already joined".into())),
        }
    }
}

trait ExpectErr {
    fn expect_err_or_broken(self) -> SortError;
}

impl ExpectErr for Result<u64> {
    fn expect_err_or_broken(self) -> SortError {
        match self {
            Err(e) => e,
            // Channel closed without a writer error should not happen while
            // the sink is live; report the broken pipe rather than succeed.
            Ok(_) => SortError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "writer thread exited early")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Write adapter capturing everything into shared memory.
    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Fails every write once `limit` bytes went through.
    struct Failing {
        limit: usize,
        seen: usize,
    }

    impl Write for Failing {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.seen + buf.len() > self.limit {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.seen += buf.len();
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn preserves_submission_order_and_addresses() {
        let out = Shared::default();
        let mut sink = BlockSink::spawn(out.clone());

        let mut expected = Vec::new();
        for i in 0u32..500 {
            let chunk: Vec<u8> = (0..((i % 97) + 1)).map(|j| (i + j) as u8).collect();
            let addr = sink.put(&chunk).unwrap();
            assert_eq!(addr, expected.len() as u64);
            expected.extend_from_slice(&chunk);
        }
        assert_eq!(sink.position(), expected.len() as u64);
        let written = sink.finish().unwrap();
        assert_eq!(written, expected.len() as u64);
        assert_eq!(*out.0.lock().unwrap(), expected);
    }

    #[test]
    fn large_puts_bypass_the_cache() {
        let out = Shared::default();
        let mut sink = BlockSink::spawn(out.clone());
        sink.put(&[1, 2, 3]).unwrap();
        let big = vec![7u8; CACHE_SIZE * 2];
        let addr = sink.put(&big).unwrap();
        assert_eq!(addr, 3);
        sink.put(&[9]).unwrap();
        sink.finish().unwrap();
        let got = out.0.lock().unwrap();
        assert_eq!(got.len(), 4 + CACHE_SIZE * 2);
        assert_eq!(got[3..3 + CACHE_SIZE * 2], big[..]);
        assert_eq!(got[got.len() - 1], 9);
    }

    #[test]
    fn writer_errors_reach_the_producer() {
        let mut sink = BlockSink::spawn(Failing { limit: CACHE_SIZE, seen: 0 });
        let chunk = vec![0u8; CACHE_SIZE];
        // Keep submitting until the failure propagates through the channel
        // or the sink is finished; one of the two must report it.
        let mut failed = false;
        for _ in 0..64 {
            if sink.put(&chunk).is_err() {
                failed = true;
                break;
            }
        }
        if !failed {
            assert!(sink.finish().is_err());
        }
    }
}
