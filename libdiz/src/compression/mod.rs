//! Parallel block-compressing deflate writer.
//!
//! Input is cut into fixed-size blocks. Every block is compressed on the
//! shared [`DeflateWorkers`] pool, primed with the last [`TAIL_SIZE`] bytes of
//! the previous block, while a single drain thread writes finished blocks to
//! the sink strictly in the order they were submitted. The slot queue between
//! `write` and the drain holds at most `concurrency` blocks, which is what
//! bounds memory and applies back-pressure to the writer.

pub mod config;
mod latch;
mod pool;
pub mod workers;

use std::io::{self, Write};
use std::mem;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

pub use config::{CompressionConfig, DEFAULT_BLOCK_SIZE, DEFAULT_LEVEL, TAIL_SIZE};
pub use workers::DeflateWorkers;

use latch::ErrorLatch;
use pool::BufferPool;
use workers::Job;

/// Output placeholder for one block, reserved in submission order.
struct Slot {
    result: Receiver<Vec<u8>>,
    /// Dropped by the drain once the block reached the sink.
    written: Sender<()>,
}

pub struct BlockCompressor<W: Write + Send + 'static> {
    workers: Arc<DeflateWorkers>,
    block_size: usize,
    current: Vec<u8>,
    tail: Option<Vec<u8>>,
    digest: crc32fast::Hasher,
    size: u64,
    closed: bool,
    latch: Arc<ErrorLatch>,
    pool: Arc<BufferPool>,
    slots: Option<Sender<Slot>>,
    drain: Option<JoinHandle<W>>,
}

impl<W: Write + Send + 'static> BlockCompressor<W> {
    /// Creates a compressor writing to `sink` that runs its blocks on `workers`.
    pub fn new(sink: W, workers: Arc<DeflateWorkers>) -> io::Result<Self> {
        let config = *workers.config();
        let latch = Arc::new(ErrorLatch::new());
        let pool = Arc::new(BufferPool::new(config.block_size, config.concurrency));
        let (slots_tx, slots_rx) = crossbeam_channel::bounded(config.concurrency);

        let drain = {
            let latch = latch.clone();
            let pool = pool.clone();
            std::thread::Builder::new()
                .name("diz-drain".to_string())
                .spawn(move || drain(sink, slots_rx, &latch, &pool))?
        };

        Ok(Self {
            workers,
            block_size: config.block_size,
            current: pool.get(),
            tail: None,
            digest: crc32fast::Hasher::new(),
            size: 0,
            closed: false,
            latch,
            pool,
            slots: Some(slots_tx),
            drain: Some(drain),
        })
    }

    /// Creates a compressor with a private worker pool.
    pub fn with_config(sink: W, config: CompressionConfig) -> crate::Result<Self> {
        let workers = Arc::new(DeflateWorkers::new(config)?);
        Ok(Self::new(sink, workers)?)
    }

    /// Number of uncompressed bytes accepted so far.
    pub fn uncompressed_size(&self) -> u64 {
        self.size
    }

    /// CRC-32 (IEEE) of the uncompressed bytes accepted so far.
    pub fn crc32(&self) -> u32 {
        self.digest.clone().finalize()
    }

    /// Terminates the deflate stream, waits for every block to reach the sink
    /// and hands the sink back.
    ///
    /// Threads are released even when an error was latched earlier; that
    /// error is what gets returned.
    pub fn finish(mut self) -> io::Result<W> {
        let res = if self.latch.get().is_none() && !self.closed {
            self.closed = true;
            self.submit_current(true, true)
        } else {
            Ok(())
        };

        self.slots.take();
        let sink = match self.drain.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| io::Error::other("drain thread panicked"))?,
            None => return Err(io::Error::other("compressor already finished")),
        };

        self.latch.check()?;
        res?;
        Ok(sink)
    }

    fn submit_current(&mut self, last: bool, wait: bool) -> io::Result<()> {
        let block = mem::replace(&mut self.current, self.pool.get());
        debug_assert!(block.len() <= self.block_size);

        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let (written_tx, written_rx) = crossbeam_channel::bounded::<()>(0);
        let slot = Slot {
            result: result_rx,
            written: written_tx,
        };

        let slots = self
            .slots
            .as_ref()
            .ok_or_else(|| io::Error::other("compressor is finished"))?;
        crossbeam_channel::select! {
            send(slots, slot) -> res => {
                if res.is_err() {
                    let err = io::Error::other("drain thread stopped");
                    self.latch.set(&err);
                    return Err(err);
                }
            }
            recv(self.latch.signal()) -> _ => {
                return Err(self
                    .latch
                    .get()
                    .unwrap_or_else(|| io::Error::other("compression failed")));
            }
        }

        let dictionary = self.tail.take();
        if block.len() > TAIL_SIZE {
            let mut tail = Vec::with_capacity(TAIL_SIZE);
            tail.extend_from_slice(&block[block.len() - TAIL_SIZE..]);
            self.tail = Some(tail);
        }

        let job = Job {
            block,
            dictionary,
            last,
            result: result_tx,
            latch: self.latch.clone(),
            pool: self.pool.clone(),
        };
        if let Err(err) = self.workers.submit(job) {
            self.latch.set(&err);
            return Err(err);
        }

        if wait {
            // Disconnects once the drain has written (or skipped) the block.
            let _ = written_rx.recv();
        }
        self.latch.check()
    }
}

impl<W: Write + Send + 'static> Write for BlockCompressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.latch.check()?;
        if self.closed {
            return Err(io::Error::other("write to finished compressor"));
        }

        let mut rest = buf;
        while !rest.is_empty() {
            let n = rest.len().min(self.block_size - self.current.len());
            let (chunk, tail) = rest.split_at(n);
            self.digest.update(chunk);
            self.current.extend_from_slice(chunk);
            self.size += n as u64;
            rest = tail;

            if self.current.len() == self.block_size {
                self.submit_current(false, false)?;
            }
        }
        Ok(buf.len())
    }

    /// Submits the partial block and blocks until everything written so far
    /// reached the sink as a byte-aligned deflate prefix.
    fn flush(&mut self) -> io::Result<()> {
        self.latch.check()?;
        if self.closed {
            return Ok(());
        }
        self.submit_current(false, true)
    }
}

impl<W: Write + Send + 'static> Drop for BlockCompressor<W> {
    fn drop(&mut self) {
        self.slots.take();
        if let Some(handle) = self.drain.take() {
            let _ = handle.join();
        }
    }
}

fn drain<W: Write>(
    mut sink: W,
    slots: Receiver<Slot>,
    latch: &ErrorLatch,
    pool: &BufferPool,
) -> W {
    let mut failed = false;
    for slot in slots {
        if !failed {
            match slot.result.recv() {
                Ok(buf) => match sink.write_all(&buf) {
                    Ok(()) => pool.put(buf),
                    Err(err) => {
                        latch.set(&err);
                        failed = true;
                    }
                },
                // Workers latch their own errors; this covers a worker that
                // went away without sending.
                Err(_) => {
                    latch.set(&io::Error::other("compression worker terminated"));
                    failed = true;
                }
            }
        }
        drop(slot.written);
    }
    sink
}
