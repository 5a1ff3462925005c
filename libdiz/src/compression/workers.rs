use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use flate2::{Compress, Compression, FlushCompress, Status};

use super::config::CompressionConfig;
use super::latch::ErrorLatch;
use super::pool::BufferPool;
use crate::error::Result;

/// One block of work handed to the worker pool.
pub(crate) struct Job {
    pub(crate) block: Vec<u8>,
    pub(crate) dictionary: Option<Vec<u8>>,
    /// The final block of a stream terminates the deflate stream instead of
    /// sync-flushing it.
    pub(crate) last: bool,
    pub(crate) result: Sender<Vec<u8>>,
    pub(crate) latch: Arc<ErrorLatch>,
    pub(crate) pool: Arc<BufferPool>,
}

/// Pool of deflate threads shared by every stream of a container writer.
pub struct DeflateWorkers {
    config: CompressionConfig,
    jobs: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl DeflateWorkers {
    pub fn new(config: CompressionConfig) -> Result<Self> {
        config.validate()?;
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(config.concurrency);
        for i in 0..config.concurrency {
            let rx = rx.clone();
            let level = config.level;
            let handle = std::thread::Builder::new()
                .name(format!("diz-deflate-{i}"))
                .spawn(move || run_worker(level, rx))?;
            handles.push(handle);
        }
        Ok(Self {
            config,
            jobs: Some(tx),
            handles,
        })
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    pub(crate) fn submit(&self, job: Job) -> io::Result<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| io::Error::other("deflate workers are shut down"))?;
        jobs.send(job)
            .map_err(|_| io::Error::other("deflate workers are gone"))
    }
}

impl Drop for DeflateWorkers {
    fn drop(&mut self) {
        self.jobs.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("deflate worker panicked");
            }
        }
    }
}

fn run_worker(level: u32, jobs: Receiver<Job>) {
    let mut compress = Compress::new(Compression::new(level), false);
    for job in jobs {
        let mut out = job.pool.get();
        let res = deflate_block(
            &mut compress,
            &job.block,
            job.dictionary.as_deref(),
            job.last,
            &mut out,
        );
        job.pool.put(job.block);
        match res {
            // The drain may already have stopped listening after a failure.
            Ok(()) => {
                let _ = job.result.send(out);
            }
            Err(err) => job.latch.set(&err),
        }
    }
}

/// Compresses `input` as a raw deflate segment primed with `dictionary`.
///
/// Non-final segments end with a sync flush, so they are byte aligned and the
/// segments of one stream can be concatenated into a single valid deflate
/// stream.
pub(crate) fn deflate_block(
    compress: &mut Compress,
    input: &[u8],
    dictionary: Option<&[u8]>,
    last: bool,
    out: &mut Vec<u8>,
) -> io::Result<()> {
    compress.reset();
    if let Some(dictionary) = dictionary {
        compress
            .set_dictionary(dictionary)
            .map_err(io::Error::other)?;
    }
    let flush = if last {
        FlushCompress::Finish
    } else {
        FlushCompress::Sync
    };

    let mut consumed = 0usize;
    loop {
        if out.capacity() - out.len() < 1024 {
            out.reserve(out.capacity().max(4096));
        }
        let before = compress.total_in();
        let status = compress
            .compress_vec(&input[consumed..], out, flush)
            .map_err(io::Error::other)?;
        consumed += (compress.total_in() - before) as usize;

        match status {
            Status::StreamEnd => return Ok(()),
            Status::Ok | Status::BufError => {
                // A sync flush is complete once all input is consumed and the
                // compressor left output space unused.
                if !last && consumed == input.len() && out.len() < out.capacity() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::DeflateDecoder;
    use std::io::Read;

    fn inflate(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        DeflateDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_segments_concatenate_into_one_stream() {
        let first: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let second: Vec<u8> = (0..30_000u32).map(|i| (i % 13) as u8).collect();
        let mut compress = Compress::new(Compression::new(6), false);

        let mut stream = Vec::new();
        deflate_block(&mut compress, &first, None, false, &mut stream).unwrap();
        let tail = &first[first.len() - 16 * 1024..];
        let mut rest = Vec::new();
        deflate_block(&mut compress, &second, Some(tail), true, &mut rest).unwrap();
        stream.extend_from_slice(&rest);

        let mut expected = first.clone();
        expected.extend_from_slice(&second);
        assert_eq!(inflate(&stream), expected);
    }

    #[test]
    fn test_empty_final_block() {
        let mut compress = Compress::new(Compression::new(6), false);
        let mut out = Vec::new();
        deflate_block(&mut compress, &[], None, true, &mut out).unwrap();
        assert!(!out.is_empty());
        assert!(inflate(&out).is_empty());
    }

    #[test]
    fn test_level_zero_stores() {
        let data = vec![7u8; 50_000];
        let mut compress = Compress::new(Compression::new(0), false);
        let mut out = Vec::new();
        deflate_block(&mut compress, &data, None, true, &mut out).unwrap();
        assert!(out.len() >= data.len());
        assert_eq!(inflate(&out), data);
    }
}
