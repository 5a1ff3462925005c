//! In-memory pipe connecting a producer thread to a blocking reader.

use std::io::{self, Read, Write};

use crossbeam_channel::{Receiver, Sender};

/// Chunks buffered between the two ends before the writer blocks.
pub const DEFAULT_PIPE_CHUNKS: usize = 16;

pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            chunk: Vec::new(),
            pos: 0,
            done: false,
        },
    )
}

#[derive(Clone)]
pub struct PipeWriter {
    tx: Sender<io::Result<Vec<u8>>>,
}

impl PipeWriter {
    /// Closes the pipe so that the reader fails with `err` once it has
    /// consumed everything written before.
    pub fn close_with_error(self, err: io::Error) {
        let _ = self.tx.send(Err(err));
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(Ok(buf.to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct PipeReader {
    rx: Receiver<io::Result<Vec<u8>>>,
    chunk: Vec<u8>,
    pos: usize,
    done: bool,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos == self.chunk.len() {
            if self.done {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Ok(Err(err)) => {
                    self.done = true;
                    return Err(err);
                }
                // Writer dropped without error.
                Err(_) => {
                    self.done = true;
                    return Ok(0);
                }
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_transfers_all_bytes() {
        let (mut writer, mut reader) = pipe(2);
        let producer = std::thread::spawn(move || {
            for i in 0..100u8 {
                writer.write_all(&[i; 37]).unwrap();
            }
        });
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        producer.join().unwrap();
        assert_eq!(out.len(), 3700);
        assert_eq!(&out[37..74], &[1u8; 37]);
    }

    #[test]
    fn test_error_reaches_reader_after_data() {
        let (mut writer, mut reader) = pipe(4);
        writer.write_all(b"partial").unwrap();
        writer.close_with_error(io::Error::new(io::ErrorKind::InvalidData, "boom"));

        let mut buf = [0u8; 7];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"partial");
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_write_fails_when_reader_dropped() {
        let (mut writer, reader) = pipe(1);
        drop(reader);
        let err = writer.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
