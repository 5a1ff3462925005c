use std::io::{self, Read, Write};
use std::sync::Arc;

use super::*;
use crate::compression::{BlockCompressor, DeflateWorkers};

/// Tracks the absolute offset of everything written to the sink.
pub(crate) struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct OpenEntry<W: Write + Send + 'static> {
    header: ZipEntry,
    data_start: u64,
    compressor: BlockCompressor<CountingWriter<W>>,
}

/// Streaming ZIP writer. Entry data is deflated on a shared worker pool and
/// sizes are recorded in data descriptors, so the sink never needs to seek.
pub struct ZipWriter<W: Write + Send + 'static> {
    sink: Option<CountingWriter<W>>,
    current: Option<OpenEntry<W>>,
    entries: Vec<ZipEntry>,
    workers: Arc<DeflateWorkers>,
}

fn unusable() -> io::Error {
    io::Error::other("zip writer is unusable after an earlier error")
}

impl<W: Write + Send + 'static> ZipWriter<W> {
    pub fn new(sink: W, workers: Arc<DeflateWorkers>) -> Self {
        Self {
            sink: Some(CountingWriter {
                inner: sink,
                count: 0,
            }),
            current: None,
            entries: Vec::new(),
            workers,
        }
    }

    pub fn workers(&self) -> &Arc<DeflateWorkers> {
        &self.workers
    }

    /// Closes the current entry, if any, and starts a deflated entry `name`.
    /// Subsequent writes go to the new entry.
    pub fn start_file(&mut self, name: &str) -> io::Result<()> {
        self.finish_entry()?;
        let mut sink = self.sink.take().ok_or_else(unusable)?;

        let header = ZipEntry {
            name: name.to_string(),
            method: METHOD_DEFLATED,
            flags: FLAG_DATA_DESCRIPTOR | name_flags(name),
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            header_offset: sink.count,
        };
        write_local_header(&mut sink, &header, false)?;
        let data_start = sink.count;
        let compressor = BlockCompressor::new(sink, self.workers.clone())?;
        self.current = Some(OpenEntry {
            header,
            data_start,
            compressor,
        });
        Ok(())
    }

    /// Closes the current entry and copies already-compressed entry data
    /// from `data` under a new name. `source` supplies method, CRC and sizes.
    pub fn raw_copy(
        &mut self,
        name: &str,
        source: &ZipEntry,
        data: &mut dyn Read,
    ) -> io::Result<()> {
        self.finish_entry()?;
        let mut sink = self.sink.take().ok_or_else(unusable)?;

        let header = ZipEntry {
            name: name.to_string(),
            method: source.method,
            flags: name_flags(name),
            crc32: source.crc32,
            compressed_size: source.compressed_size,
            uncompressed_size: source.uncompressed_size,
            header_offset: sink.count,
        };
        write_local_header(&mut sink, &header, true)?;
        let copied = io::copy(&mut data.take(source.compressed_size), &mut sink)?;
        if copied != source.compressed_size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("raw entry {} is truncated", source.name),
            ));
        }
        self.entries.push(header);
        self.sink = Some(sink);
        Ok(())
    }

    /// Closes the current entry and returns its record.
    pub fn finish_entry(&mut self) -> io::Result<Option<&ZipEntry>> {
        let Some(OpenEntry {
            mut header,
            data_start,
            compressor,
        }) = self.current.take()
        else {
            return Ok(None);
        };

        header.crc32 = compressor.crc32();
        header.uncompressed_size = compressor.uncompressed_size();
        let mut sink = compressor.finish()?;
        header.compressed_size = sink.count - data_start;
        write_data_descriptor(&mut sink, &header)?;

        self.entries.push(header);
        self.sink = Some(sink);
        Ok(self.entries.last())
    }

    /// Writes the central directory and returns the sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.finish_entry()?;
        let mut sink = self.sink.take().ok_or_else(unusable)?;
        write_central_directory(&mut sink, &self.entries)?;
        sink.flush()?;
        Ok(sink.inner)
    }
}

impl<W: Write + Send + 'static> Write for ZipWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.current.as_mut() {
            Some(entry) => entry.compressor.write(buf),
            None => Err(io::Error::other("no zip entry is open")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some(entry) => entry.compressor.flush(),
            None => Ok(()),
        }
    }
}

fn write_local_header<W: Write>(w: &mut W, header: &ZipEntry, known_sizes: bool) -> io::Result<()> {
    let zip64 = known_sizes
        && (header.compressed_size >= MAX_U32 || header.uncompressed_size >= MAX_U32);
    let name = header.name.as_bytes();
    let extra_len: u16 = if zip64 { 20 } else { 0 };

    let mut buf = Vec::with_capacity(LOCAL_HEADER_LEN + name.len() + extra_len as usize);
    put_u32(&mut buf, LOCAL_HEADER_SIG);
    put_u16(&mut buf, if zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT });
    put_u16(&mut buf, header.flags);
    put_u16(&mut buf, header.method);
    put_u16(&mut buf, DOS_TIME);
    put_u16(&mut buf, DOS_DATE);
    if known_sizes {
        put_u32(&mut buf, header.crc32);
        put_u32(&mut buf, clamp_u32(header.compressed_size, zip64));
        put_u32(&mut buf, clamp_u32(header.uncompressed_size, zip64));
    } else {
        put_u32(&mut buf, 0);
        put_u32(&mut buf, 0);
        put_u32(&mut buf, 0);
    }
    put_u16(&mut buf, name_len(name)?);
    put_u16(&mut buf, extra_len);
    buf.extend_from_slice(name);
    if zip64 {
        put_u16(&mut buf, ZIP64_EXTRA_ID);
        put_u16(&mut buf, 16);
        put_u64(&mut buf, header.uncompressed_size);
        put_u64(&mut buf, header.compressed_size);
    }
    w.write_all(&buf)
}

fn write_data_descriptor<W: Write>(w: &mut W, header: &ZipEntry) -> io::Result<()> {
    let mut buf = Vec::with_capacity(24);
    put_u32(&mut buf, DATA_DESCRIPTOR_SIG);
    put_u32(&mut buf, header.crc32);
    if header.compressed_size >= MAX_U32 || header.uncompressed_size >= MAX_U32 {
        put_u64(&mut buf, header.compressed_size);
        put_u64(&mut buf, header.uncompressed_size);
    } else {
        put_u32(&mut buf, header.compressed_size as u32);
        put_u32(&mut buf, header.uncompressed_size as u32);
    }
    w.write_all(&buf)
}

fn write_central_directory<W: Write>(
    w: &mut CountingWriter<W>,
    entries: &[ZipEntry],
) -> io::Result<()> {
    let dir_start = w.count;
    for entry in entries {
        let zip64 = entry.needs_zip64();
        let name = entry.name.as_bytes();
        let version = if zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT };

        let mut buf = Vec::with_capacity(CENTRAL_HEADER_LEN + name.len() + 28);
        put_u32(&mut buf, CENTRAL_HEADER_SIG);
        put_u16(&mut buf, version);
        put_u16(&mut buf, version);
        put_u16(&mut buf, entry.flags);
        put_u16(&mut buf, entry.method);
        put_u16(&mut buf, DOS_TIME);
        put_u16(&mut buf, DOS_DATE);
        put_u32(&mut buf, entry.crc32);
        put_u32(&mut buf, clamp_u32(entry.compressed_size, zip64));
        put_u32(&mut buf, clamp_u32(entry.uncompressed_size, zip64));
        put_u16(&mut buf, name_len(name)?);
        put_u16(&mut buf, if zip64 { 28 } else { 0 });
        put_u16(&mut buf, 0); // comment
        put_u16(&mut buf, 0); // disk
        put_u16(&mut buf, 0); // internal attributes
        put_u32(&mut buf, 0); // external attributes
        put_u32(&mut buf, clamp_u32(entry.header_offset, zip64));
        buf.extend_from_slice(name);
        if zip64 {
            put_u16(&mut buf, ZIP64_EXTRA_ID);
            put_u16(&mut buf, 24);
            put_u64(&mut buf, entry.uncompressed_size);
            put_u64(&mut buf, entry.compressed_size);
            put_u64(&mut buf, entry.header_offset);
        }
        w.write_all(&buf)?;
    }

    let dir_end = w.count;
    let records = entries.len() as u64;
    let dir_size = dir_end - dir_start;
    let zip64 = records >= MAX_U16 || dir_size >= MAX_U32 || dir_start >= MAX_U32;

    let mut buf = Vec::with_capacity(ZIP64_END_OF_DIR_LEN + ZIP64_LOCATOR_LEN + END_OF_DIR_LEN);
    if zip64 {
        put_u32(&mut buf, ZIP64_END_OF_DIR_SIG);
        put_u64(&mut buf, (ZIP64_END_OF_DIR_LEN - 12) as u64);
        put_u16(&mut buf, VERSION_ZIP64);
        put_u16(&mut buf, VERSION_ZIP64);
        put_u32(&mut buf, 0);
        put_u32(&mut buf, 0);
        put_u64(&mut buf, records);
        put_u64(&mut buf, records);
        put_u64(&mut buf, dir_size);
        put_u64(&mut buf, dir_start);

        put_u32(&mut buf, ZIP64_LOCATOR_SIG);
        put_u32(&mut buf, 0);
        put_u64(&mut buf, dir_end);
        put_u32(&mut buf, 1);
    }
    put_u32(&mut buf, END_OF_DIR_SIG);
    put_u16(&mut buf, 0);
    put_u16(&mut buf, 0);
    let records16 = if zip64 { u16::MAX } else { records as u16 };
    put_u16(&mut buf, records16);
    put_u16(&mut buf, records16);
    put_u32(&mut buf, clamp_u32(dir_size, zip64));
    put_u32(&mut buf, clamp_u32(dir_start, zip64));
    put_u16(&mut buf, 0);
    w.write_all(&buf)
}

fn name_len(name: &[u8]) -> io::Result<u16> {
    u16::try_from(name.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "zip entry name too long"))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bytes that sit `base` bytes into an otherwise zero-filled source.
    struct Shifted {
        base: u64,
        bytes: Vec<u8>,
    }

    impl ReadAt for Shifted {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            let size = self.base + self.bytes.len() as u64;
            if offset >= size {
                return Ok(0);
            }
            let n = buf.len().min((size - offset) as usize);
            for (i, byte) in buf[..n].iter_mut().enumerate() {
                let pos = offset + i as u64;
                *byte = match pos.checked_sub(self.base) {
                    Some(rel) => self.bytes[rel as usize],
                    None => 0,
                };
            }
            Ok(n)
        }

        fn size(&self) -> io::Result<u64> {
            Ok(self.base + self.bytes.len() as u64)
        }
    }

    fn entry(name: String, size: u64, offset: u64) -> ZipEntry {
        ZipEntry {
            name,
            method: METHOD_DEFLATED,
            flags: FLAG_DATA_DESCRIPTOR,
            crc32: 0x1234_5678,
            compressed_size: size,
            uncompressed_size: size + 1,
            header_offset: offset,
        }
    }

    fn central_directory(start: u64, entries: &[ZipEntry]) -> Vec<u8> {
        let mut w = CountingWriter {
            inner: Vec::new(),
            count: start,
        };
        write_central_directory(&mut w, entries).unwrap();
        w.inner
    }

    #[test]
    fn test_zip64_sizes_and_record_count() {
        let mut entries = vec![ZipEntry {
            compressed_size: 5 << 30,
            uncompressed_size: 6 << 30,
            header_offset: 7 << 30,
            ..entry("big/layer.tar".to_string(), 0, 0)
        }];
        entries.extend((0..70_000u64).map(|i| entry(format!("f{i}"), i, i * 64)));
        assert!(entries.len() as u64 > MAX_U16);

        let bytes = central_directory(0, &entries);
        let archive = ZipArchive::new(Arc::new(bytes)).unwrap();
        assert_eq!(archive.entries(), entries.as_slice());
        assert_eq!(archive.by_name("big/layer.tar"), Some(&entries[0]));
        assert_eq!(archive.by_name("f69999"), entries.last());
    }

    #[test]
    fn test_central_directory_beyond_4gib() {
        let base = 5 << 30;
        let entries = vec![
            entry("small".to_string(), 10, 0),
            entry("late".to_string(), 10, base - 100),
        ];
        let bytes = central_directory(base, &entries);
        let archive = ZipArchive::new(Arc::new(Shifted { base, bytes })).unwrap();
        assert_eq!(archive.entries(), entries.as_slice());
    }
}
