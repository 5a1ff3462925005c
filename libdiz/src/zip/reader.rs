use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Arc;

use flate2::read::DeflateDecoder;

use super::*;
use crate::error::{DizError, Result};

/// Central directory view of a ZIP container.
pub struct ZipArchive {
    source: Arc<dyn ReadAt>,
    size: u64,
    entries: Vec<ZipEntry>,
    names: HashMap<String, usize>,
}

impl ZipArchive {
    pub fn new(source: Arc<dyn ReadAt>) -> Result<Self> {
        let size = source.size()?;
        let (records, dir_size, dir_offset) = read_end_of_directory(source.as_ref(), size)?;
        if dir_offset.checked_add(dir_size).is_none_or(|end| end > size) {
            return Err(DizError::format("central directory out of bounds"));
        }

        let mut dir = vec![0u8; dir_size as usize];
        source.read_exact_at(&mut dir, dir_offset)?;
        let mut fields = Fields::new(&dir);

        let mut entries = Vec::with_capacity(records.min(1 << 16) as usize);
        let mut names = HashMap::new();
        for _ in 0..records {
            let entry = read_central_header(&mut fields)?;
            names.entry(entry.name.clone()).or_insert(entries.len());
            entries.push(entry);
        }

        Ok(Self {
            source,
            size,
            entries,
            names,
        })
    }

    /// Entries in central directory order.
    pub fn entries(&self) -> &[ZipEntry] {
        &self.entries
    }

    /// First entry called `name`.
    pub fn by_name(&self, name: &str) -> Option<&ZipEntry> {
        self.names.get(name).map(|i| &self.entries[*i])
    }

    /// Reader over the stored (still compressed) bytes of `entry`.
    pub fn open_raw(&self, entry: &ZipEntry) -> Result<SectionReader> {
        let mut local = [0u8; LOCAL_HEADER_LEN];
        self.source.read_exact_at(&mut local, entry.header_offset)?;
        let mut fields = Fields::new(&local);
        if fields.u32()? != LOCAL_HEADER_SIG {
            return Err(DizError::format(format!(
                "bad local header for {}",
                entry.name
            )));
        }
        fields.skip(22)?;
        let name_len = fields.u16()? as u64;
        let extra_len = fields.u16()? as u64;

        let start = entry.header_offset + LOCAL_HEADER_LEN as u64 + name_len + extra_len;
        let end = start
            .checked_add(entry.compressed_size)
            .filter(|end| *end <= self.size)
            .ok_or_else(|| DizError::format(format!("entry {} out of bounds", entry.name)))?;
        Ok(SectionReader {
            source: self.source.clone(),
            pos: start,
            end,
        })
    }

    /// Reader over the uncompressed content of `entry`. The CRC and size are
    /// verified when the reader reaches the end.
    pub fn open(&self, entry: &ZipEntry) -> Result<EntryReader> {
        let raw = self.open_raw(entry)?;
        let inner: Box<dyn Read + Send> = match entry.method {
            METHOD_STORED => Box::new(raw),
            METHOD_DEFLATED => Box::new(DeflateDecoder::new(raw)),
            other => {
                return Err(DizError::format(format!(
                    "entry {} uses unsupported method {other}",
                    entry.name
                )));
            }
        };
        Ok(EntryReader {
            inner,
            crc: crc32fast::Hasher::new(),
            read: 0,
            expected_crc: entry.crc32,
            expected_size: entry.uncompressed_size,
        })
    }
}

fn read_end_of_directory(source: &dyn ReadAt, size: u64) -> Result<(u64, u64, u64)> {
    if size < END_OF_DIR_LEN as u64 {
        return Err(DizError::format("container too small"));
    }
    let tail_len = size.min((END_OF_DIR_LEN + u16::MAX as usize) as u64) as usize;
    let tail_start = size - tail_len as u64;
    let mut tail = vec![0u8; tail_len];
    source.read_exact_at(&mut tail, tail_start)?;

    let sig = END_OF_DIR_SIG.to_le_bytes();
    let pos = (0..=tail_len - END_OF_DIR_LEN)
        .rev()
        .find(|&i| {
            tail[i..i + 4] == sig && {
                let comment = u16::from_le_bytes([tail[i + 20], tail[i + 21]]) as usize;
                i + END_OF_DIR_LEN + comment <= tail_len
            }
        })
        .ok_or_else(|| DizError::format("end of central directory not found"))?;

    let mut fields = Fields::new(&tail[pos..]);
    fields.skip(10)?;
    let mut records = fields.u16()? as u64;
    let mut dir_size = fields.u32()? as u64;
    let mut dir_offset = fields.u32()? as u64;

    let eocd_offset = tail_start + pos as u64;
    if eocd_offset >= ZIP64_LOCATOR_LEN as u64 {
        let mut locator = [0u8; ZIP64_LOCATOR_LEN];
        source.read_exact_at(&mut locator, eocd_offset - ZIP64_LOCATOR_LEN as u64)?;
        let mut fields = Fields::new(&locator);
        if fields.u32()? == ZIP64_LOCATOR_SIG {
            fields.skip(4)?;
            let record_offset = fields.u64()?;
            let mut record = [0u8; ZIP64_END_OF_DIR_LEN];
            source.read_exact_at(&mut record, record_offset)?;
            let mut fields = Fields::new(&record);
            if fields.u32()? != ZIP64_END_OF_DIR_SIG {
                return Err(DizError::format("bad zip64 end of central directory"));
            }
            fields.skip(28)?;
            records = fields.u64()?;
            dir_size = fields.u64()?;
            dir_offset = fields.u64()?;
        }
    }
    Ok((records, dir_size, dir_offset))
}

fn read_central_header(fields: &mut Fields<'_>) -> Result<ZipEntry> {
    if fields.u32()? != CENTRAL_HEADER_SIG {
        return Err(DizError::format("bad central directory header"));
    }
    fields.skip(4)?;
    let flags = fields.u16()?;
    let method = fields.u16()?;
    fields.skip(4)?;
    let crc32 = fields.u32()?;
    let mut compressed_size = fields.u32()? as u64;
    let mut uncompressed_size = fields.u32()? as u64;
    let name_len = fields.u16()? as usize;
    let extra_len = fields.u16()? as usize;
    let comment_len = fields.u16()? as usize;
    fields.skip(8)?;
    let mut header_offset = fields.u32()? as u64;

    let name = String::from_utf8_lossy(fields.bytes(name_len)?).into_owned();
    let mut extra = Fields::new(fields.bytes(extra_len)?);
    fields.skip(comment_len)?;

    while extra.remaining() >= 4 {
        let id = extra.u16()?;
        let len = extra.u16()? as usize;
        let mut block = Fields::new(extra.bytes(len)?);
        if id != ZIP64_EXTRA_ID {
            continue;
        }
        if uncompressed_size == MAX_U32 {
            uncompressed_size = block.u64()?;
        }
        if compressed_size == MAX_U32 {
            compressed_size = block.u64()?;
        }
        if header_offset == MAX_U32 {
            header_offset = block.u64()?;
        }
    }

    Ok(ZipEntry {
        name,
        method,
        flags,
        crc32,
        compressed_size,
        uncompressed_size,
        header_offset,
    })
}

/// Sequential reader over a byte range of a [`ReadAt`] source.
pub struct SectionReader {
    source: Arc<dyn ReadAt>,
    pos: u64,
    end: u64,
}

impl Read for SectionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let left = self.end - self.pos;
        if left == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(left).unwrap_or(usize::MAX));
        let n = self.source.read_at(&mut buf[..want], self.pos)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "container truncated",
            ));
        }
        self.pos += n as u64;
        Ok(n)
    }
}

pub struct EntryReader {
    inner: Box<dyn Read + Send>,
    crc: crc32fast::Hasher,
    read: u64,
    expected_crc: u32,
    expected_size: u64,
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            if self.read != self.expected_size || self.crc.clone().finalize() != self.expected_crc {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "zip entry checksum mismatch",
                ));
            }
            return Ok(0);
        }
        self.crc.update(&buf[..n]);
        self.read += n as u64;
        Ok(n)
    }
}
