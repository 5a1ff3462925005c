use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::{HASHES_ENTRY, HashZipReader};
use crate::compression::{CompressionConfig, DeflateWorkers};
use crate::error::{DizError, Result};
use crate::zip::{ZipEntry, ZipWriter};

/// Write-once content-addressed container writer.
pub struct HashZipWriter<W: Write + Send + 'static> {
    zip: ZipWriter<W>,
    hashes: BTreeMap<String, String>,
    current: Option<(String, Sha256)>,
}

impl<W: Write + Send + 'static> HashZipWriter<W> {
    pub fn new(sink: W, workers: Arc<DeflateWorkers>) -> Self {
        Self {
            zip: ZipWriter::new(sink, workers),
            hashes: BTreeMap::new(),
            current: None,
        }
    }

    pub fn with_config(sink: W, config: CompressionConfig) -> Result<Self> {
        Ok(Self::new(sink, Arc::new(DeflateWorkers::new(config)?)))
    }

    pub fn workers(&self) -> &Arc<DeflateWorkers> {
        self.zip.workers()
    }

    /// Whether `name` was already created or copied in this session,
    /// including the entry currently being written.
    pub fn exists(&self, name: &str) -> bool {
        self.hashes.contains_key(name)
            || self.current.as_ref().is_some_and(|(current, _)| current == name)
    }

    /// Hash of a completed entry.
    pub fn hash(&self, name: &str) -> Option<&str> {
        self.hashes.get(name).map(String::as_str)
    }

    /// Starts a new entry. The previous entry's hash is finalized first.
    pub fn create(&mut self, name: &str) -> Result<EntryWriter<'_, W>> {
        if name == HASHES_ENTRY || self.exists(name) {
            return Err(DizError::EntryExists(name.to_string()));
        }
        self.end_entry();
        tracing::debug!(entry = name, "writing entry");
        self.zip.start_file(name)?;
        self.current = Some((name.to_string(), Sha256::new()));
        Ok(EntryWriter { writer: self })
    }

    /// Copies `entry` of `source` under `name` without recompressing it,
    /// carrying over its recorded hash. Entries the source has no hash for
    /// are decompressed and rehashed instead.
    pub fn copy(&mut self, name: &str, source: &HashZipReader, entry: &ZipEntry) -> Result<()> {
        if name == HASHES_ENTRY || self.exists(name) {
            return Err(DizError::EntryExists(name.to_string()));
        }
        self.end_entry();

        let Some(hash) = source.hash(&entry.name) else {
            tracing::warn!(entry = %entry.name, "no recorded hash, recompressing");
            let mut reader = source.open(entry)?;
            let mut writer = self.create(name)?;
            io::copy(&mut reader, &mut writer)?;
            return Ok(());
        };

        tracing::debug!(entry = name, "copying entry");
        let mut raw = source.open_raw(entry)?;
        self.zip.raw_copy(name, entry, &mut raw)?;
        self.hashes.insert(name.to_string(), hash.to_string());
        Ok(())
    }

    /// Finalizes the last entry, writes the hash trailer and the central
    /// directory, and returns the sink.
    pub fn close(mut self) -> Result<W> {
        self.end_entry();
        let trailer = serde_json::to_vec(&self.hashes)?;
        self.zip.start_file(HASHES_ENTRY)?;
        self.zip.write_all(&trailer)?;
        Ok(self.zip.finish()?)
    }

    fn end_entry(&mut self) {
        if let Some((name, hasher)) = self.current.take() {
            self.hashes.insert(name, hex::encode(hasher.finalize()));
        }
    }
}

/// Sink for the entry most recently created on a [`HashZipWriter`]. Bytes
/// are hashed and compressed together.
pub struct EntryWriter<'a, W: Write + Send + 'static> {
    writer: &'a mut HashZipWriter<W>,
}

impl<W: Write + Send + 'static> Write for EntryWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.zip.write(buf)?;
        if let Some((_, hasher)) = self.writer.current.as_mut() {
            hasher.update(&buf[..n]);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.zip.flush()
    }
}
