use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use super::{HASHES_ENTRY, HashZipWriter};
use crate::compression::DeflateWorkers;
use crate::error::{DizError, Result};
use crate::utils::pipe::{self, DEFAULT_PIPE_CHUNKS, PipeReader};
use crate::zip::{EntryReader, ReadAt, SectionReader, ZipArchive, ZipEntry};

pub struct HashZipReader {
    zip: ZipArchive,
    entries: Vec<ZipEntry>,
    names: HashMap<String, usize>,
    hashes: HashMap<String, String>,
    by_hash: HashMap<String, usize>,
}

impl HashZipReader {
    pub fn new(source: Arc<dyn ReadAt>) -> Result<Self> {
        let zip = ZipArchive::new(source)?;

        let trailer = zip
            .by_name(HASHES_ENTRY)
            .ok_or_else(|| DizError::format(format!("missing {HASHES_ENTRY} trailer")))?;
        let mut json = Vec::new();
        zip.open(trailer)?.read_to_end(&mut json)?;
        let hashes: HashMap<String, String> = serde_json::from_slice(&json)
            .map_err(|e| DizError::format(format!("corrupt {HASHES_ENTRY} trailer: {e}")))?;

        let entries: Vec<ZipEntry> = zip
            .entries()
            .iter()
            .filter(|e| e.name != HASHES_ENTRY)
            .cloned()
            .collect();

        let mut names = HashMap::with_capacity(entries.len());
        let mut by_hash = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            names.entry(entry.name.clone()).or_insert(i);
            match hashes.get(&entry.name) {
                Some(hash) => {
                    by_hash.entry(hash.clone()).or_insert(i);
                }
                None => tracing::warn!(entry = %entry.name, "entry has no recorded hash"),
            }
        }

        Ok(Self {
            zip,
            entries,
            names,
            hashes,
            by_hash,
        })
    }

    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::new(Arc::new(file))
    }

    /// Content entries in container order; the trailer is excluded.
    pub fn entries(&self) -> &[ZipEntry] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&ZipEntry> {
        self.names.get(name).map(|i| &self.entries[*i])
    }

    /// Entry whose content hashes to `hash`. When several entries share a
    /// hash the first one in container order is returned.
    pub fn entry_by_hash(&self, hash: &str) -> Option<&ZipEntry> {
        self.by_hash.get(hash).map(|i| &self.entries[*i])
    }

    pub fn hash(&self, name: &str) -> Option<&str> {
        self.hashes.get(name).map(String::as_str)
    }

    /// Decompressed content of `entry`.
    pub fn open(&self, entry: &ZipEntry) -> Result<EntryReader> {
        self.zip.open(entry)
    }

    /// Compressed bytes of `entry`, as stored.
    pub fn open_raw(&self, entry: &ZipEntry) -> Result<SectionReader> {
        self.zip.open_raw(entry)
    }

    /// Streams a nested container holding every entry below `prefix`, renamed
    /// with the prefix stripped. Entries are copied without recompression by a
    /// background thread while the caller reads; returns `None` when nothing
    /// lives below `prefix`.
    pub fn read_prefix(
        self: &Arc<Self>,
        prefix: &str,
        workers: Arc<DeflateWorkers>,
    ) -> Result<Option<PipeReader>> {
        let selected: Vec<(String, ZipEntry)> = self
            .entries
            .iter()
            .filter_map(|e| {
                let rest = e.name.strip_prefix(prefix)?;
                (!rest.is_empty()).then(|| (rest.to_string(), e.clone()))
            })
            .collect();
        if selected.is_empty() {
            return Ok(None);
        }

        let (sink, reader) = pipe::pipe(DEFAULT_PIPE_CHUNKS);
        let source = self.clone();
        let prefix = prefix.to_string();
        std::thread::Builder::new()
            .name("diz-read-prefix".to_string())
            .spawn(move || {
                let errors = sink.clone();
                let mut writer = HashZipWriter::new(sink, workers);
                let res = selected
                    .iter()
                    .try_for_each(|(name, entry)| writer.copy(name, &source, entry))
                    .and_then(|()| writer.close().map(drop));
                if let Err(err) = res {
                    tracing::warn!(prefix = %prefix, error = %err, "nested container aborted");
                    errors.close_with_error(err.into());
                }
            })?;
        Ok(Some(reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{CompressionConfig, TAIL_SIZE};
    use crate::zip::ZipWriter;
    use sha2::{Digest, Sha256};
    use std::io::Write;

    fn workers() -> Arc<DeflateWorkers> {
        let config = CompressionConfig::new(6, TAIL_SIZE * 2, 2).unwrap();
        Arc::new(DeflateWorkers::new(config).unwrap())
    }

    fn build(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = HashZipWriter::new(Vec::new(), workers());
        for (name, data) in files {
            writer.create(name).unwrap().write_all(data).unwrap();
        }
        writer.close().unwrap()
    }

    fn content(reader: &HashZipReader, entry: &ZipEntry) -> Vec<u8> {
        let mut out = Vec::new();
        reader.open(entry).unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_hash_index_round_trip() {
        let big = vec![7u8; TAIL_SIZE * 5];
        let bytes = build(&[("a", b"alpha"), ("dir/", b""), ("dir/b", &big)]);
        let reader = HashZipReader::new(Arc::new(bytes)).unwrap();

        assert_eq!(reader.entries().len(), 3);
        for entry in reader.entries() {
            let hash = reader.hash(&entry.name).unwrap();
            assert_eq!(hash.len(), 64);
            assert!(hash.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
            let found = reader.entry_by_hash(hash).unwrap();
            assert_eq!(hex::encode(Sha256::digest(content(&reader, found))), hash);
        }
        assert!(reader.entry(HASHES_ENTRY).is_none());
        assert!(reader.entry_by_hash(&"0".repeat(64)).is_none());
    }

    #[test]
    fn test_duplicate_content_resolves_to_first() {
        let bytes = build(&[("first", b"same"), ("second", b"same")]);
        let reader = HashZipReader::new(Arc::new(bytes)).unwrap();
        let hash = reader.hash("second").unwrap().to_string();
        assert_eq!(reader.entry_by_hash(&hash).unwrap().name, "first");
    }

    #[test]
    fn test_missing_trailer_is_format_error() {
        let mut writer = ZipWriter::new(Vec::new(), workers());
        writer.start_file("plain").unwrap();
        writer.write_all(b"no hashes here").unwrap();
        let bytes = writer.finish().unwrap();
        assert!(matches!(
            HashZipReader::new(Arc::new(bytes)),
            Err(DizError::Format(_))
        ));
    }

    #[test]
    fn test_copy_keeps_raw_bytes_and_hash() {
        let source = HashZipReader::new(Arc::new(build(&[("keep", b"kept content")]))).unwrap();
        let entry = source.entry("keep").unwrap().clone();

        let mut writer = HashZipWriter::new(Vec::new(), workers());
        writer.copy("moved", &source, &entry).unwrap();
        assert!(writer.copy("moved", &source, &entry).is_err());
        let copied = HashZipReader::new(Arc::new(writer.close().unwrap())).unwrap();

        let moved = copied.entry("moved").unwrap();
        assert_eq!(copied.hash("moved"), source.hash("keep"));
        let mut a = Vec::new();
        let mut b = Vec::new();
        source.open_raw(&entry).unwrap().read_to_end(&mut a).unwrap();
        copied.open_raw(moved).unwrap().read_to_end(&mut b).unwrap();
        assert_eq!(a, b);
        assert_eq!(content(&copied, moved), b"kept content");
    }

    #[test]
    fn test_read_prefix_reroots_entries() {
        let bytes = build(&[
            (".diz/abc/", b""),
            (".diz/abc/layer.tar", b"layer bytes"),
            (".diz/abc/json", b"{}"),
            ("outside", b"x"),
        ]);
        let reader = Arc::new(HashZipReader::new(Arc::new(bytes)).unwrap());

        let mut nested = Vec::new();
        reader
            .read_prefix(".diz/abc/", workers())
            .unwrap()
            .unwrap()
            .read_to_end(&mut nested)
            .unwrap();
        let nested = HashZipReader::new(Arc::new(nested)).unwrap();
        let names: Vec<_> = nested.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["layer.tar", "json"]);
        assert_eq!(content(&nested, nested.entry("layer.tar").unwrap()), b"layer bytes");
        assert_eq!(nested.hash("json"), reader.hash(".diz/abc/json"));

        assert!(reader.read_prefix("nothing/", workers()).unwrap().is_none());
    }
}
