//! Conversion between docker-save tar streams and containers.

use std::collections::{BTreeSet, HashMap};
use std::io::{self, Read, Seek, SeekFrom, Write};

use tar::{Builder, EntryType, Header};

use super::manifest::{
    DIZ_PREFIX, MANIFEST_JSON, Manifest, REPOSITORIES, create_manifest_repositories, is_selected,
};
use crate::error::{DizError, Result};
use crate::hashzip::HashZipWriter;

/// Links followed before a chain is considered cyclic.
const MAX_LINK_DEPTH: usize = 16;

/// Reads a docker-save tar into `writer`. `manifest.json` is parsed and
/// returned instead of stored, `repositories` is dropped, and every other
/// entry lands under `.diz/`. Names the writer already holds are skipped.
///
/// `docker save` writes a layer whose content equals an earlier one as a
/// link to it; such links are stored with the content of their target,
/// which is read back by seeking in `reader`.
pub fn copy_from_tar<R: Read + Seek, W: Write + Send + 'static>(
    reader: R,
    writer: &mut HashZipWriter<W>,
) -> Result<Vec<Manifest>> {
    ingest_tar(reader, writer, |_| true)
}

/// Like [`copy_from_tar`], storing only the entries accepted by `select`.
/// The returned manifests are those of the whole tar.
pub(crate) fn ingest_tar<R: Read + Seek, W: Write + Send + 'static>(
    reader: R,
    writer: &mut HashZipWriter<W>,
    select: impl Fn(&str) -> bool,
) -> Result<Vec<Manifest>> {
    let mut manifests = Vec::new();
    let mut links = Links::default();
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry_path(&entry);
        let entry_type = entry.header().entry_type();

        if path == MANIFEST_JSON {
            let mut json = Vec::new();
            entry.read_to_end(&mut json)?;
            manifests = serde_json::from_slice(&json)?;
            continue;
        }
        let linked = links.record(&path, &entry)?;
        if path == REPOSITORIES || !select(&path) {
            continue;
        }
        if linked {
            links.pending.push(path);
            continue;
        }

        let name = match entry_type {
            EntryType::Directory => format!("{DIZ_PREFIX}{}/", path.trim_end_matches('/')),
            EntryType::Regular | EntryType::Continuous => format!("{DIZ_PREFIX}{path}"),
            other => {
                tracing::warn!(path = %path, entry_type = ?other, "skipping unsupported tar entry");
                continue;
            }
        };
        if writer.exists(&name) {
            tracing::debug!(entry = %name, "already present, skipping");
            continue;
        }
        let mut sink = writer.create(&name)?;
        if entry_type != EntryType::Directory {
            io::copy(&mut entry, &mut sink)?;
        }
    }

    let mut reader = archive.into_inner();
    for path in &links.pending {
        let name = format!("{DIZ_PREFIX}{path}");
        if writer.exists(&name) {
            continue;
        }
        let (offset, size) = links.resolve(path)?;
        tracing::debug!(entry = %name, "storing content of linked entry");
        let mut data = section(&mut reader, offset, size)?;
        io::copy(&mut data, &mut writer.create(&name)?)?;
    }
    Ok(manifests)
}

/// Scans a docker-save tar for its `manifest.json`.
pub fn read_tar_manifests<R: Read>(reader: R) -> Result<Vec<Manifest>> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry_path(&entry) == MANIFEST_JSON {
            let mut json = Vec::new();
            entry.read_to_end(&mut json)?;
            return Ok(serde_json::from_slice(&json)?);
        }
    }
    Ok(Vec::new())
}

/// Re-emits the part of a docker-save tar that belongs to `manifests`,
/// followed by a regenerated `manifest.json` and `repositories`. Links are
/// replaced by regular entries holding their target's content, so the
/// output never depends on an entry that was filtered out.
pub fn filter_tar<R: Read + Seek, W: Write>(
    reader: R,
    sink: W,
    manifests: &[Manifest],
) -> Result<W> {
    let ids = super::manifest::select_entries(manifests);
    let mut links = Links::default();
    let mut builder = Builder::new(sink);
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry_path(&entry);
        if path == MANIFEST_JSON {
            continue;
        }
        let linked = links.record(&path, &entry)?;
        if path == REPOSITORIES || !is_selected(&path, &ids) {
            continue;
        }
        if linked {
            links.pending.push(path);
            continue;
        }
        match entry.header().entry_type() {
            EntryType::Directory => {
                let dir = format!("{}/", path.trim_end_matches('/'));
                append_entry(&mut builder, &dir, 0, io::empty())?
            }
            EntryType::Regular | EntryType::Continuous => {
                let size = entry.size();
                append_entry(&mut builder, &path, size, &mut entry)?
            }
            other => {
                tracing::warn!(path = %path, entry_type = ?other, "skipping unsupported tar entry")
            }
        }
    }

    let mut reader = archive.into_inner();
    for path in &links.pending {
        let (offset, size) = links.resolve(path)?;
        append_entry(&mut builder, path, size, section(&mut reader, offset, size)?)?;
    }
    finish_tar(builder, manifests)
}

pub(crate) fn append_entry<W: Write>(
    builder: &mut Builder<W>,
    path: &str,
    size: u64,
    data: impl Read,
) -> io::Result<()> {
    let mut header = Header::new_gnu();
    if path.ends_with('/') {
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
    } else {
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(size);
    }
    header.set_mtime(0);
    builder.append_data(&mut header, path, data)
}

/// Appends the generated manifest files and terminates the tar.
pub(crate) fn finish_tar<W: Write>(mut builder: Builder<W>, manifests: &[Manifest]) -> Result<W> {
    for (name, bytes) in create_manifest_repositories(manifests)? {
        append_entry(&mut builder, name, bytes.len() as u64, bytes.as_slice())?;
    }
    Ok(builder.into_inner()?)
}

fn entry_path<R: Read>(entry: &tar::Entry<'_, R>) -> String {
    let raw = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
    match raw.strip_prefix("./") {
        Some(rest) => rest.to_string(),
        None => raw,
    }
}

/// Ids of entries referenced by `manifests`, as accepted by [`ingest_tar`].
pub(crate) fn selector(manifests: &[Manifest]) -> impl Fn(&str) -> bool + use<> {
    let ids: BTreeSet<String> = super::manifest::select_entries(manifests);
    move |path: &str| is_selected(path.trim_end_matches('/'), &ids)
}

/// Where the regular files of a tar live, and which entries are links.
#[derive(Default)]
struct Links {
    /// Path to data offset and size in the underlying stream.
    files: HashMap<String, (u64, u64)>,
    /// Link path to the path it points at, relative to the tar root.
    targets: HashMap<String, String>,
    /// Selected links, in tar order.
    pending: Vec<String>,
}

impl Links {
    /// Remembers `entry`; returns whether it is a link.
    fn record<R: Read>(&mut self, path: &str, entry: &tar::Entry<'_, R>) -> Result<bool> {
        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Continuous => {
                let location = (entry.raw_file_position(), entry.size());
                self.files.insert(path.to_string(), location);
                Ok(false)
            }
            kind @ (EntryType::Symlink | EntryType::Link) => {
                let target = entry
                    .link_name_bytes()
                    .map(|name| String::from_utf8_lossy(&name).into_owned())
                    .ok_or_else(|| DizError::format(format!("tar link {path} has no target")))?;
                // Symlinks are relative to their directory, hard links to the root.
                let base = match kind {
                    EntryType::Symlink => path.rsplit_once('/').map_or("", |(dir, _)| dir),
                    _ => "",
                };
                let resolved = join_path(base, &target).ok_or_else(|| {
                    DizError::format(format!("tar link {path} points outside the archive"))
                })?;
                self.targets.insert(path.to_string(), resolved);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Data location of the regular file `path` finally points at.
    fn resolve(&self, path: &str) -> Result<(u64, u64)> {
        let mut current = path;
        for _ in 0..MAX_LINK_DEPTH {
            if let Some(location) = self.files.get(current) {
                return Ok(*location);
            }
            match self.targets.get(current) {
                Some(next) => current = next,
                None => break,
            }
        }
        Err(DizError::format(format!(
            "tar link {path} does not lead to a regular file"
        )))
    }
}

/// `target` interpreted from directory `base`, with `.` and `..` folded.
/// `None` when it climbs above the root.
fn join_path(base: &str, target: &str) -> Option<String> {
    let mut parts: Vec<&str> = if target.starts_with('/') {
        Vec::new()
    } else {
        base.split('/').filter(|p| !p.is_empty()).collect()
    };
    for part in target.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            part => parts.push(part),
        }
    }
    Some(parts.join("/"))
}

fn section<R: Read + Seek>(reader: &mut R, offset: u64, size: u64) -> io::Result<io::Take<&mut R>> {
    reader.seek(SeekFrom::Start(offset))?;
    Ok(reader.take(size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Archive, write_manifests};
    use crate::compression::{CompressionConfig, TAIL_SIZE};
    use std::io::Cursor;
    use std::sync::Arc;

    fn writer() -> HashZipWriter<Vec<u8>> {
        let config = CompressionConfig::new(6, TAIL_SIZE * 2, 2).unwrap();
        HashZipWriter::with_config(Vec::new(), config).unwrap()
    }

    fn append_file(builder: &mut Builder<Vec<u8>>, path: &str, data: &[u8]) {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(data.len() as u64);
        builder.append_data(&mut header, path, data).unwrap();
    }

    fn append_link(builder: &mut Builder<Vec<u8>>, kind: EntryType, path: &str, target: &str) {
        let mut header = Header::new_gnu();
        header.set_entry_type(kind);
        header.set_mode(0o777);
        header.set_size(0);
        builder.append_link(&mut header, path, target).unwrap();
    }

    fn image() -> Manifest {
        Manifest {
            config: "c.json".to_string(),
            repo_tags: vec!["app:1".to_string()],
            layers: vec![
                "l1/layer.tar".to_string(),
                "l2/layer.tar".to_string(),
                "l3/layer.tar".to_string(),
                "l4/layer.tar".to_string(),
            ],
        }
    }

    /// docker-save layout where three layers repeat the content of `l1`:
    /// a relative symlink, a symlink to that symlink, and a hard link.
    fn linked_tar() -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        append_file(&mut builder, "c.json", br#"{"os":"linux"}"#);
        append_file(&mut builder, "l1/layer.tar", b"shared layer");
        append_link(&mut builder, EntryType::Symlink, "l2/layer.tar", "../l1/layer.tar");
        append_link(&mut builder, EntryType::Symlink, "l3/layer.tar", "../l2/layer.tar");
        append_link(&mut builder, EntryType::Link, "l4/layer.tar", "l1/layer.tar");
        let json = serde_json::to_vec(&[image()]).unwrap();
        append_file(&mut builder, MANIFEST_JSON, &json);
        builder.into_inner().unwrap()
    }

    fn tar_files(tar: &[u8]) -> HashMap<String, Vec<u8>> {
        let mut archive = tar::Archive::new(tar);
        let mut out = HashMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            assert_eq!(entry.header().entry_type(), EntryType::Regular);
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            out.insert(entry_path(&entry), data);
        }
        out
    }

    #[test]
    fn test_links_store_their_target_content() {
        let mut w = writer();
        let manifests = copy_from_tar(Cursor::new(linked_tar()), &mut w).unwrap();
        assert_eq!(manifests, [image()]);
        write_manifests(&manifests, &mut w).unwrap();
        let archive = Archive::open(Arc::new(w.close().unwrap())).unwrap();

        let hash = archive.reader().hash(".diz/l1/layer.tar").unwrap().to_string();
        for layer in ["l2", "l3", "l4"] {
            let name = format!(".diz/{layer}/layer.tar");
            assert_eq!(archive.reader().hash(&name), Some(hash.as_str()), "{name}");
        }

        let registry = archive.registry_manifest("app:1").unwrap().unwrap();
        assert_eq!(registry.manifest.layers().len(), 4);
        assert_eq!(archive.digest_to_tags().unwrap().len(), 1);

        let restored = tar_files(&archive.copy_to_tar(Vec::new(), &manifests).unwrap());
        for layer in ["l1", "l2", "l3", "l4"] {
            assert_eq!(restored[&format!("{layer}/layer.tar")], b"shared layer");
        }
    }

    #[test]
    fn test_filter_tar_materializes_links() {
        let only_l2 = Manifest {
            layers: vec!["l2/layer.tar".to_string()],
            ..image()
        };
        let out = filter_tar(Cursor::new(linked_tar()), Vec::new(), &[only_l2]).unwrap();
        let files = tar_files(&out);
        assert_eq!(files["l2/layer.tar"], b"shared layer");
        assert!(!files.contains_key("l1/layer.tar"));
        assert!(files.contains_key(MANIFEST_JSON));
    }

    #[test]
    fn test_link_outside_archive_is_rejected() {
        let mut builder = Builder::new(Vec::new());
        append_link(&mut builder, EntryType::Symlink, "l1/layer.tar", "../../etc/passwd");
        let tar = builder.into_inner().unwrap();
        let err = copy_from_tar(Cursor::new(tar), &mut writer()).unwrap_err();
        assert!(matches!(err, DizError::Format(_)));
    }

    #[test]
    fn test_dangling_link_is_rejected() {
        let mut builder = Builder::new(Vec::new());
        append_link(&mut builder, EntryType::Symlink, "l2/layer.tar", "../l1/layer.tar");
        let tar = builder.into_inner().unwrap();
        let err = copy_from_tar(Cursor::new(tar), &mut writer()).unwrap_err();
        assert!(matches!(err, DizError::Format(_)));
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("l2", "../l1/layer.tar").as_deref(), Some("l1/layer.tar"));
        assert_eq!(join_path("a/b", "./c").as_deref(), Some("a/b/c"));
        assert_eq!(join_path("a", "/l1/layer.tar").as_deref(), Some("l1/layer.tar"));
        assert_eq!(join_path("", "../x"), None);
    }
}
