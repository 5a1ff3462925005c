//! Archive model: the images held by a content-addressed container.

pub mod manifest;
pub mod registry;
pub mod tarfile;
mod update;

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

pub use manifest::{
    DIZ_PREFIX, LAYER_TAR_SUFFIX, MANIFEST_JSON, Manifest, NONE_TAG, REPOSITORIES, Repositories,
    TagFilter, build_repositories, create_manifest_repositories, filter_image_tags,
    filter_manifests, is_selected, layer_id, merge_manifests, select_entries,
};
pub use registry::{
    CONFIG_MEDIA_TYPE, LAYER_MEDIA_TYPE, MANIFEST_MEDIA_TYPE, RegistryManifest,
    build_registry_manifest, compute_manifest_digest,
};
pub use tarfile::{copy_from_tar, filter_tar, read_tar_manifests};
pub use update::update_archive;

use crate::compression::DeflateWorkers;
use crate::error::Result;
use crate::hashzip::HashZipReader;
use crate::hashzip::HashZipWriter;
use crate::reference;
use crate::utils::pipe::{self, DEFAULT_PIPE_CHUNKS, PipeReader};
use crate::zip::ReadAt;

/// Readable payload: a blob or browse result.
pub struct Blob {
    /// Uncompressed length, when known up front.
    pub size: Option<u64>,
    pub reader: Box<dyn Read + Send>,
}

pub struct Archive {
    reader: Arc<HashZipReader>,
    manifests: Vec<Manifest>,
}

impl Archive {
    /// Wraps an opened container. A container without `.diz/manifest.json`
    /// holds no images.
    pub fn new(reader: Arc<HashZipReader>) -> Result<Self> {
        let manifests = match reader.entry(&format!("{DIZ_PREFIX}{MANIFEST_JSON}")) {
            Some(entry) => {
                let mut json = Vec::new();
                reader.open(entry)?.read_to_end(&mut json)?;
                serde_json::from_slice(&json)?
            }
            None => Vec::new(),
        };
        Ok(Self { reader, manifests })
    }

    pub fn open(source: Arc<dyn ReadAt>) -> Result<Self> {
        Self::new(Arc::new(HashZipReader::new(source)?))
    }

    pub fn open_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(Arc::new(HashZipReader::open_file(path)?))
    }

    pub fn manifests(&self) -> &[Manifest] {
        &self.manifests
    }

    pub fn reader(&self) -> &Arc<HashZipReader> {
        &self.reader
    }

    /// Tags of the images matching `patterns`.
    pub fn glob_tags<S: AsRef<str>>(&self, patterns: &[S]) -> Vec<String> {
        let tags: Vec<String> = filter_manifests(&self.manifests, patterns)
            .into_iter()
            .flat_map(|m| m.repo_tags)
            .collect();
        filter_image_tags(&tags, &["*"])
    }

    pub fn find_tag(&self, tag: &str) -> Option<&Manifest> {
        self.manifests
            .iter()
            .find(|m| m.repo_tags.iter().any(|t| t == tag))
    }

    /// Copies the entries of `manifests`, plus every entry outside `.diz/`,
    /// into `writer` without recompressing. Names the writer already holds
    /// are skipped; manifest files are left for [`write_manifests`].
    pub fn copy_to_zip<W: Write + Send + 'static>(
        &self,
        writer: &mut HashZipWriter<W>,
        manifests: &[Manifest],
    ) -> Result<()> {
        let ids = select_entries(manifests);
        for entry in self.reader.entries() {
            let include = match entry.name.strip_prefix(DIZ_PREFIX) {
                Some(rest) => {
                    rest != MANIFEST_JSON && rest != REPOSITORIES && is_selected(rest, &ids)
                }
                None => true,
            };
            if include && !writer.exists(&entry.name) {
                writer.copy(&entry.name, &self.reader, entry)?;
            }
        }
        Ok(())
    }

    /// Writes a docker-load tar of `manifests` to `sink`.
    pub fn copy_to_tar<W: Write>(&self, sink: W, manifests: &[Manifest]) -> Result<W> {
        let ids = select_entries(manifests);
        let mut builder = tar::Builder::new(sink);
        for entry in self.reader.entries() {
            let Some(rest) = entry.name.strip_prefix(DIZ_PREFIX) else {
                continue;
            };
            if rest == MANIFEST_JSON || rest == REPOSITORIES || !is_selected(rest, &ids) {
                continue;
            }
            let data = self.reader.open(entry)?;
            tarfile::append_entry(&mut builder, rest, entry.uncompressed_size, data)?;
        }
        tarfile::finish_tar(builder, manifests)
    }

    /// Produces the tar of [`copy_to_tar`](Self::copy_to_tar) on a
    /// background thread.
    pub fn read_tar(self: &Arc<Self>, manifests: Vec<Manifest>) -> Result<PipeReader> {
        let (sink, reader) = pipe::pipe(DEFAULT_PIPE_CHUNKS);
        let archive = self.clone();
        std::thread::Builder::new()
            .name("diz-read-tar".to_string())
            .spawn(move || {
                let errors = sink.clone();
                if let Err(err) = archive.copy_to_tar(sink, &manifests) {
                    tracing::warn!(error = %err, "tar stream aborted");
                    errors.close_with_error(err.into());
                }
            })?;
        Ok(reader)
    }

    /// Registry manifest of the image tagged `tag`.
    pub fn registry_manifest(&self, tag: &str) -> Result<Option<RegistryManifest>> {
        match self.find_tag(tag) {
            Some(m) => Ok(Some(RegistryManifest::new(build_registry_manifest(m, &self.reader)?)?)),
            None => Ok(None),
        }
    }

    /// Manifest digest of every tag, grouped by digest.
    pub fn digest_to_tags(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for tag in self.glob_tags(&["*"]) {
            if let Some(m) = self.registry_manifest(&tag)? {
                out.entry(m.digest).or_default().push(tag);
            }
        }
        Ok(out)
    }

    /// Normalized reference of every tag mapped to its manifest digest.
    pub fn normalized_tags_to_digest(&self) -> Result<HashMap<String, String>> {
        let mut out = HashMap::new();
        for (digest, tags) in self.digest_to_tags()? {
            for tag in tags {
                out.insert(reference::normalize(&tag), digest.clone());
            }
        }
        Ok(out)
    }

    /// Content of the entry whose hash is `hash` (lowercase hex).
    pub fn open_blob(&self, hash: &str) -> Result<Option<Blob>> {
        let Some(entry) = self.reader.entry_by_hash(hash) else {
            return Ok(None);
        };
        Ok(Some(Blob {
            size: Some(entry.uncompressed_size),
            reader: Box::new(self.reader.open(entry)?),
        }))
    }

    /// Raw container browsing: `path` names a single entry, or, with a
    /// trailing `/`, the nested container of everything below it.
    pub fn read(&self, path: &str, workers: Arc<DeflateWorkers>) -> Result<Option<Blob>> {
        if path.is_empty() || path.ends_with('/') {
            let nested = self.reader.read_prefix(path, workers)?;
            return Ok(nested.map(|reader| Blob {
                size: None,
                reader: Box::new(reader),
            }));
        }
        let Some(entry) = self.reader.entry(path) else {
            return Ok(None);
        };
        Ok(Some(Blob {
            size: Some(entry.uncompressed_size),
            reader: Box::new(self.reader.open(entry)?),
        }))
    }
}

/// Writes `.diz/manifest.json` and `.diz/repositories` for `manifests`.
pub fn write_manifests<W: Write + Send + 'static>(
    manifests: &[Manifest],
    writer: &mut HashZipWriter<W>,
) -> Result<()> {
    for (name, bytes) in create_manifest_repositories(manifests)? {
        writer.create(&format!("{DIZ_PREFIX}{name}"))?.write_all(&bytes)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{CompressionConfig, TAIL_SIZE};
    use sha2::{Digest, Sha256};

    const CONFIG: &[u8] = br#"{"architecture":"amd64"}"#;

    fn workers() -> Arc<DeflateWorkers> {
        let config = CompressionConfig::new(6, TAIL_SIZE * 2, 2).unwrap();
        Arc::new(DeflateWorkers::new(config).unwrap())
    }

    fn image() -> Manifest {
        Manifest {
            config: "cfg1.json".to_string(),
            repo_tags: vec!["app:1".to_string(), "app:latest".to_string()],
            layers: vec!["l1/layer.tar".to_string(), "l2/layer.tar".to_string()],
        }
    }

    fn sample_archive() -> Arc<Archive> {
        let files: [(&str, &[u8]); 6] = [
            (".diz/cfg1.json", CONFIG),
            (".diz/l1/", b""),
            (".diz/l1/layer.tar", b"layer one"),
            (".diz/l2/layer.tar", b"layer two"),
            (".diz/orphan/layer.tar", b"unreferenced"),
            ("README", b"foreign"),
        ];
        let mut writer = HashZipWriter::new(Vec::new(), workers());
        for (name, data) in files {
            writer.create(name).unwrap().write_all(data).unwrap();
        }
        write_manifests(&[image()], &mut writer).unwrap();
        Arc::new(Archive::open(Arc::new(writer.close().unwrap())).unwrap())
    }

    fn sha(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn read_blob(blob: Blob) -> Vec<u8> {
        let mut out = Vec::new();
        let mut reader = blob.reader;
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_reads_manifests() {
        let archive = sample_archive();
        assert_eq!(archive.manifests(), &[image()]);
        assert_eq!(archive.glob_tags(&["app:l*"]), ["app:latest"]);
        assert!(archive.find_tag("other:1").is_none());
    }

    #[test]
    fn test_registry_manifest_is_deterministic() {
        let archive = sample_archive();
        let first = archive.registry_manifest("app:1").unwrap().unwrap();
        let again = archive.registry_manifest("app:1").unwrap().unwrap();
        assert_eq!(first.body, again.body);
        assert_eq!(first.digest, again.digest);
        assert_eq!(first.digest, format!("sha256:{}", sha(&first.body)));

        let json: serde_json::Value = serde_json::from_slice(&first.body).unwrap();
        assert_eq!(json["schemaVersion"], 2);
        assert_eq!(json["mediaType"], MANIFEST_MEDIA_TYPE);
        assert_eq!(json["config"]["mediaType"], CONFIG_MEDIA_TYPE);
        assert_eq!(json["config"]["size"], CONFIG.len());
        assert_eq!(json["config"]["digest"], format!("sha256:{}", sha(CONFIG)));
        assert_eq!(json["layers"][1]["digest"], format!("sha256:{}", sha(b"layer two")));
        assert_eq!(json["layers"][1]["mediaType"], LAYER_MEDIA_TYPE);
        assert_eq!(json["layers"].as_array().unwrap().len(), 2);

        assert!(archive.registry_manifest("missing:1").unwrap().is_none());
    }

    #[test]
    fn test_digest_indexes() {
        let archive = sample_archive();
        let digest = archive.registry_manifest("app:1").unwrap().unwrap().digest;
        let by_digest = archive.digest_to_tags().unwrap();
        assert_eq!(by_digest.len(), 1);
        assert_eq!(by_digest[&digest], ["app:1", "app:latest"]);

        let normalized = archive.normalized_tags_to_digest().unwrap();
        assert_eq!(normalized["docker.io/library/app:1"], digest);
        assert_eq!(normalized["docker.io/library/app:latest"], digest);
    }

    #[test]
    fn test_open_blob_by_hash() {
        let archive = sample_archive();
        let blob = archive.open_blob(&sha(b"layer one")).unwrap().unwrap();
        assert_eq!(blob.size, Some(9));
        assert_eq!(read_blob(blob), b"layer one");
        assert!(archive.open_blob(&sha(b"nothing")).unwrap().is_none());
    }

    #[test]
    fn test_read_entry_and_prefix() {
        let archive = sample_archive();
        let blob = archive.read("README", workers()).unwrap().unwrap();
        assert_eq!(read_blob(blob), b"foreign");
        assert!(archive.read("nope", workers()).unwrap().is_none());

        let nested = archive.read(".diz/l1/", workers()).unwrap().unwrap();
        assert!(nested.size.is_none());
        let nested = HashZipReader::new(Arc::new(read_blob(nested))).unwrap();
        let names: Vec<_> = nested.entries().iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, ["layer.tar"]);
    }

    #[test]
    fn test_copy_to_zip_selects_entries() {
        let archive = sample_archive();
        let mut writer = HashZipWriter::new(Vec::new(), workers());
        archive.copy_to_zip(&mut writer, archive.manifests()).unwrap();
        let copied = HashZipReader::new(Arc::new(writer.close().unwrap())).unwrap();

        let names: Vec<_> = copied.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            [".diz/cfg1.json", ".diz/l1/", ".diz/l1/layer.tar", ".diz/l2/layer.tar", "README"]
        );
        assert_eq!(copied.hash(".diz/l2/layer.tar").unwrap(), sha(b"layer two"));
    }

    #[test]
    fn test_copy_to_tar_layout() {
        let archive = sample_archive();
        let bytes = archive.copy_to_tar(Vec::new(), archive.manifests()).unwrap();

        let mut tar = ::tar::Archive::new(bytes.as_slice());
        let mut files = Vec::new();
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            files.push((path, data));
        }

        let names: Vec<_> = files.iter().map(|(n, _)| n.trim_end_matches('/')).collect();
        assert_eq!(
            names,
            ["cfg1.json", "l1", "l1/layer.tar", "l2/layer.tar", MANIFEST_JSON, REPOSITORIES]
        );
        assert_eq!(files[2].1, b"layer one");
        let manifests: Vec<Manifest> = serde_json::from_slice(&files[4].1).unwrap();
        assert_eq!(manifests, [image()]);
        let repositories: Repositories = serde_json::from_slice(&files[5].1).unwrap();
        assert_eq!(repositories["app"]["latest"], "l2");
    }

    #[test]
    fn test_read_tar_streams_same_bytes() {
        let archive = sample_archive();
        let direct = archive.copy_to_tar(Vec::new(), archive.manifests()).unwrap();
        let mut piped = Vec::new();
        archive
            .read_tar(archive.manifests().to_vec())
            .unwrap()
            .read_to_end(&mut piped)
            .unwrap();
        assert_eq!(direct, piped);
    }
}
