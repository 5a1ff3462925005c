//! Where images come from when a container is created or updated.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::archive::tarfile::{self, ingest_tar, read_tar_manifests, selector};
use crate::archive::{Archive, Manifest, filter_image_tags, filter_manifests};
use crate::error::Result;
use crate::hashzip::HashZipWriter;
use crate::utils::pipe::{self, DEFAULT_PIPE_CHUNKS};

pub enum ImageSource {
    /// An existing container.
    Archive(Arc<Archive>),
    /// A docker-save tar file, as produced by the container runtime.
    Tar(PathBuf),
    /// No images at all.
    Null,
}

impl ImageSource {
    /// Tags of the images matching `patterns`, without duplicates.
    pub fn glob_tags<S: AsRef<str>>(&self, patterns: &[S]) -> Result<Vec<String>> {
        match self {
            ImageSource::Archive(archive) => Ok(archive.glob_tags(patterns)),
            ImageSource::Tar(path) => {
                let tags: Vec<String> = self
                    .tar_manifests(path)?
                    .into_iter()
                    .flat_map(|m| m.repo_tags)
                    .collect();
                Ok(filter_image_tags(&tags, patterns))
            }
            ImageSource::Null => Ok(Vec::new()),
        }
    }

    /// Docker-load tar stream of the images tagged with any of `tags`.
    pub fn read_tar<S: AsRef<str>>(&self, tags: &[S]) -> Result<Box<dyn Read + Send>> {
        match self {
            ImageSource::Archive(archive) => {
                let manifests = filter_manifests(archive.manifests(), tags);
                Ok(Box::new(archive.read_tar(manifests)?))
            }
            ImageSource::Tar(path) => {
                let manifests = filter_manifests(&self.tar_manifests(path)?, tags);
                let file = BufReader::new(File::open(path)?);
                let (sink, reader) = pipe::pipe(DEFAULT_PIPE_CHUNKS);
                std::thread::Builder::new()
                    .name("diz-filter-tar".to_string())
                    .spawn(move || {
                        let errors = sink.clone();
                        if let Err(err) = tarfile::filter_tar(file, sink, &manifests) {
                            errors.close_with_error(err.into());
                        }
                    })?;
                Ok(Box::new(reader))
            }
            ImageSource::Null => Ok(Box::new(io::empty())),
        }
    }

    /// Copies the images tagged with any of `tags` into `writer` and returns
    /// their manifests. Manifest files are not written.
    pub fn copy_to_zip<W: Write + Send + 'static, S: AsRef<str>>(
        &self,
        writer: &mut HashZipWriter<W>,
        tags: &[S],
    ) -> Result<Vec<Manifest>> {
        match self {
            ImageSource::Archive(archive) => {
                let manifests = filter_manifests(archive.manifests(), tags);
                archive.copy_to_zip(writer, &manifests)?;
                Ok(manifests)
            }
            ImageSource::Tar(path) => {
                let manifests = filter_manifests(&self.tar_manifests(path)?, tags);
                let file = BufReader::new(File::open(path)?);
                ingest_tar(file, writer, selector(&manifests))?;
                Ok(manifests)
            }
            ImageSource::Null => Ok(Vec::new()),
        }
    }

    fn tar_manifests(&self, path: &Path) -> Result<Vec<Manifest>> {
        read_tar_manifests(BufReader::new(File::open(path)?))
    }
}
