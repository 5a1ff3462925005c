use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use libdiz::archive::{Archive, RegistryManifest};
use libdiz::compression::DeflateWorkers;
use libdiz::reference;

/// Everything the server needs, computed once at startup.
pub struct AppState {
    pub archive: Arc<Archive>,
    /// Compressors for nested containers produced by `/get/<prefix>/`.
    pub workers: Arc<DeflateWorkers>,
    /// Manifest digest to the tags sharing it, in archive order.
    pub digest_to_tags: BTreeMap<String, Vec<String>>,
    /// Normalized reference to manifest digest.
    pub tags_to_digest: HashMap<String, String>,
}

impl AppState {
    pub fn new(archive: Arc<Archive>, workers: Arc<DeflateWorkers>) -> libdiz::Result<Self> {
        let digest_to_tags = archive.digest_to_tags()?;
        let tags_to_digest = archive.normalized_tags_to_digest()?;
        tracing::info!(
            "serving {} tags in {} distinct manifests",
            tags_to_digest.len(),
            digest_to_tags.len()
        );
        Ok(Self {
            archive,
            workers,
            digest_to_tags,
            tags_to_digest,
        })
    }

    /// Archive tag for a request `name` and tag `reference`, in any of the
    /// spellings that normalize to it (`nginx`, `library/nginx`, ...).
    pub fn resolve_tag(&self, name: &str, tag: &str) -> Option<&str> {
        let normalized = reference::normalize(&format!("{name}:{tag}"));
        let digest = self.tags_to_digest.get(&normalized)?;
        self.tag_for_digest(digest)
    }

    pub fn tag_for_digest(&self, digest: &str) -> Option<&str> {
        self.digest_to_tags
            .get(digest)
            .and_then(|tags| tags.first())
            .map(String::as_str)
    }

    /// Registry manifest for a tag or a manifest digest.
    pub fn manifest(
        &self,
        name: &str,
        reference: &str,
    ) -> libdiz::Result<Option<RegistryManifest>> {
        let tag = if reference.starts_with("sha256:") {
            self.tag_for_digest(reference)
        } else {
            self.resolve_tag(name, reference)
        };
        match tag {
            Some(tag) => self.archive.registry_manifest(tag),
            None => Ok(None),
        }
    }
}
