use std::str::FromStr;

use oci_spec::image::{
    Descriptor, DescriptorBuilder, ImageManifest, ImageManifestBuilder, MediaType, Sha256Digest,
};
use sha2::{Digest, Sha256};

use super::manifest::{DIZ_PREFIX, Manifest};
use crate::error::{DizError, Result};
use crate::hashzip::HashZipReader;

pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar";

/// Registry manifest document together with its serialized form and digest.
#[derive(Debug, Clone)]
pub struct RegistryManifest {
    pub manifest: ImageManifest,
    pub body: Vec<u8>,
    /// `sha256:<hex>` of `body`.
    pub digest: String,
}

impl RegistryManifest {
    pub fn new(manifest: ImageManifest) -> Result<Self> {
        let (body, digest) = compute_manifest_digest(&manifest)?;
        Ok(Self {
            manifest,
            body,
            digest,
        })
    }
}

/// Builds the pull-protocol manifest of `manifest`. Sizes are the
/// uncompressed entry sizes and digests come from the container hash index.
pub fn build_registry_manifest(
    manifest: &Manifest,
    reader: &HashZipReader,
) -> Result<ImageManifest> {
    let config = descriptor(reader, &manifest.config, CONFIG_MEDIA_TYPE)?;
    let layers = manifest
        .layers
        .iter()
        .map(|layer| descriptor(reader, layer, LAYER_MEDIA_TYPE))
        .collect::<Result<Vec<_>>>()?;

    Ok(ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::Other(MANIFEST_MEDIA_TYPE.to_string()))
        .config(config)
        .layers(layers)
        .build()?)
}

/// Pretty-printed JSON of the manifest and the `sha256:<hex>` digest of
/// exactly those bytes.
pub fn compute_manifest_digest(manifest: &ImageManifest) -> Result<(Vec<u8>, String)> {
    let body = serde_json::to_vec_pretty(manifest)?;
    let digest = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
    Ok((body, digest))
}

fn descriptor(reader: &HashZipReader, name: &str, media_type: &str) -> Result<Descriptor> {
    let path = format!("{DIZ_PREFIX}{name}");
    let entry = reader
        .entry(&path)
        .ok_or_else(|| DizError::format(format!("manifest references missing entry {path}")))?;
    let hash = reader
        .hash(&path)
        .ok_or_else(|| DizError::format(format!("no hash recorded for {path}")))?;
    let digest =
        Sha256Digest::from_str(hash).map_err(|_| DizError::InvalidDigest(hash.to_string()))?;

    Ok(DescriptorBuilder::default()
        .media_type(MediaType::Other(media_type.to_string()))
        .size(entry.uncompressed_size)
        .digest(digest)
        .build()?)
}
