use std::io::Write;

use super::{Archive, Manifest, filter_manifests, merge_manifests, write_manifests};
use crate::error::Result;
use crate::hashzip::HashZipWriter;
use crate::source::ImageSource;

/// Builds a container from `previous` (if any) and the images of `source`
/// matching `patterns`.
///
/// Images of `previous` carrying none of the captured tags are copied raw
/// first, so layers shared with the new capture are never recompressed.
/// The captured tags are removed from the previous images, the two manifest
/// lists are merged, and the container is closed.
pub fn update_archive<W: Write + Send + 'static, S: AsRef<str>>(
    previous: Option<&Archive>,
    source: &ImageSource,
    patterns: &[S],
    mut writer: HashZipWriter<W>,
) -> Result<(W, Vec<Manifest>)> {
    let tags = source.glob_tags(patterns)?;
    tracing::info!(tags = tags.len(), "capturing images");

    let kept = match previous {
        Some(archive) => {
            let exclude: Vec<String> = std::iter::once("*".to_string())
                .chain(tags.iter().map(|t| format!("-{t}")))
                .collect();
            let kept = filter_manifests(archive.manifests(), &exclude);
            tracing::info!(images = kept.len(), "carrying over previous images");
            archive.copy_to_zip(&mut writer, &kept)?;
            kept
        }
        None => Vec::new(),
    };

    let captured = if tags.is_empty() {
        Vec::new()
    } else {
        source.copy_to_zip(&mut writer, &tags)?
    };
    let merged = merge_manifests(&kept, &captured);
    write_manifests(&merged, &mut writer)?;
    let sink = writer.close()?;
    tracing::info!(images = merged.len(), "archive written");
    Ok((sink, merged))
}
