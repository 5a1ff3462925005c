use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::Table;
use comfy_table::presets::UTF8_FULL;
use libdiz::archive::{Archive, filter_manifests, update_archive};
use libdiz::compression::CompressionConfig;
use libdiz::hashzip::HashZipWriter;
use libdiz::reference;
use libdiz::source::ImageSource;
use tempfile::NamedTempFile;

/// `-` is stdout.
fn output_sink(output: &str) -> Result<Box<dyn Write + Send>> {
    if output == "-" {
        return Ok(Box::new(io::stdout()));
    }
    let file = File::create(output).with_context(|| format!("failed to create {output}"))?;
    Ok(Box::new(file))
}

fn open_archive(path: &Path) -> Result<Archive> {
    Archive::open_file(path).with_context(|| format!("failed to open archive {}", path.display()))
}

pub(crate) fn create(
    output: &str,
    tar: &Path,
    tags: &[String],
    config: CompressionConfig,
) -> Result<()> {
    let source = ImageSource::Tar(tar.to_path_buf());
    let writer = HashZipWriter::with_config(BufWriter::new(output_sink(output)?), config)?;
    let (mut sink, manifests) = update_archive(None, &source, tags, writer)?;
    sink.flush()?;
    tracing::info!("created {output} with {} images", manifests.len());
    Ok(())
}

/// Rewrites `archive` next to itself and renames it into place, so readers
/// never observe a partial archive.
pub(crate) fn update(
    archive: &Path,
    tar: &Path,
    tags: &[String],
    config: CompressionConfig,
) -> Result<()> {
    let previous = open_archive(archive)?;
    let dir = match archive.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create a temporary file in {}", dir.display()))?;
    let permissions = fs::metadata(archive)?.permissions();
    fs::set_permissions(tmp.path(), permissions)?;

    let writer = HashZipWriter::with_config(BufWriter::new(tmp.reopen()?), config)?;
    let source = ImageSource::Tar(tar.to_path_buf());
    let (sink, manifests) = update_archive(Some(&previous), &source, tags, writer)?;
    sink.into_inner()
        .map_err(|e| e.into_error())?
        .sync_all()?;
    drop(previous);

    tmp.persist(archive)
        .with_context(|| format!("failed to replace {}", archive.display()))?;
    tracing::info!("updated {} with {} images", archive.display(), manifests.len());
    Ok(())
}

/// Writes a docker-load tar of the matching images.
pub(crate) fn restore(archive: &Path, output: Option<&str>, tags: &[String]) -> Result<()> {
    let archive = open_archive(archive)?;
    let manifests = filter_manifests(archive.manifests(), tags);
    if manifests.is_empty() {
        tracing::warn!("no images match {tags:?}");
    }
    let sink = output_sink(output.unwrap_or("-"))?;
    let mut sink = archive.copy_to_tar(BufWriter::new(sink), &manifests)?;
    sink.flush()?;
    tracing::info!("restored {} images", manifests.len());
    Ok(())
}

pub(crate) fn list(archive: &Path, tags: &[String]) -> Result<()> {
    let archive = open_archive(archive)?;
    println!("{}", list_table(&archive, tags)?);
    Ok(())
}

fn list_table(archive: &Archive, tags: &[String]) -> Result<Table> {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["tag", "pull as", "digest", "layers", "size"]);

    for tag in archive.glob_tags(tags) {
        let Some(manifest) = archive.registry_manifest(&tag)? else {
            continue;
        };
        let layers = manifest.manifest.layers();
        let size: u64 = manifest.manifest.config().size()
            + layers.iter().map(|layer| layer.size()).sum::<u64>();
        table.add_row(vec![
            tag.clone(),
            pull_name(&tag),
            manifest.digest,
            layers.len().to_string(),
            size.to_string(),
        ]);
    }
    Ok(table)
}

/// Shortest reference a client can pull `tag` by.
fn pull_name(tag: &str) -> String {
    reference::familiar(&reference::normalize(tag))
}
