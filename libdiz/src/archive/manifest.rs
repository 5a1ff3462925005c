use std::collections::{BTreeMap, BTreeSet, HashSet};

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::reference;

/// Prefix under which image content lives inside a container.
pub const DIZ_PREFIX: &str = ".diz/";
pub const MANIFEST_JSON: &str = "manifest.json";
pub const REPOSITORIES: &str = "repositories";
pub const LAYER_TAR_SUFFIX: &str = "/layer.tar";
/// Placeholder docker lists for untagged images.
pub const NONE_TAG: &str = "<none>:<none>";

/// One image as recorded in a docker-save `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "RepoTags", default, deserialize_with = "null_as_empty")]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Layers", default, deserialize_with = "null_as_empty")]
    pub layers: Vec<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// `legacy repositories` file: repository -> tag -> top layer id.
pub type Repositories = BTreeMap<String, BTreeMap<String, String>>;

enum TagPattern {
    Glob(Pattern),
    Literal(String),
}

impl TagPattern {
    fn new(pattern: &str) -> Self {
        match Pattern::new(pattern) {
            Ok(p) => TagPattern::Glob(p),
            Err(_) => TagPattern::Literal(pattern.to_string()),
        }
    }

    fn matches(&self, tag: &str) -> bool {
        match self {
            TagPattern::Glob(p) => p.matches(tag),
            TagPattern::Literal(s) => s == tag,
        }
    }
}

/// Compiled list of tag globs. A `-` prefix makes a pattern exclude.
pub struct TagFilter {
    patterns: Vec<(bool, TagPattern)>,
}

impl TagFilter {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let patterns = patterns
            .iter()
            .map(|p| match p.as_ref().strip_prefix('-') {
                Some(negated) => (false, TagPattern::new(negated)),
                None => (true, TagPattern::new(p.as_ref())),
            })
            .collect();
        Self { patterns }
    }

    /// Evaluates the patterns left to right, each match setting the decision.
    /// A leading negative pattern starts the tag out as included.
    pub fn matches(&self, tag: &str) -> bool {
        if tag == NONE_TAG {
            return false;
        }
        let mut included = matches!(self.patterns.first(), Some((false, _)));
        for (positive, pattern) in &self.patterns {
            if pattern.matches(tag) {
                included = *positive;
            }
        }
        included
    }
}

/// Keeps the tags of each manifest that pass `patterns`; manifests left
/// without tags are dropped.
pub fn filter_manifests<S: AsRef<str>>(manifests: &[Manifest], patterns: &[S]) -> Vec<Manifest> {
    let filter = TagFilter::new(patterns);
    manifests
        .iter()
        .filter_map(|m| {
            let repo_tags: Vec<String> = m
                .repo_tags
                .iter()
                .filter(|t| filter.matches(t))
                .cloned()
                .collect();
            (!repo_tags.is_empty()).then(|| Manifest {
                config: m.config.clone(),
                repo_tags,
                layers: m.layers.clone(),
            })
        })
        .collect()
}

/// Filters a flat tag list, dropping duplicates.
pub fn filter_image_tags<S: AsRef<str>>(tags: &[String], patterns: &[S]) -> Vec<String> {
    let filter = TagFilter::new(patterns);
    let mut seen = HashSet::new();
    tags.iter()
        .filter(|t| filter.matches(t) && seen.insert(t.as_str()))
        .cloned()
        .collect()
}

/// Concatenates `a` and `b`, folding manifests that share a config into one
/// with the union of their tags.
pub fn merge_manifests(a: &[Manifest], b: &[Manifest]) -> Vec<Manifest> {
    let mut merged: Vec<Manifest> = Vec::with_capacity(a.len() + b.len());
    for m in a.iter().chain(b) {
        match merged.iter_mut().find(|e| e.config == m.config) {
            Some(existing) => {
                for tag in &m.repo_tags {
                    if !existing.repo_tags.contains(tag) {
                        existing.repo_tags.push(tag.clone());
                    }
                }
            }
            None => {
                let mut m = m.clone();
                let mut seen = HashSet::new();
                m.repo_tags.retain(|t| seen.insert(t.clone()));
                merged.push(m);
            }
        }
    }
    merged
}

/// Logical entry ids referenced by `manifests`: each config and each layer
/// with the `/layer.tar` suffix removed.
pub fn select_entries(manifests: &[Manifest]) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    for m in manifests {
        ids.insert(m.config.clone());
        for layer in &m.layers {
            ids.insert(layer_id(layer).to_string());
        }
    }
    ids
}

/// Whether a container path (prefix already stripped) belongs to one of
/// `ids`, either as the id itself or as a file below it.
pub fn is_selected(path: &str, ids: &BTreeSet<String>) -> bool {
    ids.contains(path)
        || path
            .match_indices('/')
            .any(|(i, _)| ids.contains(&path[..i]))
}

pub fn layer_id(layer: &str) -> &str {
    layer.strip_suffix(LAYER_TAR_SUFFIX).unwrap_or(layer)
}

pub fn build_repositories(manifests: &[Manifest]) -> Repositories {
    let mut repositories = Repositories::new();
    for m in manifests {
        let Some(top) = m.layers.last() else {
            continue;
        };
        for repo_tag in &m.repo_tags {
            let (registry, repository, tag) = reference::split(repo_tag);
            let tag = if tag.is_empty() {
                reference::DEFAULT_TAG
            } else {
                tag
            };
            repositories
                .entry(reference::join(registry, repository, ""))
                .or_default()
                .insert(tag.to_string(), layer_id(top).to_string());
        }
    }
    repositories
}

/// Serialized `manifest.json` and `repositories`, in that order, as written
/// next to the image content.
pub fn create_manifest_repositories(
    manifests: &[Manifest],
) -> Result<Vec<(&'static str, Vec<u8>)>> {
    Ok(vec![
        (MANIFEST_JSON, serde_json::to_vec(manifests)?),
        (REPOSITORIES, serde_json::to_vec(&build_repositories(manifests))?),
    ])
}
