use std::sync::LazyLock;

use regex::Regex;

static NAME_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*(\/[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*)*$").ok()
});
static TAG_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").ok());
static DIGEST_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^sha256:[0-9a-f]{64}$").ok());

fn matches(re: &LazyLock<Option<Regex>>, value: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(value))
}

pub fn is_valid_name(name: &str) -> bool {
    matches(&NAME_RE, name)
}

/// Only sha256 digests are ever produced by an archive.
pub fn is_valid_digest(digest: &str) -> bool {
    matches(&DIGEST_RE, digest)
}

pub fn is_valid_tag(tag: &str) -> bool {
    matches(&TAG_RE, tag)
}

pub fn is_valid_reference(reference: &str) -> bool {
    is_valid_digest(reference) || is_valid_tag(reference)
}
