//! Docker image reference helpers.
//!
//! A reference is `[registry/]repository[:tag|@digest]`. The first path
//! component is a registry when it looks like a host: it contains a `.` or a
//! `:`, or is `localhost`.

pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DEFAULT_TAG: &str = "latest";
const LIBRARY_PREFIX: &str = "library/";

/// Splits a reference into registry, repository and tag. Missing parts are
/// empty; a digest is returned in the tag position (`sha256:...`).
pub fn split(reference: &str) -> (&str, &str, &str) {
    let (registry, rest) = match reference.split_once('/') {
        Some((first, rest)) if is_registry(first) => (first, rest),
        _ => ("", reference),
    };

    if let Some((repository, digest)) = rest.split_once('@') {
        return (registry, repository, digest);
    }
    let name_start = rest.rfind('/').map_or(0, |i| i + 1);
    match rest[name_start..].rfind(':') {
        Some(i) => {
            let at = name_start + i;
            (registry, &rest[..at], &rest[at + 1..])
        }
        None => (registry, rest, ""),
    }
}

/// Inverse of [`split`].
pub fn join(registry: &str, repository: &str, tag: &str) -> String {
    let mut out = String::with_capacity(registry.len() + repository.len() + tag.len() + 2);
    if !registry.is_empty() {
        out.push_str(registry);
        out.push('/');
    }
    out.push_str(repository);
    if !tag.is_empty() {
        out.push(if tag.contains(':') { '@' } else { ':' });
        out.push_str(tag);
    }
    out
}

/// Fully qualified form: `nginx` becomes `docker.io/library/nginx:latest`.
pub fn normalize(reference: &str) -> String {
    let (registry, repository, tag) = split(reference);
    let registry = if registry.is_empty() {
        DEFAULT_REGISTRY
    } else {
        registry
    };
    let tag = if tag.is_empty() { DEFAULT_TAG } else { tag };
    if registry == DEFAULT_REGISTRY && !repository.contains('/') {
        join(registry, &format!("{LIBRARY_PREFIX}{repository}"), tag)
    } else {
        join(registry, repository, tag)
    }
}

/// Shortest form docker would display: `docker.io/library/nginx:latest`
/// becomes `nginx`.
pub fn familiar(reference: &str) -> String {
    let (registry, repository, tag) = split(reference);
    let tag = if tag == DEFAULT_TAG { "" } else { tag };
    if registry.is_empty() || registry == DEFAULT_REGISTRY {
        let repository = repository
            .strip_prefix(LIBRARY_PREFIX)
            .filter(|rest| !rest.contains('/'))
            .unwrap_or(repository);
        join("", repository, tag)
    } else {
        join(registry, repository, tag)
    }
}

fn is_registry(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:21f32f6c08406306d822a0e6e8b7dc81f53f336570e852e25fbe1e3e3d0d0133";

    struct Case {
        reference: String,
        normalized: String,
        familiar: String,
        registry: &'static str,
        repository: &'static str,
        tag: String,
    }

    fn cases() -> Vec<Case> {
        let case = |reference: &str,
                    normalized: Option<&str>,
                    familiar: Option<&str>,
                    registry,
                    repository,
                    tag: &str| Case {
            reference: reference.to_string(),
            normalized: normalized.unwrap_or(reference).to_string(),
            familiar: familiar.unwrap_or(reference).to_string(),
            registry,
            repository,
            tag: tag.to_string(),
        };
        vec![
            case("nginx", Some("docker.io/library/nginx:latest"), None, "", "nginx", ""),
            case(
                "nginx:latest",
                Some("docker.io/library/nginx:latest"),
                Some("nginx"),
                "",
                "nginx",
                "latest",
            ),
            case("foo/bar:xyz", Some("docker.io/foo/bar:xyz"), None, "", "foo/bar", "xyz"),
            case(
                "gcr.io/etcd-development/etcd:v3.4.9",
                None,
                None,
                "gcr.io",
                "etcd-development/etcd",
                "v3.4.9",
            ),
            case("192.168.1.1:5000/foo/bar:xyz", None, None, "192.168.1.1:5000", "foo/bar", "xyz"),
            case(
                &format!("nginx@{DIGEST}"),
                Some(&format!("docker.io/library/nginx@{DIGEST}")),
                None,
                "",
                "nginx",
                DIGEST,
            ),
        ]
    }

    #[test]
    fn test_split() {
        for c in cases() {
            let expected = (c.registry, c.repository, c.tag.as_str());
            assert_eq!(split(&c.reference), expected, "{}", c.reference);
        }
    }

    #[test]
    fn test_join() {
        for c in cases() {
            assert_eq!(join(c.registry, c.repository, &c.tag), c.reference);
        }
    }

    #[test]
    fn test_normalize() {
        for c in cases() {
            assert_eq!(normalize(&c.reference), c.normalized);
        }
    }

    #[test]
    fn test_familiar() {
        for c in cases() {
            assert_eq!(familiar(&c.normalized), c.familiar);
        }
    }

    #[test]
    fn test_registry_port_without_tag() {
        assert_eq!(split("localhost:5000/app"), ("localhost:5000", "app", ""));
        assert_eq!(normalize("localhost/app"), "localhost/app:latest");
        assert_eq!(familiar("docker.io/library/deep/path:1"), "library/deep/path:1");
    }
}
