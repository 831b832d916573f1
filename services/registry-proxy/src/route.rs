//! Registry request paths and authorization scopes.

use std::fmt;

use http::{HeaderName, HeaderValue};

/// Header announcing the distribution API version.
pub const API_VERSION_HEADER: HeaderName = HeaderName::from_static("docker-distribution-api-version");

/// The distribution API version spoken by this proxy.
pub const API_VERSION: &str = "registry/2.0";

/// Manifest media types requested upstream, in order of preference.
pub const MANIFEST_MEDIA_TYPES: [&str; 4] = [
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
];

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.oci.image.index.v1+json";

/// The `Accept` header sent upstream for every manifest request.
pub fn manifest_accept() -> HeaderValue {
    HeaderValue::from_static(MANIFEST_ACCEPT)
}

const API_PREFIX: &str = "/v2/";

/// Whether this path is the bare API version probe.
pub fn is_version_probe(path: &str) -> bool {
    path == "/v2/" || path == "/v2"
}

/// Kind of registry resource addressed by a request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// `/v2/<name>/manifests/<reference>`
    Manifests,

    /// `/v2/<name>/blobs/<digest>`
    Blobs,
}

impl ResourceKind {
    fn marker(self) -> &'static str {
        match self {
            ResourceKind::Manifests => "/manifests/",
            ResourceKind::Blobs => "/blobs/",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Manifests => f.write_str("manifests"),
            ResourceKind::Blobs => f.write_str("blobs"),
        }
    }
}

/// A parsed `/v2/<repository>/(manifests|blobs)/<reference>` path.
///
/// The repository may contain slashes (`library/nginx`). It is the shortest
/// prefix which is followed by a `/manifests/` or `/blobs/` segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryPath {
    repository: String,
    kind: ResourceKind,
    reference: String,
}

impl RegistryPath {
    /// Parse a request path, returning `None` when it does not address a
    /// manifest or blob.
    pub fn parse(path: &str) -> Option<Self> {
        let rest = path.strip_prefix(API_PREFIX)?;

        for (idx, _) in rest.match_indices('/') {
            if idx == 0 {
                continue;
            }

            let tail = &rest[idx..];
            for kind in [ResourceKind::Manifests, ResourceKind::Blobs] {
                if let Some(reference) = tail.strip_prefix(kind.marker()) {
                    if reference.is_empty() {
                        continue;
                    }

                    let repository = &rest[..idx];
                    if !valid_repository(repository) {
                        return None;
                    }

                    return Some(RegistryPath {
                        repository: repository.to_owned(),
                        kind,
                        reference: reference.to_owned(),
                    });
                }
            }
        }

        None
    }

    /// The repository name, e.g. `library/nginx`.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Whether this addresses a manifest or a blob.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Tag or digest following the resource segment.
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// The pull scope for this repository.
    pub fn scope(&self) -> Scope {
        Scope::pull(&self.repository)
    }
}

fn valid_repository(name: &str) -> bool {
    !name.is_empty() && !name.split('/').any(|segment| segment.is_empty() || segment == "..")
}

/// An authorization scope, `repository:<name>:pull`.
///
/// Used both as the scope requested from the token service and as the
/// token cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope(String);

impl Scope {
    /// The pull scope for a repository.
    pub fn pull(repository: &str) -> Self {
        Scope(format!("repository:{repository}:pull"))
    }

    /// The scope as sent to the token service.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
