//! Package resolution: registry lookups and archive downloads.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::StreamExt,
    tokio::io::AsyncWriteExt,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
};

use crate::{
    archive,
    error::{Error, Result},
    types::VersionInfo,
};

/// Extension given to every downloaded archive.
pub const ARCHIVE_EXTENSION: &str = "tgz";

const MAX_NAME_LEN: usize = 214;

// ── Specifiers ───────────────────────────────────────────────────────────────

/// A parsed install source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSpecifier {
    /// `name`, `name@version`, `@scope/name` or `@scope/name@version`.
    Registry {
        name: String,
        version: Option<String>,
    },
    /// Direct `http(s)://` link to an archive.
    Url(String),
    /// Local archive, given as an absolute path or `file://` URL.
    File(PathBuf),
}

impl PackageSpecifier {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::invalid_specifier(raw, "empty specifier"));
        }

        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return Ok(Self::Url(trimmed.to_string()));
        }

        if let Some(rest) = trimmed.strip_prefix("file://") {
            let decoded = urlencoding::decode(rest)
                .map_err(|e| Error::invalid_specifier(raw, e.to_string()))?;
            let path = PathBuf::from(decoded.as_ref());
            if !path.is_absolute() {
                return Err(Error::invalid_specifier(raw, "file URL must be absolute"));
            }
            return Ok(Self::File(path));
        }

        let as_path = Path::new(trimmed);
        if as_path.is_absolute() {
            return Ok(Self::File(as_path.to_path_buf()));
        }

        let (name, version) = split_version(trimmed);
        validate_package_name(name).map_err(|reason| Error::invalid_specifier(raw, reason))?;
        if version.is_some_and(|v| v.is_empty() || v.contains(char::is_whitespace)) {
            return Err(Error::invalid_specifier(raw, "malformed version"));
        }
        Ok(Self::Registry {
            name: name.to_string(),
            version: version.map(str::to_string),
        })
    }

    pub fn is_registry(&self) -> bool {
        matches!(self, Self::Registry { .. })
    }

    /// The same package without a pinned version.
    pub fn latest(&self) -> Self {
        match self {
            Self::Registry { name, .. } => Self::Registry {
                name: name.clone(),
                version: None,
            },
            other => other.clone(),
        }
    }

    /// Filename stem for the downloaded archive.
    pub fn archive_stem(&self) -> String {
        match self {
            Self::Registry { name, .. } => unscoped_name(name).to_string(),
            Self::Url(url) => {
                let path = url.split(['?', '#']).next().unwrap_or_default();
                stem_of(path.rsplit('/').next().unwrap_or_default())
            },
            Self::File(path) => stem_of(
                &path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            ),
        }
    }
}

impl fmt::Display for PackageSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry {
                name,
                version: Some(v),
            } => write!(f, "{name}@{v}"),
            Self::Registry { name, version: None } => f.write_str(name),
            Self::Url(url) => f.write_str(url),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

fn split_version(raw: &str) -> (&str, Option<&str>) {
    // The leading `@` of a scoped name is not a version separator.
    match raw.get(1..).and_then(|rest| rest.rfind('@')) {
        Some(idx) => (&raw[..=idx], Some(&raw[idx + 2..])),
        None => (raw, None),
    }
}

fn stem_of(file_name: &str) -> String {
    let base = file_name
        .strip_suffix(".tar.gz")
        .or_else(|| file_name.strip_suffix(".tgz"))
        .unwrap_or(file_name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "package".into()
    } else {
        cleaned
    }
}

/// `@scope/name` → `name`.
pub fn unscoped_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Registry naming rules. Names double as directory names under the
/// plugins root, so anything that could escape it is refused.
pub fn validate_package_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("package name is empty".into());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!("package name exceeds {MAX_NAME_LEN} characters"));
    }
    if name
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '\\' | ':' | '?' | '#' | '%'))
    {
        return Err(format!("package name '{name}' contains invalid characters"));
    }

    let parts: Vec<&str> = match name.strip_prefix('@') {
        Some(scoped) => {
            let parts: Vec<&str> = scoped.split('/').collect();
            if parts.len() != 2 {
                return Err(format!("scoped name '{name}' must look like @scope/name"));
            }
            parts
        },
        None => {
            if name.contains('/') {
                return Err(format!("package name '{name}' must not contain '/'"));
            }
            vec![name]
        },
    };

    for part in parts {
        if part.is_empty() || part.starts_with('.') || part.starts_with('_') {
            return Err(format!("package name '{name}' has an invalid segment"));
        }
    }
    Ok(())
}

// ── Resolver ─────────────────────────────────────────────────────────────────

/// Turns specifiers into archives on disk.
#[async_trait]
pub trait PackageResolver: Send + Sync {
    /// Manifest-only lookup. `None` for sources without registry metadata.
    async fn lookup(&self, spec: &PackageSpecifier) -> Result<Option<VersionInfo>>;

    /// Download `url` to `dest`. On error nothing is left at `dest`.
    async fn download(&self, url: &str, dest: &Path, cancel: &CancellationToken) -> Result<()>;

    /// Fetch the archive for `spec` into `dest_dir` and return its path.
    async fn resolve(
        &self,
        spec: &PackageSpecifier,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let dest = dest_dir.join(format!("{}.{ARCHIVE_EXTENSION}", spec.archive_stem()));
        match spec {
            PackageSpecifier::Registry { .. } => {
                let info = self
                    .lookup(spec)
                    .await?
                    .ok_or_else(|| Error::package_not_found(spec.to_string()))?;
                self.download(&info.tarball, &dest, cancel).await?;
            },
            PackageSpecifier::Url(url) => self.download(url, &dest, cancel).await?,
            PackageSpecifier::File(path) => copy_local_archive(path, &dest).await?,
        }
        Ok(dest)
    }
}

/// npm-compatible registry client.
pub struct RegistryResolver {
    client: reqwest::Client,
    registry_url: String,
}

impl RegistryResolver {
    pub fn new(registry_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("harbor-plugins/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::network(registry_url, e))?;
        Ok(Self::with_client(client, registry_url))
    }

    pub fn with_client(client: reqwest::Client, registry_url: &str) -> Self {
        Self {
            client,
            registry_url: registry_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn registry_url(&self) -> &str {
        &self.registry_url
    }

    fn document_url(&self, name: &str) -> String {
        format!("{}{}", self.registry_url, document_path(name))
    }

    async fn fetch_document(&self, name: &str) -> Result<serde_json::Value> {
        let url = self.document_url(name);
        let resp = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| Error::network(&url, e))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::package_not_found(name));
        }
        if !resp.status().is_success() {
            return Err(Error::network(&url, format!("HTTP {}", resp.status())));
        }
        resp.json().await.map_err(|e| Error::network(&url, e))
    }

    async fn stream_to(&self, url: &str, part: &Path, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled { url: url.into() });
        }
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled { url: url.into() }),
            resp = self.client.get(url).send() => resp.map_err(|e| Error::network(url, e))?,
        };

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::package_not_found(url));
        }
        if !resp.status().is_success() {
            return Err(Error::network(url, format!("HTTP {}", resp.status())));
        }

        let expected = resp.content_length();
        let mut file = tokio::fs::File::create(part)
            .await
            .map_err(|e| Error::write(part, e))?;
        let mut stream = resp.bytes_stream();
        let mut written: u64 = 0;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled { url: url.into() }),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| Error::network(url, e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::write(part, e))?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(|e| Error::write(part, e))?;
        file.sync_all().await.map_err(|e| Error::write(part, e))?;

        if let Some(expected) = expected
            && written != expected
        {
            return Err(Error::network(
                url,
                format!("truncated download: received {written} of {expected} bytes"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PackageResolver for RegistryResolver {
    async fn lookup(&self, spec: &PackageSpecifier) -> Result<Option<VersionInfo>> {
        let PackageSpecifier::Registry { name, version } = spec else {
            return Ok(None);
        };

        let doc = self.fetch_document(name).await?;
        let wanted = version.as_deref().unwrap_or("latest");
        // A requested version may itself be a dist-tag such as `beta`.
        let resolved = doc
            .get("dist-tags")
            .and_then(|tags| tags.get(wanted))
            .and_then(|v| v.as_str())
            .unwrap_or(wanted);

        let Some(entry) = doc.get("versions").and_then(|v| v.get(resolved)) else {
            return Err(Error::package_not_found(format!("{name}@{wanted}")));
        };
        let tarball = entry
            .get("dist")
            .and_then(|d| d.get("tarball"))
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                Error::network(
                    self.document_url(name),
                    format!("version {resolved} has no tarball"),
                )
            })?;

        debug!(%name, version = %resolved, "resolved registry version");
        Ok(Some(VersionInfo {
            name: name.clone(),
            version: resolved.to_string(),
            tarball: tarball.to_string(),
            description: entry
                .get("description")
                .or_else(|| doc.get("description"))
                .and_then(|d| d.as_str())
                .map(str::to_string),
        }))
    }

    async fn download(&self, url: &str, dest: &Path, cancel: &CancellationToken) -> Result<()> {
        let part = partial_path(dest);
        let streamed = self.stream_to(url, &part, cancel).await;
        finish_archive(streamed, &part, dest).await?;
        info!(%url, dest = %dest.display(), "downloaded plugin archive");
        Ok(())
    }
}

/// Registry path of a package document; scoped names keep their `@` and
/// escape the slash, as npm expects.
pub(crate) fn document_path(name: &str) -> String {
    match name.strip_prefix('@') {
        Some(scoped) => format!("/@{}", urlencoding::encode(scoped)),
        None => format!("/{}", urlencoding::encode(name)),
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

/// Verify the staged `.part` file and move it to `dest`, removing it on any
/// failure.
async fn finish_archive(staged: Result<()>, part: &Path, dest: &Path) -> Result<()> {
    let result = match staged {
        Ok(()) => archive::verify_archive(part).await,
        Err(e) => Err(e),
    };
    let result = match result {
        Ok(()) => tokio::fs::rename(part, dest)
            .await
            .map_err(|e| Error::write(dest, e)),
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(part).await;
    }
    result
}

async fn copy_local_archive(src: &Path, dest: &Path) -> Result<()> {
    if !tokio::fs::try_exists(src).await.unwrap_or(false) {
        return Err(Error::package_not_found(src.display().to_string()));
    }
    let part = partial_path(dest);
    let copied = tokio::fs::copy(src, &part)
        .await
        .map(|_| ())
        .map_err(|e| Error::write(&part, e));
    finish_archive(copied, &part, dest).await
}
