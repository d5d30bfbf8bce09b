//! `plugin://` resource resolution.
//!
//! Relative paths arrive from the presentation process and are untrusted:
//! anything that does not land on a regular file inside the plugins root is
//! rejected, whatever the manifest says.

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

pub const SCHEME: &str = "plugin";

#[derive(Debug, Clone)]
pub struct ResourceResolver {
    root: PathBuf,
}

impl ResourceResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a full `plugin://<relative-path>` URL.
    pub async fn resolve_url(&self, url: &str) -> Result<PathBuf> {
        let rest = url
            .strip_prefix(SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| Error::resource_rejected(url))?;
        self.resolve_relative(rest).await
    }

    /// Resolve a path relative to the plugins root. Query strings and
    /// fragments are ignored and percent-escapes decoded.
    pub async fn resolve_relative(&self, raw: &str) -> Result<PathBuf> {
        let path_part = raw.split(['?', '#']).next().unwrap_or_default();
        let decoded =
            urlencoding::decode(path_part).map_err(|_| Error::resource_rejected(raw))?;
        let relative = Path::new(decoded.trim_start_matches('/'));

        let lexically_safe = relative.components().all(|c| match c {
            Component::Normal(part) => !part.to_string_lossy().starts_with('.'),
            _ => false,
        });
        // Files directly under the root (the manifest) belong to no plugin.
        let inside_plugin = relative.components().count() >= 2;
        if !inside_plugin || !lexically_safe {
            debug!(path = %raw, "rejected plugin resource path");
            return Err(Error::resource_rejected(raw));
        }

        let root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(|_| Error::resource_rejected(raw))?;
        let resolved = tokio::fs::canonicalize(root.join(relative))
            .await
            .map_err(|_| Error::resource_rejected(raw))?;
        // Symlinks inside a plugin could still point elsewhere.
        if !resolved.starts_with(&root) {
            debug!(path = %raw, resolved = %resolved.display(), "plugin resource escapes root");
            return Err(Error::resource_rejected(raw));
        }

        match tokio::fs::metadata(&resolved).await {
            Ok(meta) if meta.is_file() => Ok(resolved),
            _ => Err(Error::resource_rejected(raw)),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, ResourceResolver) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("plugins");
        std::fs::create_dir_all(root.join("widget/assets")).unwrap();
        std::fs::write(root.join("widget/assets/icon.svg"), "<svg/>").unwrap();
        std::fs::write(tmp.path().join("secret.txt"), "nope").unwrap();
        (tmp, ResourceResolver::new(root))
    }

    #[tokio::test]
    async fn resolves_files_inside_root() {
        let (_tmp, resolver) = fixture();
        let path = resolver
            .resolve_url("plugin://widget/assets/icon.svg?v=3")
            .await
            .unwrap();
        assert!(path.ends_with("widget/assets/icon.svg"));

        let encoded = resolver
            .resolve_relative("widget/assets/icon%2Esvg")
            .await
            .unwrap();
        assert_eq!(encoded, path);
    }

    #[tokio::test]
    async fn rejects_traversal() {
        let (_tmp, resolver) = fixture();
        for bad in [
            "plugin://../secret.txt",
            "plugin://../../etc/passwd",
            "plugin://widget/../../secret.txt",
            "plugin://widget%2F..%2F..%2Fsecret.txt",
            "plugin:///etc/passwd",
        ] {
            let err = resolver.resolve_url(bad).await.unwrap_err();
            assert!(matches!(err, Error::ResourceRejected { .. }), "{bad}");
        }
    }

    #[tokio::test]
    async fn rejects_directories_hidden_entries_and_other_schemes() {
        let (tmp, resolver) = fixture();
        std::fs::create_dir_all(resolver.root().join(".staging/x")).unwrap();
        std::fs::write(resolver.root().join(".staging/x/a.js"), "").unwrap();

        assert!(resolver.resolve_url("plugin://widget/assets").await.is_err());
        assert!(resolver.resolve_url("plugin://.staging/x/a.js").await.is_err());
        assert!(resolver.resolve_url("plugin://").await.is_err());
        std::fs::write(resolver.root().join("plugins.json"), "{}").unwrap();
        assert!(resolver.resolve_url("plugin://plugins.json").await.is_err());
        assert!(resolver.resolve_url("file:///etc/passwd").await.is_err());
        assert!(
            resolver
                .resolve_url("plugin://widget/missing.js")
                .await
                .is_err()
        );
        drop(tmp);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rejects_symlinks_out_of_root() {
        let (tmp, resolver) = fixture();
        std::os::unix::fs::symlink(
            tmp.path().join("secret.txt"),
            resolver.root().join("widget/leak.txt"),
        )
        .unwrap();
        assert!(resolver.resolve_url("plugin://widget/leak.txt").await.is_err());
    }
}
