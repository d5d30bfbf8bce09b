//! Fixtures shared by the unit tests: in-memory tarballs and a mock registry.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{path::Path, sync::Arc};

use {
    flate2::{Compression, write::GzEncoder},
    serde_json::json,
};

use crate::{
    plugin::PluginEnv,
    resolver::{RegistryResolver, document_path, unscoped_name},
};

/// Gzip'd tar with the given `(path, contents)` entries.
pub(crate) fn tgz(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Like [`tgz`] but writes entry names verbatim, so unsafe paths survive.
pub(crate) fn tgz_raw(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        let name = path.as_bytes();
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, contents.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// A minimal registry-style package: `package.json` plus `index.js`.
pub(crate) fn package_tgz(name: &str, version: &str) -> Vec<u8> {
    let manifest = json!({
        "name": name,
        "version": version,
        "main": "index.js",
        "description": format!("{name} plugin"),
        "productName": name.to_uppercase(),
    })
    .to_string();
    tgz(&[
        ("package/package.json", manifest.as_str()),
        ("package/index.js", "module.exports = {};\n"),
    ])
}

pub(crate) struct Registry {
    server: mockito::ServerGuard,
    mocks: Vec<mockito::Mock>,
}

impl Registry {
    pub(crate) async fn start() -> Self {
        Self {
            server: mockito::Server::new_async().await,
            mocks: Vec::new(),
        }
    }

    pub(crate) fn url(&self) -> String {
        self.server.url()
    }

    pub(crate) fn resolver(&self) -> Arc<RegistryResolver> {
        Arc::new(RegistryResolver::with_client(
            reqwest::Client::new(),
            &self.server.url(),
        ))
    }

    /// Serve a package document plus one tarball per version.
    pub(crate) async fn publish(&mut self, name: &str, versions: &[&str], latest: &str) {
        let base = self.server.url();
        let mut entries = serde_json::Map::new();
        for version in versions {
            let path = format!("/tarballs/{}-{version}.tgz", unscoped_name(name));
            entries.insert(
                (*version).to_string(),
                json!({
                    "name": name,
                    "version": version,
                    "dist": { "tarball": format!("{base}{path}") },
                }),
            );
            self.serve_raw(&path, package_tgz(name, version)).await;
        }
        let doc = json!({
            "name": name,
            "dist-tags": { "latest": latest },
            "versions": entries,
        });
        let mock = self
            .server
            .mock("GET", document_path(name).as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(doc.to_string())
            .create_async()
            .await;
        self.mocks.push(mock);
    }

    pub(crate) async fn missing(&mut self, name: &str) {
        let mock = self
            .server
            .mock("GET", document_path(name).as_str())
            .with_status(404)
            .with_body(r#"{"error":"Not found"}"#)
            .create_async()
            .await;
        self.mocks.push(mock);
    }

    pub(crate) async fn serve_raw(&mut self, path: &str, body: Vec<u8>) {
        let mock = self
            .server
            .mock("GET", path)
            .with_status(200)
            .with_header("content-type", "application/octet-stream")
            .with_body(body)
            .create_async()
            .await;
        self.mocks.push(mock);
    }

    pub(crate) fn env(&self, root: &Path) -> PluginEnv {
        PluginEnv::new(root, self.resolver())
    }
}
