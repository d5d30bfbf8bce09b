//! Gzip'd tar handling for plugin packages.

use std::{
    fs::File,
    io,
    path::{Component, Path, PathBuf},
};

use tracing::warn;

use crate::{
    error::{Error, Result},
    types::PackageJson,
};

pub const PACKAGE_JSON: &str = "package.json";

/// Read every entry of the archive to prove it is complete.
pub async fn verify_archive(archive: &Path) -> Result<()> {
    let owned = archive.to_path_buf();
    tokio::task::spawn_blocking(move || verify_blocking(&owned))
        .await
        .map_err(|e| Error::unpack(archive, e))?
        .map_err(|e| Error::unpack(archive, e))
}

/// Unpack `archive` into `target`, dropping the archive's top-level
/// directory (`package/` for registry tarballs).
pub async fn unpack_archive(archive: &Path, target: &Path) -> Result<()> {
    tokio::fs::create_dir_all(target)
        .await
        .map_err(|e| Error::write(target, e))?;

    let archive_owned = archive.to_path_buf();
    let target_owned = target.to_path_buf();
    tokio::task::spawn_blocking(move || unpack_blocking(&archive_owned, &target_owned))
        .await
        .map_err(|e| Error::unpack(archive, e))?
        .map_err(|e| Error::unpack(archive, e))
}

fn verify_blocking(archive: &Path) -> io::Result<()> {
    let decoder = flate2::read::GzDecoder::new(File::open(archive)?);
    let mut archive = tar::Archive::new(decoder);
    let mut count = 0usize;
    for entry in archive.entries()? {
        let mut entry = entry?;
        io::copy(&mut entry, &mut io::sink())?;
        count += 1;
    }
    if count == 0 {
        return Err(io::Error::other("archive is empty"));
    }
    // Drain past the tar terminator so the gzip trailer is checked.
    io::copy(&mut archive.into_inner(), &mut io::sink())?;
    Ok(())
}

fn unpack_blocking(archive_path: &Path, target: &Path) -> io::Result<()> {
    let canonical_target = std::fs::canonicalize(target)?;
    let decoder = flate2::read::GzDecoder::new(File::open(archive_path)?);
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            warn!(archive = %archive_path.display(), "skipping symlink/hardlink archive entry");
            continue;
        }

        let path = entry.path()?.into_owned();
        let Some(stripped) = sanitize_archive_path(&path)? else {
            continue;
        };

        let dest = target.join(&stripped);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
            let canonical_parent = std::fs::canonicalize(parent)?;
            if !canonical_parent.starts_with(&canonical_target) {
                return Err(io::Error::other("archive entry escaped install directory"));
            }
        }

        if dest.exists() && std::fs::symlink_metadata(&dest)?.file_type().is_symlink() {
            return Err(io::Error::other(
                "archive entry resolves to symlink destination",
            ));
        }

        if kind.is_dir() {
            std::fs::create_dir_all(&dest)?;
            continue;
        }

        entry.unpack(&dest)?;
    }
    Ok(())
}

fn sanitize_archive_path(path: &Path) -> io::Result<Option<PathBuf>> {
    let stripped: PathBuf = path.components().skip(1).collect();
    if stripped.as_os_str().is_empty() {
        return Ok(None);
    }

    for component in stripped.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {},
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(io::Error::other(format!(
                    "archive contains unsafe path component: {}",
                    path.display()
                )));
            },
        }
    }

    Ok(Some(stripped))
}

/// Parse `package.json` at the root of an unpacked package.
pub async fn read_package_json(dir: &Path) -> Result<PackageJson> {
    let path = dir.join(PACKAGE_JSON);
    let label = dir.display().to_string();
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::install(label, "archive has no package.json"));
        },
        Err(e) => return Err(Error::install(label, e.to_string())),
    };
    serde_json::from_str(&raw)
        .map_err(|e| Error::install(label, format!("invalid package.json: {e}")))
}

/// The declared entry point must exist inside `dir`.
pub async fn check_entry_point(dir: &Path, package: &PackageJson) -> Result<()> {
    let main = package.entry_point();
    let relative = Path::new(main);
    if !relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(Error::install(
            &package.name,
            format!("entry point '{main}' is outside the package"),
        ));
    }
    match tokio::fs::metadata(dir.join(relative)).await {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(Error::install(
            &package.name,
            format!("no loadable entry point: '{main}' is missing"),
        )),
    }
}
