use crate::error::Result;
use crate::fsutil::ensure_dir;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::path::{Path, PathBuf};

/// A gzip tarball on local disk, removed when dropped.
#[derive(Debug)]
pub struct LocalArchive {
    path: PathBuf,
}

impl LocalArchive {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

impl Drop for LocalArchive {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Packs `src` into `<staging>/<name>.tar.gz` with `src`'s basename as the
/// single top-level entry.
pub fn compress_dir(name: &str, src: &Path, staging: &Path) -> Result<LocalArchive> {
    ensure_dir(staging)?;
    let path = staging.join(format!("{}.tar.gz", name));
    let archive = LocalArchive { path };
    let file = fs::File::create(archive.path())?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);
    let root = src
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(name));
    builder.append_dir_all(&root, src)?;
    builder.into_inner()?.finish()?;
    Ok(archive)
}

/// Unpacks a gzip tarball into `dest`.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    ensure_dir(dest)?;
    let file = fs::File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.unpack(dest)?;
    Ok(())
}
