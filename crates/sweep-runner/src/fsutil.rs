use crate::error::Result;
use chrono::Utc;
use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::Path;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Writes through a sibling temp file and renames over `path`, so readers see
/// either the old or the new content.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    if let Err(e) = file.write_all(bytes).and_then(|_| file.sync_all()) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    // Preserve the mode of the file being replaced (exec.sh must stay executable).
    if let Ok(meta) = fs::metadata(path) {
        let _ = fs::set_permissions(&tmp, meta.permissions());
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Recursive copy of `src` into a new directory `dst`. Fails if `dst` exists.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir(dst)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry?;
        let path = entry.path();
        let rel = match path.strip_prefix(src) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_symlink() {
            let link_target = fs::read_link(path)?;
            #[cfg(unix)]
            {
                symlink(&link_target, &target)?;
            }
            #[cfg(not(unix))]
            {
                let resolved = path.parent().unwrap_or(src).join(&link_target);
                if resolved.is_file() {
                    fs::copy(&resolved, &target)?;
                }
            }
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(path, &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("exec.sh");
        fs::write(&path, "old").expect("seed");
        atomic_write_bytes(&path, b"new").expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "new");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn copy_tree_copies_nested_files_and_refuses_existing_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let src = dir.path().join("template");
        ensure_dir(&src.join("exec")).expect("mkdir");
        ensure_dir(&src.join("output")).expect("mkdir");
        fs::write(src.join("exec").join("input.dat"), "n = $[N]\n").expect("seed");

        let dst = dir.path().join("N10");
        copy_tree(&src, &dst).expect("copy");
        assert_eq!(
            fs::read_to_string(dst.join("exec").join("input.dat")).expect("read"),
            "n = $[N]\n"
        );
        assert!(dst.join("output").is_dir());
        assert!(copy_tree(&src, &dst).is_err());
    }
}
