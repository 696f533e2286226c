use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Writes `text` beside `path` first, then swaps it into place so a reader
/// never sees a half-written record.
pub(crate) fn write_text_atomic(path: &Path, text: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let staging = staging_path_for(path);
    fs::write(&staging, text.as_bytes())?;
    if let Err(error) = swap_into_place(&staging, path) {
        let _ = fs::remove_file(&staging);
        return Err(error);
    }
    Ok(())
}

pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

fn swap_into_place(staging: &Path, target: &Path) -> io::Result<()> {
    // rename does not replace an existing file on every platform
    remove_if_exists(target)?;
    fs::rename(staging, target)
}

fn staging_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("record");
    let staged = format!("{file_name}.staged");
    match path.parent() {
        Some(parent) => parent.join(staged),
        None => PathBuf::from(staged),
    }
}
