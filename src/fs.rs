//! Filesystem utilities.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

/// Write `contents` to `dest_file` unless the file already holds exactly `contents`.
///
/// Missing parent directories are created. Returns whether the file was written.
pub fn write_file_if_different(dest_file: impl AsRef<Path>, contents: &[u8]) -> io::Result<bool> {
    let dest_file = dest_file.as_ref();

    if dest_file.is_file() && is_file_eq(&File::open(dest_file)?, contents)? {
        return Ok(false);
    }

    if let Some(parent) = dest_file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(dest_file, contents)?;

    Ok(true)
}

/// Whether the contents of `file` are equal to `contents`.
pub fn is_file_eq(file: &File, contents: &[u8]) -> io::Result<bool> {
    if file.metadata()?.len() != contents.len() as u64 {
        return Ok(false);
    }

    let mut file_bytes = Vec::with_capacity(contents.len());
    io::BufReader::new(file).read_to_end(&mut file_bytes)?;

    Ok(file_bytes == contents)
}
