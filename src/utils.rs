//! Path helpers.

use std::path::{Path, PathBuf};

pub trait PathExt: AsRef<Path> {
    /// Make this path absolute relative to `relative_dir` if not already.
    ///
    /// Note: Does not check if the path exists and no normalization takes place.
    fn abspath_relative_to(&self, relative_dir: impl AsRef<Path>) -> PathBuf {
        if self.as_ref().is_absolute() {
            return self.as_ref().to_owned();
        }

        relative_dir.as_ref().join(self)
    }

    /// The last component of this path as a string, or the whole path if it has none.
    ///
    /// `/dev/ttyACM0` becomes `ttyACM0`, `COM3` stays `COM3`.
    fn basename(&self) -> String {
        let path = self.as_ref();

        path.file_name()
            .unwrap_or_else(|| path.as_os_str())
            .to_string_lossy()
            .into_owned()
    }
}

impl PathExt for Path {}
impl PathExt for PathBuf {}
impl PathExt for str {}
impl PathExt for String {}
