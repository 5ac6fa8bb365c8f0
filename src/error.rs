//! Error types.
//!
//! Configuration errors are fatal: they are raised while resolving a board into a
//! build configuration and abort before any external tool is started. Upload errors
//! are only produced when an upload plan is actually executed.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::cmd::CmdError;

/// A fatal error while resolving a board into a build configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No family rule or table entry matches the MCU identifier.
    #[error("there is no MCU family for '{0}'; please add initialization code to your project manually")]
    UnknownMcu(String),
    /// The linker script template for the MCU does not exist.
    #[error("there is no linker script for '{mcu}' (looked for '{}'); please add a custom linker script to your project manually", .path.display())]
    MissingLinkerScript { mcu: String, path: PathBuf },
    /// A flash offset was requested but the linker script has no ROM/flash region.
    #[error("linker script '{}' has no rom/flash memory region to apply offset {offset} to", .path.display())]
    MissingFlashRegion { path: PathBuf, offset: String },
    /// The flash offset address is not a number.
    #[error("invalid flash offset address '{0}'")]
    InvalidOffset(String),
    /// The variant directory for a board or MCU family does not exist.
    #[error("there is no variant directory for '{name}' (looked for '{}')", .path.display())]
    MissingVariantDir { name: String, path: PathBuf },
    /// A package the configuration depends on is not installed.
    #[error("package '{0}' is not installed")]
    MissingPackage(String),
    /// The board manifest lacks a field the selected configuration requires.
    #[error("board '{board}' is missing required field '{field}'")]
    MissingBoardField { board: String, field: &'static str },
    /// The board manifest is not valid JSON or lacks mandatory fields.
    #[error("invalid board manifest '{}'", .path.display())]
    InvalidBoard {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// The requested framework is not supported.
    #[error("unknown framework '{0}'")]
    UnknownFramework(String),
    /// The requested target does not exist.
    #[error("unknown target '{0}'")]
    UnknownTarget(String),
    /// An I/O error while reading or writing a configuration file.
    #[error("failed to access '{}'", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ConfigError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| ConfigError::Io { path, source }
    }
}

/// An error while executing an upload plan.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// No new serial port appeared after the bootloader reset.
    #[error("couldn't find a board on the selected port after {0:?}; check that you have the correct port selected and that the board is in bootloader mode")]
    PortTimeout(Duration),
    /// No upload port was configured and none could be detected.
    #[error("no upload port configured and none detected")]
    NoPort,
    /// The protocol has no uploader.
    #[error("no uploader is configured for upload protocol '{0}'")]
    NoUploader(String),
    /// A serial port operation failed.
    #[error("serial port '{port}': {message}")]
    Serial { port: String, message: String },
    /// Writing a helper file failed.
    #[error("failed to write '{}'", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The uploader command failed.
    #[error(transparent)]
    Cmd(#[from] CmdError),
}
