//! Tool and framework packages.
//!
//! Packages are installed by something else; this module only decides which ones a
//! board needs and turns package names into directories through a
//! [`PackageLocator`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Serialize;
use strum::Display;

use crate::board::BoardDescriptor;
use crate::error::ConfigError;
use crate::frameworks::Framework;

pub const TOOLCHAIN: &str = "toolchain-gccarmnoneeabi";
pub const FRAMEWORK_CMSIS: &str = "framework-cmsis";
pub const FRAMEWORK_CMSIS_ATMEL: &str = "framework-cmsis-atmel";

pub const TOOL_OPENOCD: &str = "tool-openocd";
pub const TOOL_BOSSAC: &str = "tool-bossac";
pub const TOOL_AVRDUDE: &str = "tool-avrdude";
pub const TOOL_JLINK: &str = "tool-jlink";
pub const TOOL_MBCTOOL: &str = "tool-mbctool";

/// Resolves package names to installed package directories.
pub trait PackageLocator {
    /// The directory of package `name`, if it is installed.
    fn package_dir(&self, name: &str) -> Option<PathBuf>;

    /// Like [`PackageLocator::package_dir`] but a missing package is an error.
    fn require_package(&self, name: &str) -> Result<PathBuf, ConfigError> {
        self.package_dir(name)
            .ok_or_else(|| ConfigError::MissingPackage(name.to_owned()))
    }
}

/// Packages installed as `<root>/<name>` directories.
#[derive(Debug, Clone)]
pub struct PackagesDir {
    root: PathBuf,
}

impl PackagesDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PackageLocator for PackagesDir {
    fn package_dir(&self, name: &str) -> Option<PathBuf> {
        let dir = self.root.join(name);
        dir.is_dir().then(|| dir)
    }
}

impl PackageLocator for BTreeMap<String, PathBuf> {
    fn package_dir(&self, name: &str) -> Option<PathBuf> {
        self.get(name).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    Toolchain,
    Framework,
    Uploader,
}

/// A package a configuration needs, with an optional version requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageRequirement {
    pub name: String,
    pub kind: PackageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl PackageRequirement {
    fn new(name: impl Into<String>, kind: PackageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            version: None,
        }
    }

    fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// The packages for one board, framework and upload protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageSelection {
    /// The package providing the upload tool.
    pub uploader: String,
    /// The package providing the framework sources, if any.
    pub framework: Option<String>,
    pub packages: Vec<PackageRequirement>,
}

impl PackageSelection {
    pub fn get(&self, name: &str) -> Option<&PackageRequirement> {
        self.packages.iter().find(|p| p.name == name)
    }
}

/// The package providing the uploader for `protocol`.
///
/// Everything that is not a serial bootloader or a vendor tool goes through OpenOCD.
pub fn uploader_package(protocol: &str) -> &'static str {
    match protocol {
        "sam-ba" => TOOL_BOSSAC,
        "stk500v2" => TOOL_AVRDUDE,
        "jlink" => TOOL_JLINK,
        "mbctool" => TOOL_MBCTOOL,
        _ => TOOL_OPENOCD,
    }
}

/// The Arduino system of a board: `build.system` if set, otherwise `sam` for the
/// AT91 parts and `samd` for everything else.
pub fn arduino_system(board: &BoardDescriptor) -> String {
    match &board.build.system {
        Some(system) => system.to_lowercase(),
        None if board.build.mcu.to_lowercase().starts_with("at91") => "sam".into(),
        None => "samd".into(),
    }
}

/// The Arduino framework package of a board, e.g. `framework-arduino-samd-adafruit`.
pub fn arduino_package(board: &BoardDescriptor) -> String {
    let core = board.build.core.to_lowercase();

    if core == "mbcwb" {
        return "framework-arduino-mbcwb".into();
    }

    let mut package = format!("framework-arduino-{}", arduino_system(board));
    if core != "arduino" {
        package.push('-');
        package.push_str(&core);
    }

    package
}

/// Select the packages `board` needs to build with `framework` and upload with
/// `protocol`.
pub fn select_packages(
    board: &BoardDescriptor,
    framework: Framework,
    protocol: &str,
) -> Result<PackageSelection, ConfigError> {
    let core = board.build.core.to_lowercase();
    let uploader = uploader_package(protocol);

    let mut packages = vec![PackageRequirement::new(TOOLCHAIN, PackageKind::Toolchain)];

    let mut uploader_req = PackageRequirement::new(uploader, PackageKind::Uploader);
    if uploader == TOOL_BOSSAC
        && (core == "adafruit" || core == "seeed")
        && board.mcu().starts_with("samd51")
    {
        uploader_req = uploader_req.version("~1.10900.0");
    }
    packages.push(uploader_req);

    let framework_package = match framework {
        Framework::Baremetal => None,
        Framework::Cmsis => {
            packages.push(PackageRequirement::new(FRAMEWORK_CMSIS, PackageKind::Framework));
            Some(FRAMEWORK_CMSIS.to_owned())
        }
        Framework::Arduino => {
            let package = arduino_package(board);

            if core == "mbcwb" && uploader != TOOL_MBCTOOL {
                packages.push(PackageRequirement::new(TOOL_MBCTOOL, PackageKind::Uploader));
            }

            packages.push(PackageRequirement::new(&package, PackageKind::Framework));
            packages.push(PackageRequirement::new(FRAMEWORK_CMSIS, PackageKind::Framework));

            let mut cmsis_atmel = PackageRequirement::new(FRAMEWORK_CMSIS_ATMEL, PackageKind::Framework);
            if matches!(core.as_str(), "sodaq" | "tuino0" | "reprap") {
                cmsis_atmel = cmsis_atmel.version("~1.1.0");
            }
            packages.push(cmsis_atmel);

            Some(package)
        }
    };

    debug!(
        "Packages for board '{}' ({}, {}): {:?}",
        board.id, framework, protocol, packages
    );

    Ok(PackageSelection {
        uploader: uploader.to_owned(),
        framework: framework_package,
        packages,
    })
}
