//! Board manifests.
//!
//! A [`BoardDescriptor`] is read from a PlatformIO-style board JSON file, e.g.
//!
//! ```json
//! {
//!   "build": { "mcu": "samd21g18a", "cpu": "cortex-m0plus", "core": "arduino", ... },
//!   "upload": { "protocol": "sam-ba", "offset_address": "0x2000", ... },
//!   "debug": { "jlink_device": "ATSAMD21G18", ... },
//!   "name": "Arduino Zero (USB Native Port)",
//!   "vendor": "Arduino"
//! }
//! ```
//!
//! Descriptors are never mutated after loading; derived state lives elsewhere.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ldscript::FlashOffset;

/// Debug probes that get a default debug tool entry when listed as an upload protocol.
pub const DEFAULT_DEBUG_TOOLS: [&str; 5] = ["blackmagic", "jlink", "atmel-ice", "cmsis-dap", "stlink"];

/// One hardware target.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BoardDescriptor {
    /// The board id, by convention the manifest's file stem.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub frameworks: Vec<String>,
    pub build: BoardBuild,
    #[serde(default)]
    pub upload: BoardUpload,
    #[serde(default)]
    pub debug: BoardDebug,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BoardBuild {
    /// The MCU identifier, e.g. `samd21g18a` or `at91sam3x8e`.
    pub mcu: String,
    /// The CPU core, e.g. `cortex-m0plus`.
    pub cpu: String,
    #[serde(default)]
    pub f_cpu: String,
    /// The vendor core selector, e.g. `arduino`, `adafruit`, `mattairtech`.
    #[serde(default = "default_core")]
    pub core: String,
    /// The Arduino system (`sam` or `samd`), derived from the MCU when absent.
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub variant: Option<String>,
    /// A directory relative to the project holding custom variants.
    #[serde(default)]
    pub variants_dir: Option<PathBuf>,
    /// An explicit linker script, overriding the framework's choice.
    #[serde(default)]
    pub ldscript: Option<PathBuf>,
    #[serde(default)]
    pub arduino: ArduinoBuild,
    #[serde(default)]
    pub usb_product: Option<String>,
    #[serde(default)]
    pub usb_power: Option<u32>,
    /// USB `[vid, pid]` pairs; the first one is used for the USB defines.
    #[serde(default)]
    pub hwids: Vec<[String; 2]>,
    #[serde(default)]
    pub extra_flags: Option<String>,
}

fn default_core() -> String {
    "arduino".into()
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, Eq)]
pub struct ArduinoBuild {
    #[serde(default)]
    pub ldscript: Option<String>,
    #[serde(default)]
    pub bootloader_dir: Option<String>,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BoardUpload {
    pub protocol: Option<String>,
    pub protocols: Vec<String>,
    pub speed: Option<u32>,
    pub native_usb: bool,
    pub use_1200bps_touch: bool,
    pub wait_for_upload_port: bool,
    pub disable_flushing: bool,
    pub require_upload_port: bool,
    pub offset_address: Option<String>,
    pub openocdcfg: Option<String>,
    pub section_start: Option<String>,
    pub maximum_size: Option<u64>,
    pub maximum_ram_size: Option<u64>,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BoardDebug {
    pub jlink_device: Option<String>,
    pub openocd_chipname: Option<String>,
    pub openocd_target: Option<String>,
    pub svd_path: Option<String>,
    pub onboard_tools: Vec<String>,
    pub tools: BTreeMap<String, DebugTool>,
}

/// How a debugger attaches through one probe.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DebugTool {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<DebugServer>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hwids: Vec<[String; 2]>,
    pub require_debug_port: bool,
    pub onboard: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_cmd: Option<String>,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, Eq)]
pub struct DebugServer {
    pub package: String,
    pub executable: String,
    /// Server arguments; `$PACKAGE_DIR` stands for the package's directory.
    pub arguments: Vec<String>,
}

impl BoardDescriptor {
    /// Load a board manifest; the id defaults to the file stem.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).map_err(ConfigError::io(path))?;
        let mut board: Self =
            serde_json::from_str(&content).map_err(|source| ConfigError::InvalidBoard {
                path: path.to_owned(),
                source,
            })?;

        if board.id.is_empty() {
            if let Some(stem) = path.file_stem() {
                board.id = stem.to_string_lossy().into_owned();
            }
        }

        debug!("Loaded board '{}' ({}) from {}", board.id, board.name, path.display());

        Ok(board)
    }

    /// The MCU identifier, lowercased.
    pub fn mcu(&self) -> String {
        self.build.mcu.to_lowercase()
    }

    pub fn upload_protocol(&self) -> Option<&str> {
        self.upload.protocol.as_deref()
    }

    /// The bootloader offset the application has to be linked at.
    pub fn offset_address(&self) -> Result<Option<FlashOffset>, ConfigError> {
        self.upload
            .offset_address
            .as_deref()
            .map(str::parse::<FlashOffset>)
            .transpose()
    }

    /// The first USB `(vid, pid)` pair.
    pub fn usb_ids(&self) -> Option<(&str, &str)> {
        self.build
            .hwids
            .first()
            .map(|[vid, pid]| (vid.as_str(), pid.as_str()))
    }

    fn require<'a>(
        &self,
        value: &'a Option<String>,
        field: &'static str,
    ) -> Result<&'a str, ConfigError> {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingBoardField {
                board: self.id.clone(),
                field,
            })
    }

    /// Return a copy with a debug tool entry for every probe in the upload protocols
    /// that has none yet.
    ///
    /// Entries already present are kept, so applying this twice changes nothing.
    pub fn with_default_debug_tools(&self) -> Result<Self, ConfigError> {
        let mut board = self.clone();

        for link in DEFAULT_DEBUG_TOOLS {
            if !self.upload.protocols.iter().any(|p| p == link)
                || self.debug.tools.contains_key(link)
            {
                continue;
            }

            debug!("Board '{}': default debug tool '{}'", self.id, link);
            board
                .debug
                .tools
                .insert(link.to_owned(), self.default_debug_tool(link)?);
        }

        Ok(board)
    }

    /// The debug tool entry for probe `link` derived from the debug section.
    pub fn default_debug_tool(&self, link: &str) -> Result<DebugTool, ConfigError> {
        let onboard = self.debug.onboard_tools.iter().any(|t| t == link);

        let tool = match link {
            "blackmagic" => DebugTool {
                hwids: vec![["0x1d50".into(), "0x6018".into()]],
                require_debug_port: true,
                ..Default::default()
            },
            "jlink" => {
                let device = self.require(&self.debug.jlink_device, "debug.jlink_device")?;

                DebugTool {
                    server: Some(DebugServer {
                        package: "tool-jlink".into(),
                        executable: if cfg!(windows) {
                            "JLinkGDBServerCL.exe"
                        } else {
                            "JLinkGDBServer"
                        }
                        .into(),
                        arguments: [
                            "-singlerun", "-if", "SWD", "-select", "USB", "-device", device,
                            "-port", "2331",
                        ]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                    }),
                    onboard,
                    ..Default::default()
                }
            }
            _ => {
                let chipname = self.require(&self.debug.openocd_chipname, "debug.openocd_chipname")?;
                let target = self.require(&self.debug.openocd_target, "debug.openocd_target")?;

                let mut commands = vec![format!("set CHIPNAME {}", chipname)];
                if link == "stlink" && chipname.contains("at91sam3") {
                    commands.push("set CPUTAPID 0x2ba01477".into());
                }

                DebugTool {
                    server: Some(DebugServer {
                        package: "tool-openocd".into(),
                        executable: "bin/openocd".into(),
                        arguments: vec![
                            "-s".into(),
                            "$PACKAGE_DIR/scripts".into(),
                            "-f".into(),
                            format!("interface/{}.cfg", openocd_interface(link)),
                            "-c".into(),
                            commands.join("; "),
                            "-f".into(),
                            format!("target/{}.cfg", target),
                        ],
                    }),
                    onboard,
                    load_cmd: (link == "stlink").then(|| "preload".into()),
                    ..Default::default()
                }
            }
        };

        Ok(tool)
    }
}

/// The OpenOCD interface script name for a probe protocol.
pub fn openocd_interface(protocol: &str) -> &str {
    match protocol {
        "atmel-ice" => "cmsis-dap",
        other => other,
    }
}
