//! The named build targets.
//!
//! | target     | does                                              | default | always |
//! |------------|---------------------------------------------------|---------|--------|
//! | `buildprog`| converts the ELF into the image the uploader takes | yes     | no     |
//! | `size`     | prints the program size                           | yes     | yes    |
//! | `upload`   | builds the image and uploads it                   | no      | yes    |
//! | `nobuild`  | makes `upload` use the existing image             | no      | yes    |

use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, info, warn};
use serde::Serialize;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use crate::cmd;
use crate::cmd::Cmd;
use crate::config::ComposedConfig;
use crate::error::{ConfigError, UploadError};
use crate::upload::{ImageKind, SerialPorts, UploadPlan, Uploader, PORT_PLACEHOLDER};

pub const TOOLCHAIN_PREFIX: &str = "arm-none-eabi-";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    EnumIter,
    Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TargetName {
    Buildprog,
    Size,
    Upload,
    Nobuild,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub name: TargetName,
    pub depends: Vec<TargetName>,
    /// Run even if the output is up to date.
    pub always_build: bool,
    /// Run when no target is requested.
    pub default: bool,
    /// The file this target produces or refers to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

/// The targets of one configuration and the commands behind them.
#[derive(Debug, Clone, Serialize)]
pub struct TargetGraph {
    elf: PathBuf,
    image: PathBuf,
    image_kind: ImageKind,
    toolchain_bin: Option<PathBuf>,
    upload: UploadPlan,
    targets: Vec<Target>,
}

impl TargetGraph {
    /// Wire the targets for the program `config.progname` in `build_dir`.
    ///
    /// `toolchain_dir` is the toolchain package; without it the binutils are looked
    /// up in `PATH`.
    pub fn assemble(
        config: &ComposedConfig,
        upload: UploadPlan,
        build_dir: &Path,
        toolchain_dir: Option<&Path>,
    ) -> Self {
        let elf = build_dir.join(format!("{}.elf", config.progname));

        // The GDB based uploaders take the ELF but the image is still built
        let image_kind = match upload.image {
            ImageKind::Hex => ImageKind::Hex,
            _ => ImageKind::Bin,
        };
        let image = elf.with_extension(image_kind.extension());

        let targets = vec![
            Target {
                name: TargetName::Buildprog,
                depends: Vec::new(),
                always_build: false,
                default: true,
                output: Some(image.clone()),
            },
            Target {
                name: TargetName::Size,
                depends: Vec::new(),
                always_build: true,
                default: true,
                output: None,
            },
            Target {
                name: TargetName::Upload,
                depends: vec![TargetName::Buildprog],
                always_build: true,
                default: false,
                output: None,
            },
            Target {
                name: TargetName::Nobuild,
                depends: Vec::new(),
                always_build: true,
                default: false,
                output: Some(image.clone()),
            },
        ];

        debug!("Targets for {}: {:?}", elf.display(), targets);

        Self {
            elf,
            image,
            image_kind,
            toolchain_bin: toolchain_dir.map(|dir| dir.join("bin")),
            upload,
            targets,
        }
    }

    /// Look up a target by name.
    pub fn get(&self, name: &str) -> Result<&Target, ConfigError> {
        let name = TargetName::from_str(name.trim())
            .map_err(|_| ConfigError::UnknownTarget(name.to_owned()))?;

        self.target(name)
            .ok_or_else(|| ConfigError::UnknownTarget(name.to_string()))
    }

    pub fn target(&self, name: TargetName) -> Option<&Target> {
        self.targets.iter().find(|t| t.name == name)
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn defaults(&self) -> impl Iterator<Item = TargetName> + '_ {
        self.targets.iter().filter(|t| t.default).map(|t| t.name)
    }

    pub fn elf(&self) -> &Path {
        &self.elf
    }

    pub fn image(&self) -> &Path {
        &self.image
    }

    pub fn upload_plan(&self) -> &UploadPlan {
        &self.upload
    }

    /// The file the uploader is given.
    pub fn upload_source(&self) -> &Path {
        match self.upload.image {
            ImageKind::Elf => &self.elf,
            _ => &self.image,
        }
    }

    /// The targets to run for `requested`, dependencies first, each once.
    ///
    /// Nothing requested runs the default targets. `nobuild` keeps `upload` from
    /// building the image.
    pub fn schedule(&self, requested: &[TargetName]) -> Vec<TargetName> {
        let requested = if requested.is_empty() {
            self.defaults().collect()
        } else {
            requested.to_vec()
        };
        let nobuild = requested.contains(&TargetName::Nobuild);

        let mut order = Vec::new();
        for name in requested {
            if let Some(target) = self.target(name) {
                if !(name == TargetName::Upload && nobuild) {
                    order.extend(target.depends.iter().copied().filter(|d| *d != name));
                }
            }
            order.push(name);
        }

        let mut seen = Vec::new();
        order.retain(|name| {
            if seen.contains(name) {
                false
            } else {
                seen.push(*name);
                true
            }
        });

        order
    }

    fn binutil(&self, name: &str) -> PathBuf {
        let tool = format!("{}{}", TOOLCHAIN_PREFIX, name);

        self.toolchain_bin
            .as_ref()
            .map(|bin| bin.join(&tool))
            .filter(|path| path.is_file())
            .unwrap_or_else(|| tool.into())
    }

    /// The external commands of `target`.
    ///
    /// The upload command is shown with the configured port, or with the port
    /// placeholder if the port is only known once the pre-upload actions ran.
    pub fn commands(&self, target: TargetName) -> Vec<Cmd> {
        match target {
            TargetName::Buildprog => {
                let format: &[&str] = match self.image_kind {
                    ImageKind::Hex => &["-O", "ihex", "-R", ".eeprom"],
                    _ => &["-O", "binary"],
                };
                vec![cmd!(self.binutil("objcopy"), @format, &self.elf, &self.image)]
            }
            TargetName::Size => {
                vec![cmd!(self.binutil("size"), "-B", "-d", &self.elf)]
            }
            TargetName::Upload => {
                let Some(executable) = &self.upload.executable else {
                    return Vec::new();
                };

                let port = self.upload.port.as_deref().unwrap_or(PORT_PLACEHOLDER);
                let args = self
                    .upload
                    .render_args(Some(port), self.upload_source())
                    .unwrap_or_else(|_| self.upload.args.clone());

                vec![cmd!(executable; args=(args))]
            }
            TargetName::Nobuild => Vec::new(),
        }
    }

    /// Run the targets `requested` resolves to.
    pub fn run<P: SerialPorts>(
        &self,
        requested: &[TargetName],
        uploader: &mut Uploader<P>,
    ) -> Result<(), UploadError> {
        for name in self.schedule(requested) {
            info!("Target: {}", name);

            match name {
                TargetName::Upload => uploader.upload(&self.upload, self.upload_source())?,
                TargetName::Nobuild => {
                    if !self.image.exists() {
                        warn!("{} does not exist yet", self.image.display());
                    }
                }
                _ => {
                    for mut cmd in self.commands(name) {
                        cmd.run()?;
                    }
                }
            }
        }

        Ok(())
    }
}

impl TargetName {
    pub fn all() -> impl Iterator<Item = Self> {
        Self::iter()
    }
}
