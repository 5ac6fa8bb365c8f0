//! Framework configuration layers.
//!
//! Every build starts from the same bare-metal layer, followed by an architecture
//! layer for the CPU core, an optional vendor core layer for the selected framework
//! and finally the board's own flags. Layers are plain data; their order is decided
//! here and their merge by [`compose`](crate::config::compose).

use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::board::BoardDescriptor;
use crate::config::{ConfigLayer, Define, Flags, Paths};
use crate::error::ConfigError;
use crate::family::{arduino_families, cmsis_families};
use crate::ldscript::LinkerScripts;
use crate::packages::{self, PackageLocator};
use crate::utils::PathExt;

/// The platform name used in framework package layouts.
pub const PLATFORM_NAME: &str = "atmelsam";

/// The Arduino API version the cores are built against.
pub const ARDUINO_VERSION: u32 = 10805;

/// A supported framework.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    /// Only the toolchain; the project brings its own startup code and linker script.
    Baremetal,
    /// ARM CMSIS with the Atmel device headers and startup code.
    Cmsis,
    /// One of the Arduino cores, selected by the board's core and system.
    Arduino,
}

impl Framework {
    /// Parse a framework name.
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        name.trim()
            .parse()
            .map_err(|_| ConfigError::UnknownFramework(name.to_owned()))
    }
}

/// A directory of framework sources the build has to compile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSet {
    /// The build subdirectory name, e.g. `FrameworkArduino`.
    pub name: String,
    pub src_dir: PathBuf,
    /// Where the sources are archived, if they are linked as a library.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<PathBuf>,
}

/// Inputs for building the framework layers of one board.
#[derive(Clone, Copy)]
pub struct FrameworkContext<'a> {
    pub board: &'a BoardDescriptor,
    pub packages: &'a dyn PackageLocator,
    /// Relative board paths (variants dir, linker script) are resolved against this.
    pub project_dir: &'a Path,
    pub build_dir: &'a Path,
    /// A linker script chosen by the user; frameworks then don't pick their own.
    pub ldscript_override: Option<&'a Path>,
}

impl<'a> FrameworkContext<'a> {
    fn has_ldscript_override(&self) -> bool {
        self.ldscript_override.is_some() || self.board.build.ldscript.is_some()
    }

    fn library(&self, name: &str, src_dir: PathBuf) -> SourceSet {
        SourceSet {
            name: name.to_owned(),
            src_dir,
            archive: Some(self.build_dir.join(format!("lib{}.a", name))),
        }
    }
}

/// The ordered layers and source sets of one framework.
#[derive(Debug, Clone, Default)]
pub struct FrameworkLayers {
    pub layers: Vec<ConfigLayer>,
    pub sources: Vec<SourceSet>,
}

/// Build the layers for `framework`: bare metal, architecture, vendor core, board.
pub fn framework_layers(
    framework: Framework,
    ctx: &FrameworkContext<'_>,
) -> Result<FrameworkLayers, ConfigError> {
    let board = ctx.board;

    let mut result = FrameworkLayers::default();
    result.layers.push(bare_layer(board));

    let (core_layer, sources, fpu) = match framework {
        Framework::Baremetal => (None, Vec::new(), false),
        Framework::Cmsis => {
            let (layer, sources) = cmsis_layer(ctx)?;
            (Some(layer), sources, false)
        }
        Framework::Arduino => {
            let core = ArduinoCore::of(board)?;
            let (layer, sources) = arduino_layer(ctx, core)?;
            (Some(layer), sources, core.uses_fpu(board))
        }
    };

    result.layers.push(arch_layer(board, fpu));
    result.layers.extend(core_layer);
    result.layers.push(board_layer(ctx));
    result.sources = sources;

    Ok(result)
}

/// Flags every ARM build starts from.
pub fn bare_layer(board: &BoardDescriptor) -> ConfigLayer {
    let mut layer = ConfigLayer::new("bare");

    layer
        .append(Flags::CFlags, ["-std=gnu11"])
        .append(
            Flags::CcFlags,
            [
                "-g",
                "-Os",
                "-ffunction-sections",
                "-fdata-sections",
                "-Wall",
                "-mthumb",
                "-nostdlib",
                "--param",
                "max-inline-insns-single=500",
            ],
        )
        .append(
            Flags::CxxFlags,
            [
                "-fno-rtti",
                "-fno-exceptions",
                "-std=gnu++11",
                "-fno-threadsafe-statics",
            ],
        )
        .define(Define::value("F_CPU", &board.build.f_cpu))
        .define(Define::flag("USBCON"))
        .append(
            Flags::LinkFlags,
            [
                "-Os",
                "-mthumb",
                "-Wl,--gc-sections",
                "-Wl,--check-sections",
                "-Wl,--unresolved-symbols=report-all",
                "-Wl,--warn-common",
                "-Wl,--warn-section-align",
            ],
        )
        .append(Flags::Libs, ["c", "gcc", "m"])
        .default_progname("firmware");

    let mcu = board.mcu();
    if mcu.contains("samd") || mcu.contains("samc") {
        layer.append(Flags::LinkFlags, ["--specs=nosys.specs", "--specs=nano.specs"]);
    }

    layer
}

/// CPU core flags, with the hard-float ABI in front when `fpu` is set.
pub fn arch_layer(board: &BoardDescriptor, fpu: bool) -> ConfigLayer {
    let mut layer = ConfigLayer::new("arch");

    let mcpu = format!("-mcpu={}", board.build.cpu);
    layer
        .append(Flags::CcFlags, [mcpu.clone()])
        .append(Flags::LinkFlags, [mcpu]);

    if fpu {
        let float_abi = ["-mfloat-abi=hard", "-mfpu=fpv4-sp-d16"];
        layer
            .prepend(Flags::CcFlags, float_abi)
            .prepend(Flags::LinkFlags, float_abi);
    }

    layer
}

/// The board's extra build flags and explicit linker script.
pub fn board_layer(ctx: &FrameworkContext<'_>) -> ConfigLayer {
    let board = ctx.board;
    let mut layer = ConfigLayer::new("board");

    if let Some(flags) = &board.build.extra_flags {
        layer.build_flags(flags);
    }

    if let Some(ldscript) = &board.build.ldscript {
        layer.ldscript(ldscript.abspath_relative_to(ctx.project_dir));
    }

    layer
}

fn cmsis_layer(ctx: &FrameworkContext<'_>) -> Result<(ConfigLayer, Vec<SourceSet>), ConfigError> {
    let board = ctx.board;
    let framework_dir = ctx.packages.require_package(packages::FRAMEWORK_CMSIS)?;

    let families = cmsis_families();
    let family = families.resolve(&board.build.mcu)?;

    let variant_dir = framework_dir
        .join("variants")
        .join(PLATFORM_NAME)
        .join(family);
    if !variant_dir.is_dir() {
        return Err(ConfigError::MissingVariantDir {
            name: board.build.mcu.clone(),
            path: variant_dir,
        });
    }

    info!(
        "MCU '{}' belongs to CMSIS family '{}'",
        board.build.mcu, family
    );

    let scripts = LinkerScripts::new(
        framework_dir
            .join("platformio")
            .join("ldscripts")
            .join(PLATFORM_NAME),
        ctx.build_dir.join("ldscripts"),
    );

    let mut layer = ConfigLayer::new("cmsis");
    layer
        .append_paths(
            Paths::CppPath,
            [
                framework_dir.join("CMSIS").join("Core").join("Include"),
                variant_dir.join("include"),
            ],
        )
        .append_paths(Paths::LibPath, [scripts.template_dir()]);

    if !ctx.has_ldscript_override() {
        let template = scripts.resolve(&board.build.mcu)?;
        let ldscript = scripts.apply_offset(&template, board.offset_address()?.as_ref())?;

        info!("Linker script: {}", ldscript.display());
        layer.default_ldscript(ldscript);
    }

    let sources = vec![SourceSet {
        name: "FrameworkCMSISVariant".into(),
        src_dir: variant_dir.join("gcc"),
        archive: None,
    }];

    Ok((layer, sources))
}

/// The Arduino core flavors with distinct build setups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ArduinoCore {
    /// SAM3X boards (`framework-arduino-sam*`).
    Sam,
    /// SAMD/SAML/SAMC boards with the official core or a fork of it.
    Samd,
    /// The Adafruit fork of the SAMD core.
    SamdAdafruit,
    /// The MattairTech SAMD core, which ships its own CMSIS-Atmel.
    SamdMattairtech,
}

impl ArduinoCore {
    pub fn of(board: &BoardDescriptor) -> Result<Self, ConfigError> {
        let system = packages::arduino_system(board);

        Ok(match (system.as_str(), board.build.core.to_lowercase().as_str()) {
            ("sam", _) => Self::Sam,
            ("samd", "adafruit") => Self::SamdAdafruit,
            ("samd", "mattairtech") => Self::SamdMattairtech,
            ("samd", _) => Self::Samd,
            (other, _) => return Err(ConfigError::UnknownFramework(format!("arduino-{}", other))),
        })
    }

    fn uses_fpu(self, board: &BoardDescriptor) -> bool {
        matches!(self, Self::Samd | Self::SamdAdafruit) && board.build.cpu == "cortex-m4"
    }
}

fn arduino_layer(
    ctx: &FrameworkContext<'_>,
    core: ArduinoCore,
) -> Result<(ConfigLayer, Vec<SourceSet>), ConfigError> {
    let board = ctx.board;

    let package = packages::arduino_package(board);
    let framework_dir = ctx.packages.require_package(&package)?;

    info!("Arduino core '{}' from package '{}'", core, package);

    let variants_dir = match &board.build.variants_dir {
        Some(dir) => dir.abspath_relative_to(ctx.project_dir),
        None => framework_dir.join("variants"),
    };
    let variant_dir = board.build.variant.as_ref().map(|v| variants_dir.join(v));
    if let Some(dir) = &variant_dir {
        if !dir.is_dir() {
            return Err(ConfigError::MissingVariantDir {
                name: board.build.variant.clone().unwrap_or_default(),
                path: dir.clone(),
            });
        }
    }

    let core_dir = framework_dir.join("cores").join("arduino");

    let mut sources = Vec::new();
    if let Some(variant_dir) = &variant_dir {
        sources.push(ctx.library("FrameworkArduinoVariant", variant_dir.clone()));
    }
    sources.push(ctx.library("FrameworkArduino", core_dir.clone()));

    let mut layer = ConfigLayer::new(format!("arduino-{}", core));

    // Framework archives go in front of everything else
    layer.prepend(
        Flags::Libs,
        sources
            .iter()
            .filter_map(|s| s.archive.as_ref())
            .map(|a| a.display().to_string())
            .collect::<Vec<_>>(),
    );

    layer
        .define(Define::value("ARDUINO", ARDUINO_VERSION))
        .append_paths(Paths::CppPath, [&core_dir])
        .append_paths(Paths::LibSourceDirs, [framework_dir.join("libraries")]);

    match core {
        ArduinoCore::Sam => sam_core(&mut layer, board, &framework_dir)?,
        ArduinoCore::Samd | ArduinoCore::SamdAdafruit => {
            samd_core(&mut layer, ctx, core, &core_dir)?
        }
        ArduinoCore::SamdMattairtech => mattairtech_core(&mut layer, ctx, &framework_dir)?,
    }

    usb_defines(&mut layer, board);

    if !ctx.has_ldscript_override() {
        if let Some(variant_dir) = &variant_dir {
            let mut scripts_dir = variant_dir.join("linker_scripts").join("gcc");
            if let Some(bootloader_dir) = &board.build.arduino.bootloader_dir {
                scripts_dir.push(bootloader_dir);
            }
            layer.append_paths(Paths::LibPath, [scripts_dir]);
        }

        if let Some(ldscript) = &board.build.arduino.ldscript {
            info!("Linker script: {}", ldscript);
            layer.default_ldscript(ldscript);
        }
    }

    if let Some(variant_dir) = &variant_dir {
        layer.append_paths(Paths::CppPath, [variant_dir]);
        if matches!(core, ArduinoCore::Sam | ArduinoCore::SamdMattairtech) {
            layer.append_paths(Paths::LibPath, [variant_dir]);
        }
    }

    Ok((layer, sources))
}

fn sam_core(
    layer: &mut ConfigLayer,
    board: &BoardDescriptor,
    framework_dir: &Path,
) -> Result<(), ConfigError> {
    let system_dir = framework_dir.join("system");
    if !system_dir.is_dir() {
        return Err(ConfigError::MissingVariantDir {
            name: "system".into(),
            path: system_dir,
        });
    }

    let families = arduino_families();
    let device = families.resolve(&board.build.mcu)?;
    let device_dir = system_dir.join("CMSIS").join("Device").join("ATMEL");

    layer
        .append_paths(
            Paths::CppPath,
            [
                system_dir.join("libsam"),
                system_dir.join("CMSIS").join("CMSIS").join("Include"),
                device_dir.join(device).join("include"),
                device_dir,
            ],
        )
        .append(
            Flags::LinkFlags,
            [
                "-Wl,--entry=Reset_Handler",
                "-u", "_sbrk", "-u", "link", "-u", "_close", "-u", "_fstat", "-u", "_isatty",
                "-u", "_lseek", "-u", "_read", "-u", "_write", "-u", "_exit", "-u", "kill",
                "-u", "_getpid",
            ],
        )
        .append(Flags::Libs, ["sam_sam3x8e_gcc_rel", "gcc"]);

    Ok(())
}

fn samd_core(
    layer: &mut ConfigLayer,
    ctx: &FrameworkContext<'_>,
    core: ArduinoCore,
    core_dir: &Path,
) -> Result<(), ConfigError> {
    let board = ctx.board;
    let cmsis_dir = ctx.packages.require_package(packages::FRAMEWORK_CMSIS)?;
    let cmsis_atmel_dir = ctx.packages.require_package(packages::FRAMEWORK_CMSIS_ATMEL)?;

    layer
        .append_paths(
            Paths::CppPath,
            [
                cmsis_dir.join("CMSIS").join("Include"),
                cmsis_atmel_dir.join("CMSIS").join("Device").join("ATMEL"),
            ],
        )
        .append_paths(Paths::LibPath, [cmsis_dir.join("CMSIS").join("Lib").join("GCC")])
        .append(Flags::LinkFlags, ["--specs=nosys.specs", "--specs=nano.specs"])
        .prepend(
            Flags::Libs,
            [if board.build.cpu == "cortex-m4" {
                "arm_cortexM4lf_math"
            } else {
                "arm_cortexM0l_math"
            }],
        );

    if core == ArduinoCore::SamdAdafruit {
        let tinyusb = core_dir.join("TinyUSB");
        let arduino_core = tinyusb.join("Adafruit_TinyUSB_ArduinoCore");

        layer
            .define(Define::value(
                "USB_CONFIG_POWER",
                board.build.usb_power.unwrap_or(100),
            ))
            .append(Flags::CcFlags, ["-Wno-expansion-to-defined"])
            .append_paths(
                Paths::CppPath,
                [
                    tinyusb.clone(),
                    arduino_core.clone(),
                    arduino_core.join("tinyusb").join("src"),
                ],
            );
    }

    Ok(())
}

fn mattairtech_core(
    layer: &mut ConfigLayer,
    ctx: &FrameworkContext<'_>,
    framework_dir: &Path,
) -> Result<(), ConfigError> {
    let cmsis_dir = ctx.packages.require_package(packages::FRAMEWORK_CMSIS)?;
    let cmsis_atmel_dir = framework_dir.join("system").join("CMSIS-Atmel");
    if !cmsis_atmel_dir.is_dir() {
        return Err(ConfigError::MissingPackage(
            cmsis_atmel_dir.display().to_string(),
        ));
    }

    layer
        .append(
            Flags::CcFlags,
            ["-fsingle-precision-constant", "-Wdouble-promotion"],
        )
        .append(Flags::CxxFlags, ["-std=gnu++14"])
        .defines(
            [
                "ARM_MATH_CM0PLUS",
                "CONFIG_H_DISABLED",
                "CDC_ONLY",
                "ONE_UART",
                "ONE_WIRE",
                "ONE_SPI",
                "CLOCKCONFIG_INTERNAL_USB",
                "TIMER_732Hz",
                "FLOAT_BOTH_DOUBLES_ONLY",
            ]
            .into_iter()
            .map(Define::flag),
        )
        .append_paths(
            Paths::CppPath,
            [
                cmsis_dir.join("CMSIS").join("Include"),
                cmsis_atmel_dir.join("CMSIS").join("Device").join("ATMEL"),
            ],
        )
        .append(Flags::LinkFlags, ["--specs=nosys.specs", "--specs=nano.specs"])
        .append_paths(Paths::LibPath, [cmsis_dir.join("CMSIS").join("Lib").join("GCC")]);

    Ok(())
}

fn usb_defines(layer: &mut ConfigLayer, board: &BoardDescriptor) {
    let product = match &board.build.usb_product {
        Some(product) => product,
        None => return,
    };

    if let Some((vid, pid)) = board.usb_ids() {
        layer
            .define(Define::value("USB_VID", vid))
            .define(Define::value("USB_PID", pid));
    } else {
        debug!("Board '{}' has a USB product but no hwids", board.id);
    }

    layer
        .define(Define::value(
            "USB_PRODUCT",
            format!("\"{}\"", product.replace('"', "")),
        ))
        .define(Define::value(
            "USB_MANUFACTURER",
            format!("\"{}\"", board.vendor.replace('"', "")),
        ));
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use super::*;
    use crate::board::tests::test_board;
    use crate::config::compose;

    /// A fake packages root with the directories the frameworks look for.
    pub(crate) fn fake_packages(root: &Path) -> BTreeMap<String, PathBuf> {
        let dirs = [
            "framework-cmsis/CMSIS/Core/Include",
            "framework-cmsis/variants/atmelsam/samd21a/include",
            "framework-cmsis/variants/atmelsam/samd21a/gcc",
            "framework-cmsis/variants/atmelsam/sam3x/include",
            "framework-cmsis/platformio/ldscripts/atmelsam",
            "framework-cmsis-atmel/CMSIS/Device/ATMEL",
            "framework-arduino-samd/cores/arduino",
            "framework-arduino-samd/variants/arduino_zero/linker_scripts/gcc",
            "framework-arduino-samd-adafruit/cores/arduino",
            "framework-arduino-samd-adafruit/variants/feather_m4/linker_scripts/gcc",
            "framework-arduino-sam/cores/arduino",
            "framework-arduino-sam/system/libsam",
            "framework-arduino-sam/variants/arduino_due_x/linker_scripts/gcc",
            "tool-openocd/scripts",
            "tool-bossac",
            "tool-avrdude",
        ];
        for dir in dirs {
            fs::create_dir_all(root.join(dir)).unwrap();
        }

        fs::copy(
            format!(
                "{}/tests/resources/ldscripts/samd21g18a_flash.ld",
                env!("CARGO_MANIFEST_DIR")
            ),
            root.join("framework-cmsis/platformio/ldscripts/atmelsam/samd21g18a_flash.ld"),
        )
        .unwrap();

        [
            "framework-cmsis",
            "framework-cmsis-atmel",
            "framework-arduino-samd",
            "framework-arduino-samd-adafruit",
            "framework-arduino-sam",
            "tool-openocd",
            "tool-bossac",
            "tool-avrdude",
        ]
        .iter()
        .map(|name| (name.to_string(), root.join(name)))
        .collect()
    }

    fn context<'a>(
        board: &'a BoardDescriptor,
        packages: &'a BTreeMap<String, PathBuf>,
        dir: &'a Path,
    ) -> FrameworkContext<'a> {
        FrameworkContext {
            board,
            packages,
            project_dir: dir,
            build_dir: dir,
            ldscript_override: None,
        }
    }

    #[test]
    fn parse_framework() {
        assert_eq!(Framework::from_name("arduino").unwrap(), Framework::Arduino);
        assert_eq!(Framework::from_name("CMSIS").unwrap(), Framework::Cmsis);
        assert!(matches!(
            Framework::from_name("atmelstart"),
            Err(ConfigError::UnknownFramework(name)) if name == "atmelstart"
        ));
    }

    #[test]
    fn baremetal() {
        let dir = tempfile::tempdir().unwrap();
        let board = test_board("zero");
        let packages = BTreeMap::new();

        let layers =
            framework_layers(Framework::Baremetal, &context(&board, &packages, dir.path()))
                .unwrap();
        let names = layers.layers.iter().map(|l| l.name()).collect::<Vec<_>>();
        assert_eq!(names, ["bare", "arch", "board"]);

        let config = compose(&layers.layers);
        assert_eq!(config.progname, "firmware");
        assert_eq!(config.ldscript_path, None);
        assert!(config.ccflags.contains(&"-mcpu=cortex-m0plus".to_owned()));
        assert!(config.linkflags.contains(&"--specs=nano.specs".to_owned()));
        assert_eq!(config.libs, ["c", "gcc", "m"]);
        assert!(config.cppdefines.contains(&Define::value("F_CPU", "48000000L")));
        assert!(config.cppdefines.contains(&Define::flag("ARDUINO_SAMD_ZERO")));
        assert!(layers.sources.is_empty());
    }

    #[test]
    fn cmsis_with_offset() {
        let dir = tempfile::tempdir().unwrap();
        let packages = fake_packages(dir.path());
        let board = test_board("zero");

        let layers =
            framework_layers(Framework::Cmsis, &context(&board, &packages, dir.path())).unwrap();
        let config = compose(&layers.layers);

        let ldscript = config.ldscript_path.unwrap();
        assert_eq!(ldscript, dir.path().join("ldscripts/samd21g18a_flash_0x2000.ld"));
        assert!(fs::read_to_string(&ldscript)
            .unwrap()
            .contains("ORIGIN = 0x00000000+0x2000, LENGTH = 0x00040000-0x2000"));

        assert!(config.cpppath.contains(
            &dir.path()
                .join("framework-cmsis/variants/atmelsam/samd21a/include")
        ));
        assert_eq!(layers.sources[0].name, "FrameworkCMSISVariant");
        assert!(layers.sources[0].archive.is_none());
    }

    #[test]
    fn cmsis_missing_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let packages = fake_packages(dir.path());

        let mut board = test_board("zero");
        board.build.mcu = "samd51j19a".into();
        assert!(matches!(
            framework_layers(Framework::Cmsis, &context(&board, &packages, dir.path())),
            Err(ConfigError::MissingVariantDir { .. })
        ));

        // The variant exists but there is no linker script for it
        let board = test_board("due");
        assert!(matches!(
            framework_layers(Framework::Cmsis, &context(&board, &packages, dir.path())),
            Err(ConfigError::MissingLinkerScript { .. })
        ));

        let mut board = test_board("zero");
        board.build.mcu = "totallyFakeMcu9000".into();
        assert!(matches!(
            framework_layers(Framework::Cmsis, &context(&board, &packages, dir.path())),
            Err(ConfigError::UnknownMcu(mcu)) if mcu == "totallyFakeMcu9000"
        ));
    }

    #[test]
    fn board_ldscript_wins() {
        let dir = tempfile::tempdir().unwrap();
        let packages = fake_packages(dir.path());

        // Not even a template is needed then
        let mut board = test_board("due");
        board.build.ldscript = Some("custom.ld".into());

        let layers =
            framework_layers(Framework::Cmsis, &context(&board, &packages, dir.path())).unwrap();
        let config = compose(&layers.layers);
        assert_eq!(config.ldscript_path, Some(dir.path().join("custom.ld")));
    }

    #[test]
    fn arduino_samd() {
        let dir = tempfile::tempdir().unwrap();
        let packages = fake_packages(dir.path());
        let board = test_board("zeroUSB");

        let layers =
            framework_layers(Framework::Arduino, &context(&board, &packages, dir.path()))
                .unwrap();
        let names = layers.layers.iter().map(|l| l.name()).collect::<Vec<_>>();
        assert_eq!(names, ["bare", "arch", "arduino-samd", "board"]);

        let config = compose(&layers.layers);
        let framework = dir.path().join("framework-arduino-samd");

        assert_eq!(
            config.ldscript_path,
            Some(PathBuf::from("flash_with_bootloader.ld"))
        );
        assert!(config.libpath.contains(
            &framework.join("variants/arduino_zero/linker_scripts/gcc")
        ));
        assert_eq!(
            &config.libs[..3],
            [
                dir.path().join("libFrameworkArduinoVariant.a").display().to_string(),
                dir.path().join("libFrameworkArduino.a").display().to_string(),
                "arm_cortexM0l_math".to_owned(),
            ]
        );
        assert!(config.cppdefines.contains(&Define::value("ARDUINO", 10805)));
        assert!(config.cppdefines.contains(&Define::value("USB_VID", "0x2341")));
        assert!(config
            .cppdefines
            .contains(&Define::value("USB_PRODUCT", "\"Arduino Zero\"")));
        assert!(config
            .cppdefines
            .contains(&Define::value("USB_MANUFACTURER", "\"Arduino\"")));
        assert!(!config.ccflags.iter().any(|f| f.starts_with("-mfloat-abi")));
        assert_eq!(
            layers.sources.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            ["FrameworkArduinoVariant", "FrameworkArduino"]
        );
    }

    #[test]
    fn arduino_adafruit_m4() {
        let dir = tempfile::tempdir().unwrap();
        let packages = fake_packages(dir.path());
        let board = test_board("adafruit_feather_m4");

        let layers =
            framework_layers(Framework::Arduino, &context(&board, &packages, dir.path()))
                .unwrap();
        let config = compose(&layers.layers);

        assert_eq!(&config.ccflags[..2], ["-mfloat-abi=hard", "-mfpu=fpv4-sp-d16"]);
        assert_eq!(&config.linkflags[..2], ["-mfloat-abi=hard", "-mfpu=fpv4-sp-d16"]);
        assert_eq!(&config.asflags[2..4], ["-mfloat-abi=hard", "-mfpu=fpv4-sp-d16"]);
        assert!(config.libs.contains(&"arm_cortexM4lf_math".to_owned()));
        assert!(config.ccflags.contains(&"-Wno-expansion-to-defined".to_owned()));
        assert!(config.cppdefines.contains(&Define::value("USB_CONFIG_POWER", 100)));
        assert!(config.cpppath.contains(
            &dir.path()
                .join("framework-arduino-samd-adafruit/cores/arduino/TinyUSB")
        ));
        // The board's extra flags come last
        assert_eq!(config.ccflags.last().unwrap(), "-mfpu=fpv4-sp-d16");
    }

    #[test]
    fn arduino_sam() {
        let dir = tempfile::tempdir().unwrap();
        let packages = fake_packages(dir.path());
        let board = test_board("due");

        let layers =
            framework_layers(Framework::Arduino, &context(&board, &packages, dir.path()))
                .unwrap();
        let config = compose(&layers.layers);
        let system = dir.path().join("framework-arduino-sam/system");

        assert!(config
            .cpppath
            .contains(&system.join("CMSIS/Device/ATMEL/sam3xa/include")));
        assert!(config.libs.contains(&"sam_sam3x8e_gcc_rel".to_owned()));
        assert!(config.linkflags.contains(&"-Wl,--entry=Reset_Handler".to_owned()));
        assert!(config
            .libpath
            .contains(&dir.path().join("framework-arduino-sam/variants/arduino_due_x")));
        assert_eq!(config.ldscript_path, Some(PathBuf::from("flash.ld")));
    }

    #[test]
    fn arduino_core_of_unlisted_mcu() {
        let mut board = test_board("zeroUSB");
        board.build.mcu = "samc21e18a".into();
        assert_eq!(ArduinoCore::of(&board).unwrap(), ArduinoCore::Samd);

        board.build.core = "adafruit".into();
        assert_eq!(ArduinoCore::of(&board).unwrap(), ArduinoCore::SamdAdafruit);

        assert_eq!(ArduinoCore::of(&test_board("due")).unwrap(), ArduinoCore::Sam);

        board.build.system = Some("avr".into());
        assert!(matches!(
            ArduinoCore::of(&board),
            Err(ConfigError::UnknownFramework(name)) if name == "arduino-avr"
        ));
    }

    #[test]
    fn arduino_missing_package() {
        let dir = tempfile::tempdir().unwrap();
        let mut packages = fake_packages(dir.path());
        packages.remove("framework-cmsis-atmel");
        let board = test_board("zeroUSB");

        assert!(matches!(
            framework_layers(Framework::Arduino, &context(&board, &packages, dir.path())),
            Err(ConfigError::MissingPackage(name)) if name == "framework-cmsis-atmel"
        ));
    }

    #[test]
    fn project_variants_dir() {
        let dir = tempfile::tempdir().unwrap();
        let packages = fake_packages(dir.path());
        fs::create_dir_all(dir.path().join("project/variants/my_board")).unwrap();

        let mut board = test_board("zeroUSB");
        board.build.variants_dir = Some("variants".into());
        board.build.variant = Some("my_board".into());

        let project = dir.path().join("project");
        let ctx = FrameworkContext {
            project_dir: &project,
            ..context(&board, &packages, dir.path())
        };
        let layers = framework_layers(Framework::Arduino, &ctx).unwrap();

        assert_eq!(
            layers.sources[0].src_dir,
            dir.path().join("project/variants/my_board")
        );

        board.build.variant = Some("missing".into());
        let ctx = FrameworkContext {
            project_dir: &project,
            ..context(&board, &packages, dir.path())
        };
        assert!(matches!(
            framework_layers(Framework::Arduino, &ctx),
            Err(ConfigError::MissingVariantDir { .. })
        ));
    }
}
