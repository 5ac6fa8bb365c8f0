//! Linker script lookup and flash offset patching.
//!
//! Boards whose bootloader lives at the start of flash link the application at an
//! offset. Instead of shipping one linker script per offset, the flash memory region
//! of the stock script is rewritten:
//!
//! ```text
//! rom (rx) : ORIGIN = 0x00000000, LENGTH = 0x00040000
//! rom (rx) : ORIGIN = 0x00000000+0x2000, LENGTH = 0x00040000-0x2000
//! ```
//!
//! The arithmetic is left to the linker. Patched scripts are written next to each
//! other under names keyed by script and offset, and are only rewritten when their
//! content changes.

use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, info};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::error::ConfigError;
use crate::fs::write_file_if_different;

const FLASH_REGION: &str = r"(?mi)^(?P<origin>[ \t]*(?:rom|flash)\w*[ \t]*(?:\([^)\r\n]*\))?[ \t]*:[ \t]*(?:origin|org|o)[ \t]*=[^,\r\n]+?)(?P<sep>[ \t]*,[ \t]*(?:length|len|l)[ \t]*=)(?P<length>[^\r\n]+?)(?P<tail>[ \t]*(?:/\*[^\r\n]*)?\r?)$";

static FLASH_REGION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(FLASH_REGION).unwrap());

/// A flash offset address as written in a board manifest, e.g. `0x2000`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashOffset {
    text: String,
    value: u64,
}

impl FlashOffset {
    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0
    }

    /// The offset exactly as it was written.
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl FromStr for FlashOffset {
    type Err = ConfigError;

    /// Parse an integer with an optional `0x`, `0o` or `0b` radix prefix. A leading
    /// `0` followed by more digits is octal, as in C.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let lower = text.to_lowercase();

        let (digits, radix) = if let Some(hex) = lower.strip_prefix("0x") {
            (hex, 16)
        } else if let Some(oct) = lower.strip_prefix("0o") {
            (oct, 8)
        } else if let Some(bin) = lower.strip_prefix("0b") {
            (bin, 2)
        } else if lower.len() > 1 && lower.starts_with('0') {
            (&lower[1..], 8)
        } else {
            (lower.as_str(), 10)
        };

        u64::from_str_radix(digits, radix)
            .map(|value| Self {
                text: text.to_owned(),
                value,
            })
            .map_err(|_| ConfigError::InvalidOffset(s.to_owned()))
    }
}

impl fmt::Display for FlashOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// A stock linker script for one MCU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkerScriptTemplate {
    /// The MCU part of the file name, e.g. `samd21g18a`.
    pub name: String,
    pub path: PathBuf,
}

/// Lookup of `<mcu>_flash.ld` templates and the directory patched scripts go to.
#[derive(Debug, Clone)]
pub struct LinkerScripts {
    template_dir: PathBuf,
    output_dir: PathBuf,
}

impl LinkerScripts {
    pub fn new(template_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            template_dir: template_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn template_dir(&self) -> &Path {
        &self.template_dir
    }

    /// Find the template for `mcu`.
    ///
    /// A leading `at91` is not part of script names.
    pub fn resolve(&self, mcu: &str) -> Result<LinkerScriptTemplate, ConfigError> {
        let lower = mcu.to_lowercase();
        let name = lower.strip_prefix("at91").unwrap_or(&lower).to_owned();
        let path = self.template_dir.join(format!("{}_flash.ld", name));

        if !path.is_file() {
            return Err(ConfigError::MissingLinkerScript {
                mcu: mcu.to_owned(),
                path,
            });
        }

        debug!("Linker script template for '{}': {}", mcu, path.display());

        Ok(LinkerScriptTemplate { name, path })
    }

    /// The path a script patched for `offset` is written to.
    pub fn patched_path(&self, name: &str, offset: &FlashOffset) -> PathBuf {
        self.output_dir
            .join(format!("{}_flash_{}.ld", name, offset.as_str()))
    }

    /// Return a linker script with the flash region moved by `offset`.
    ///
    /// Without an offset, or with a zero one, the template path is returned and the
    /// filesystem is not touched.
    pub fn apply_offset(
        &self,
        template: &LinkerScriptTemplate,
        offset: Option<&FlashOffset>,
    ) -> Result<PathBuf, ConfigError> {
        let offset = match offset {
            Some(offset) if !offset.is_zero() => offset,
            _ => return Ok(template.path.clone()),
        };

        let content =
            fs::read_to_string(&template.path).map_err(ConfigError::io(&template.path))?;

        let patched = patch_flash_region(&content, offset.as_str()).ok_or_else(|| {
            ConfigError::MissingFlashRegion {
                path: template.path.clone(),
                offset: offset.to_string(),
            }
        })?;

        let patched_path = self.patched_path(&template.name, offset);

        if write_file_if_different(&patched_path, patched.as_bytes())
            .map_err(ConfigError::io(&patched_path))?
        {
            info!(
                "Generated linker script {} (flash offset {})",
                patched_path.display(),
                offset
            );
        } else {
            debug!("Linker script {} is up to date", patched_path.display());
        }

        Ok(patched_path)
    }
}

/// Rewrite the first ROM/flash memory region of `content` to start `offset` bytes
/// later and be `offset` bytes shorter.
///
/// Returns `None` if there is no such region. Everything but that one line is
/// returned unchanged.
pub fn patch_flash_region(content: &str, offset: &str) -> Option<String> {
    if !FLASH_REGION_RE.is_match(content) {
        return None;
    }

    let patched = FLASH_REGION_RE.replace(content, |caps: &Captures| {
        format!(
            "{}+{}{}{}-{}{}",
            &caps["origin"], offset, &caps["sep"], &caps["length"], offset, &caps["tail"]
        )
    });

    Some(match patched {
        Cow::Borrowed(unchanged) => unchanged.to_owned(),
        Cow::Owned(patched) => patched,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = "\
MEMORY
{
  rom      (rx)  : ORIGIN = 0x00000000, LENGTH = 0x00040000
  ram      (rwx) : ORIGIN = 0x20000000, LENGTH = 0x00008000
}

_stack_size = DEFINED(_stack_size) ? _stack_size : 0x2000;
";

    fn test_resource(name: &str) -> PathBuf {
        PathBuf::from(format!(
            "{}{}{}",
            env!("CARGO_MANIFEST_DIR"),
            "/tests/resources/ldscripts/",
            name
        ))
    }

    fn scripts_in(dir: &Path) -> LinkerScripts {
        fs::write(dir.join("samd21g18a_flash.ld"), SCRIPT).unwrap();
        LinkerScripts::new(dir, dir.join("out"))
    }

    #[test]
    fn parse_offsets() {
        assert_eq!("0x2000".parse::<FlashOffset>().unwrap().value(), 0x2000);
        assert_eq!("0X4000".parse::<FlashOffset>().unwrap().value(), 0x4000);
        assert_eq!("8192".parse::<FlashOffset>().unwrap().value(), 8192);
        assert_eq!("0b10".parse::<FlashOffset>().unwrap().value(), 2);
        assert!("0".parse::<FlashOffset>().unwrap().is_zero());
        assert!("0x0".parse::<FlashOffset>().unwrap().is_zero());
        assert!(matches!(
            "bootloader".parse::<FlashOffset>(),
            Err(ConfigError::InvalidOffset(_))
        ));
    }

    #[test]
    fn leading_zero_is_octal() {
        let offset = "010".parse::<FlashOffset>().unwrap();
        assert_eq!(offset.value(), 8);
        assert_eq!(offset.as_str(), "010");
        assert_eq!("020000".parse::<FlashOffset>().unwrap().value(), 0x2000);
        assert!("00".parse::<FlashOffset>().unwrap().is_zero());
        assert!(matches!(
            "08".parse::<FlashOffset>(),
            Err(ConfigError::InvalidOffset(s)) if s == "08"
        ));
    }

    #[test]
    fn patch_only_the_flash_region() {
        let patched = patch_flash_region(SCRIPT, "0x2000").unwrap();

        let original = SCRIPT.lines().collect::<Vec<_>>();
        let patched = patched.lines().collect::<Vec<_>>();
        assert_eq!(original.len(), patched.len());

        for (line, (before, after)) in original.iter().zip(&patched).enumerate() {
            if line == 2 {
                assert_eq!(
                    *after,
                    "  rom      (rx)  : ORIGIN = 0x00000000+0x2000, LENGTH = 0x00040000-0x2000"
                );
            } else {
                assert_eq!(before, after);
            }
        }
    }

    #[test]
    fn patch_keeps_comments_and_line_endings() {
        let script = "MEMORY\r\n{\r\n  FLASH (rx) : ORIGIN = 0x0, LENGTH = 256K /* app */\r\n  RAM (xrw) : ORIGIN = 0x20000000, LENGTH = 32K\r\n}\r\n";

        assert_eq!(
            patch_flash_region(script, "0x4000").unwrap(),
            "MEMORY\r\n{\r\n  FLASH (rx) : ORIGIN = 0x0+0x4000, LENGTH = 256K-0x4000 /* app */\r\n  RAM (xrw) : ORIGIN = 0x20000000, LENGTH = 32K\r\n}\r\n"
        );
    }

    #[test]
    fn patch_only_first_region() {
        let script = "rom (rx) : ORIGIN = 0x0, LENGTH = 0x1000\nrom2 (rx) : ORIGIN = 0x1000, LENGTH = 0x1000\n";

        assert_eq!(
            patch_flash_region(script, "0x100").unwrap(),
            "rom (rx) : ORIGIN = 0x0+0x100, LENGTH = 0x1000-0x100\nrom2 (rx) : ORIGIN = 0x1000, LENGTH = 0x1000\n"
        );
    }

    #[test]
    fn no_flash_region() {
        assert_eq!(
            patch_flash_region("ram (rwx) : ORIGIN = 0x20000000, LENGTH = 0x8000\n", "0x2000"),
            None
        );
    }

    #[test]
    fn resolve_strips_at91_prefix() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sam3x8e_flash.ld"), SCRIPT).unwrap();
        let scripts = LinkerScripts::new(dir.path(), dir.path());

        let template = scripts.resolve("AT91SAM3X8E").unwrap();
        assert_eq!(template.name, "sam3x8e");
        assert_eq!(template.path, dir.path().join("sam3x8e_flash.ld"));
    }

    #[test]
    fn missing_template_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = LinkerScripts::new(dir.path(), dir.path());

        let err = scripts.resolve("samd21g18a").unwrap_err();
        assert!(matches!(err, ConfigError::MissingLinkerScript { ref mcu, .. } if mcu == "samd21g18a"));
    }

    #[test]
    fn zero_offset_does_not_touch_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = scripts_in(dir.path());
        let template = scripts.resolve("samd21g18a").unwrap();

        let zero = "0".parse::<FlashOffset>().unwrap();
        assert_eq!(scripts.apply_offset(&template, Some(&zero)).unwrap(), template.path);
        assert_eq!(scripts.apply_offset(&template, None).unwrap(), template.path);

        assert!(!dir.path().join("out").exists());
        assert_eq!(fs::read_to_string(&template.path).unwrap(), SCRIPT);
    }

    #[test]
    fn offset_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = scripts_in(dir.path());
        let template = scripts.resolve("samd21g18a").unwrap();
        let offset = "0x2000".parse::<FlashOffset>().unwrap();

        let first = scripts.apply_offset(&template, Some(&offset)).unwrap();
        let first_content = fs::read(&first).unwrap();
        let second = scripts.apply_offset(&template, Some(&offset)).unwrap();

        assert_eq!(first, second);
        assert_eq!(first, dir.path().join("out").join("samd21g18a_flash_0x2000.ld"));
        assert_eq!(fs::read(&second).unwrap(), first_content);

        // The template itself is never rewritten
        assert_eq!(fs::read_to_string(&template.path).unwrap(), SCRIPT);

        let other = "0x4000".parse::<FlashOffset>().unwrap();
        let other = scripts.apply_offset(&template, Some(&other)).unwrap();
        assert_ne!(other, first);
    }

    #[test]
    fn offset_without_flash_region_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("samx_flash.ld"), "SECTIONS {}\n").unwrap();
        let scripts = LinkerScripts::new(dir.path(), dir.path());
        let template = scripts.resolve("samx").unwrap();

        let offset = "0x2000".parse::<FlashOffset>().unwrap();
        assert!(matches!(
            scripts.apply_offset(&template, Some(&offset)),
            Err(ConfigError::MissingFlashRegion { .. })
        ));
    }

    #[test]
    fn patch_stock_script() {
        let template = fs::read_to_string(test_resource("samd21g18a_flash.ld")).unwrap();
        let patched = patch_flash_region(&template, "0x2000").unwrap();

        let changed = template
            .lines()
            .zip(patched.lines())
            .filter(|(before, after)| before != after)
            .collect::<Vec<_>>();

        assert_eq!(changed.len(), 1);
        assert!(changed[0].1.contains("ORIGIN = 0x00000000+0x2000, LENGTH = 0x00040000-0x2000"));
    }
}
