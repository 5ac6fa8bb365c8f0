//! MCU family resolution.
//!
//! An MCU identifier (`samd21g18a`, `at91sam3x8e`, ...) is resolved to the key of the
//! device family that owns its variant directory and CMSIS headers. Two kinds of
//! tables exist: an ordered list of pattern rules where the first match wins, and a
//! flat table of exact identifiers. Each vendor dataset uses one of them.

use std::collections::BTreeMap;

use log::debug;
use regex::Regex;

use crate::error::ConfigError;

/// One pattern rule of a [`FamilyTable::Rules`] table.
#[derive(Debug, Clone)]
pub struct FamilyRule {
    key: String,
    pattern: Regex,
    exclude: Option<Regex>,
}

impl FamilyRule {
    /// Create a rule matching `pattern` (a regular expression anchored by the caller).
    ///
    /// ### Panics
    /// If `pattern` is not a valid regular expression.
    pub fn new(key: impl Into<String>, pattern: &str) -> Self {
        Self {
            key: key.into(),
            pattern: Regex::new(pattern).unwrap(),
            exclude: None,
        }
    }

    /// Reject identifiers matching `pattern` even when the main pattern matches.
    ///
    /// Used where a broad family leaves a suffix to a more specific sub-family.
    ///
    /// ### Panics
    /// If `pattern` is not a valid regular expression.
    pub fn excluding(mut self, pattern: &str) -> Self {
        self.exclude = Some(Regex::new(pattern).unwrap());
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this rule claims the (already lowercased) `mcu`.
    pub fn matches(&self, mcu: &str) -> bool {
        self.pattern.is_match(mcu)
            && !self
                .exclude
                .as_ref()
                .map(|exclude| exclude.is_match(mcu))
                .unwrap_or(false)
    }
}

/// A family lookup table.
#[derive(Debug, Clone)]
pub enum FamilyTable {
    /// Rules evaluated in declaration order; the first matching rule wins.
    Rules(Vec<FamilyRule>),
    /// Full identifier to family key.
    Exact(BTreeMap<String, String>),
}

impl FamilyTable {
    /// Build an exact-match table from `(identifier, key)` pairs.
    pub fn exact<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self::Exact(
            entries
                .into_iter()
                .map(|(mcu, key)| (mcu.to_lowercase(), key.to_owned()))
                .collect(),
        )
    }

    /// Resolve `mcu` to its family key.
    ///
    /// Matching is case-insensitive. An identifier that no rule or entry claims is a
    /// fatal [`ConfigError::UnknownMcu`].
    pub fn resolve(&self, mcu: &str) -> Result<&str, ConfigError> {
        let normalized = mcu.trim().to_lowercase();

        let key = match self {
            Self::Rules(rules) => rules
                .iter()
                .find(|rule| rule.matches(&normalized))
                .map(FamilyRule::key),
            Self::Exact(table) => table.get(&normalized).map(String::as_str),
        };

        match key {
            Some(key) => {
                debug!("MCU '{}' belongs to family '{}'", mcu, key);
                Ok(key)
            }
            None => Err(ConfigError::UnknownMcu(mcu.to_owned())),
        }
    }
}

/// The family rules of the CMSIS variant packages.
///
/// Order matters: where a broad pattern would also claim a sub-family's identifiers,
/// the broad rule excludes them explicitly and the sub-family is listed first.
pub fn cmsis_families() -> FamilyTable {
    let rule = FamilyRule::new;

    FamilyTable::Rules(vec![
        rule("sam3a", r"^sam3a.*$"),
        rule("sam3n", r"^sam3n.*$"),
        rule("sam3sd8", r"^sam3sd?[8].?$"),
        rule("sam3s", r"^sam3s.*$").excluding(r"^sam3s.*8"),
        rule("sam3x", r"^(at91)?sam3x.*$"),
        rule("sam3u", r"^sam3u.*$"),
        rule("sam4c32", r"^sam4c32.*$"),
        rule("sam4cm32", r"^sam4cm.*32.*$"),
        rule("sam4cm", r"^sam4cm.*$").excluding(r"^sam4cm.*3"),
        rule("sam4cp", r"^sam4cp.*$"),
        rule("sam4c", r"^sam4c.*$").excluding(r"^sam4c.*[mp3]"),
        rule("sam4e", r"^sam4e(.*[ce])?$"),
        rule("sam4ecb", r"^sam4e\d+cb$"),
        rule("sam4l4", r"^sam4l[cs][24][abc]$"),
        rule("sam4l8", r"^sam4l[cs]8[abc]$"),
        rule("sam4n", r"^sam4n.*$"),
        rule("sam4sp", r"^sam4sp.*$"),
        rule("sam4s", r"^sam4s.*$").excluding(r"^sam4s.*p"),
        rule("samb11", r"^samb11$"),
        rule("samc20n", r"^samc20n.*$"),
        rule("samc20", r"^samc20.*$").excluding(r"^samc20.*n"),
        rule("samc21n", r"^samc21n.*$"),
        rule("samc21", r"^samc21.*$").excluding(r"^samc21.*n"),
        rule("samd09", r"^samd09.*$"),
        rule("samd10", r"^samd10.*$"),
        rule("samd11", r"^samd11.*$"),
        rule("samd20b", r"^samd20.*b$"),
        rule("samd20", r"^samd20.*$").excluding(r"^samd20.*b"),
        rule("samd21a", r"^samd21.1[5678].*au?$"),
        rule("samd21b", r"^samd21.*bu$"),
        rule("samd21c", r"^samd21.1[56].*$"),
        rule("samd21d", r"^samd21.17.*$"),
        rule("samd51a", r"^samd51.*$"),
        rule("samda1", r"^samda1.*a$"),
        rule("samda1b", r"^samda1.*b$"),
        rule("same51", r"^same51.*$"),
        rule("same53", r"^same53.*$"),
        rule("same54", r"^same54.*$"),
        rule("same70b", r"^same70.*b$"),
        rule("same70a", r"^same70.*$").excluding(r"^same70.*b"),
        rule("samg51", r"^samg51.*$"),
        rule("samg53", r"^samg53.*$"),
        rule("samg54", r"^samg54.*$"),
        rule("samg55", r"^samg55.*$"),
        rule("samha1a", r"^samha1.*a$"),
        rule("samha1ab", r"^samha1.*b$"),
        rule("saml10", r"^saml10.*$"),
        rule("saml11", r"^saml11.*$"),
        rule("saml21a1", r"^saml21.*a$"),
        rule("saml21b", r"^saml21.*bu?$"),
        rule("saml22", r"^saml22.*$"),
        rule("samr21", r"^samr21.*$"),
        rule("samr30", r"^samr30.*$"),
        rule("samr34", r"^samr34.*$"),
        rule("samr35", r"^samr35.*$"),
        rule("sams70b", r"^sams70.*b$"),
        rule("sams70a", r"^sams70.+$").excluding(r"^sams70.*b"),
        rule("samv70b", r"^samv70.*b$"),
        rule("samv70", r"^samv70.+$").excluding(r"^samv70.*b"),
        rule("samv71b", r"^samv71.*b$"),
        rule("samv71", r"^samv71.+$").excluding(r"^samv71.*b"),
    ])
}

/// The device families of the Arduino cores, keyed by exact MCU identifier.
///
/// The key names the CMSIS-Atmel device directory (`CMSIS/Device/ATMEL/<key>`) and
/// decides between the `sam` and `samd` Arduino systems. Its granularity differs from
/// [`cmsis_families`] for the same silicon.
pub fn arduino_families() -> FamilyTable {
    FamilyTable::exact([
        ("at91sam3x8e", "sam3xa"),
        ("at91sam3x8h", "sam3xa"),
        ("sam3x8e", "sam3xa"),
        ("samc21g18a", "samc21"),
        ("samc21j18a", "samc21"),
        ("samd09c13a", "samd09"),
        ("samd09d14a", "samd09"),
        ("samd10d14am", "samd10"),
        ("samd11c14a", "samd11"),
        ("samd11d14am", "samd11"),
        ("samd11d14as", "samd11"),
        ("samd21e15a", "samd21"),
        ("samd21e16b", "samd21"),
        ("samd21e17a", "samd21"),
        ("samd21e18a", "samd21"),
        ("samd21g16b", "samd21"),
        ("samd21g17a", "samd21"),
        ("samd21g18a", "samd21"),
        ("samd21g18au", "samd21"),
        ("samd21j18a", "samd21"),
        ("samd51g19a", "samd51"),
        ("samd51j19a", "samd51"),
        ("samd51j20a", "samd51"),
        ("samd51n19a", "samd51"),
        ("samd51p19a", "samd51"),
        ("samd51p20a", "samd51"),
        ("same51j19a", "same51"),
        ("same53j20a", "same53"),
        ("same54p20a", "same54"),
        ("saml21e18b", "saml21"),
        ("saml21g18b", "saml21"),
        ("saml21j18b", "saml21"),
        ("saml22n18a", "saml22"),
        ("samr21e18a", "samr21"),
        ("samr21g18a", "samr21"),
        ("samr34j18b", "samr34"),
    ])
}
