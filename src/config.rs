//! Layered build configuration.
//!
//! A build configuration is assembled from ordered [`ConfigLayer`]s: bare-metal
//! defaults, architecture defaults, vendor core defaults, board overrides and finally
//! user overrides. [`compose`] is the only place where their merge order is decided:
//!
//! - flag lists, library names, defines and search paths are accumulated in layer
//!   order; values a layer *prepends* go in front of everything accumulated so far,
//!   so among several prepending layers the most recent one ends up first;
//! - nothing is de-duplicated, flag order is preserved as given;
//! - scalars are replaced by later layers, but a value set explicitly is never
//!   replaced by a later default;
//! - assembler flags are derived from the final common C/C++ flags once all layers
//!   have been applied.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoEnumIterator};

/// Assembler flags are the common C/C++ flags behind this prefix.
pub const ASFLAGS_PREFIX: [&str; 2] = ["-x", "assembler-with-cpp"];

/// Program name used until a layer sets one.
pub const DEFAULT_PROGNAME: &str = "program";

/// A preprocessor define, `NAME` or `NAME=VALUE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Define {
    pub name: String,
    pub value: Option<String>,
}

impl Define {
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    pub fn value(name: impl Into<String>, value: impl ToString) -> Self {
        Self {
            name: name.into(),
            value: Some(value.to_string()),
        }
    }

    /// The compiler argument for this define.
    pub fn arg(&self) -> String {
        format!("-D{}", self)
    }
}

impl fmt::Display for Define {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={}", self.name, value),
            None => f.write_str(&self.name),
        }
    }
}

impl From<&str> for Define {
    /// Parse `NAME`, `NAME=VALUE` or the same with a leading `-D`.
    fn from(s: &str) -> Self {
        let s = s.strip_prefix("-D").unwrap_or(s);

        match s.split_once('=') {
            Some((name, value)) => Define::value(name, value),
            None => Define::flag(s),
        }
    }
}

impl FromStr for Define {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.into())
    }
}

/// Flag categories accumulated by [`compose`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Flags {
    /// C-only compiler flags.
    CFlags,
    /// Flags for both the C and C++ compilers; also the base of the assembler flags.
    CcFlags,
    /// C++-only compiler flags.
    CxxFlags,
    /// Linker flags.
    LinkFlags,
    /// Libraries to link, by name or path.
    Libs,
}

/// Search path categories accumulated by [`compose`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Paths {
    /// Header search paths.
    CppPath,
    /// Library search paths (also where linker scripts are looked up).
    LibPath,
    /// Directories searched for project library dependencies.
    LibSourceDirs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Values<T> {
    prepend: Vec<T>,
    append: Vec<T>,
}

impl<T> Default for Values<T> {
    fn default() -> Self {
        Self {
            prepend: Vec::new(),
            append: Vec::new(),
        }
    }
}

impl<T: Clone> Values<T> {
    fn apply_to(&self, acc: &mut Vec<T>) {
        if !self.prepend.is_empty() {
            acc.splice(0..0, self.prepend.iter().cloned());
        }
        acc.extend(self.append.iter().cloned());
    }

    fn is_empty(&self) -> bool {
        self.prepend.is_empty() && self.append.is_empty()
    }
}

/// Whether a scalar may be replaced by later layers' defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precedence {
    Default,
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Scalar<T> {
    value: T,
    precedence: Precedence,
}

impl<T: fmt::Debug> Scalar<T> {
    fn apply_to(&self, acc: &mut Option<Scalar<T>>, layer: &str, name: &str)
    where
        T: Clone,
    {
        match acc {
            Some(current)
                if current.precedence == Precedence::Explicit
                    && self.precedence == Precedence::Default =>
            {
                debug!(
                    "Layer '{}' keeps explicit {} {:?} instead of default {:?}",
                    layer, name, current.value, self.value
                );
            }
            _ => *acc = Some(self.clone()),
        }
    }
}

/// The contribution of one configuration layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigLayer {
    name: String,
    cflags: Values<String>,
    ccflags: Values<String>,
    cxxflags: Values<String>,
    linkflags: Values<String>,
    libs: Values<String>,
    cppdefines: Vec<Define>,
    cpppath: Values<PathBuf>,
    libpath: Values<PathBuf>,
    libsource_dirs: Values<PathBuf>,
    progname: Option<Scalar<String>>,
    ldscript_path: Option<Scalar<PathBuf>>,
}

impl ConfigLayer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn flags_mut(&mut self, flags: Flags) -> &mut Values<String> {
        match flags {
            Flags::CFlags => &mut self.cflags,
            Flags::CcFlags => &mut self.ccflags,
            Flags::CxxFlags => &mut self.cxxflags,
            Flags::LinkFlags => &mut self.linkflags,
            Flags::Libs => &mut self.libs,
        }
    }

    fn flags(&self, flags: Flags) -> &Values<String> {
        match flags {
            Flags::CFlags => &self.cflags,
            Flags::CcFlags => &self.ccflags,
            Flags::CxxFlags => &self.cxxflags,
            Flags::LinkFlags => &self.linkflags,
            Flags::Libs => &self.libs,
        }
    }

    fn paths_mut(&mut self, paths: Paths) -> &mut Values<PathBuf> {
        match paths {
            Paths::CppPath => &mut self.cpppath,
            Paths::LibPath => &mut self.libpath,
            Paths::LibSourceDirs => &mut self.libsource_dirs,
        }
    }

    fn paths(&self, paths: Paths) -> &Values<PathBuf> {
        match paths {
            Paths::CppPath => &self.cpppath,
            Paths::LibPath => &self.libpath,
            Paths::LibSourceDirs => &self.libsource_dirs,
        }
    }

    /// Add `values` after the flags accumulated by earlier layers.
    pub fn append<S: Into<String>>(
        &mut self,
        flags: Flags,
        values: impl IntoIterator<Item = S>,
    ) -> &mut Self {
        self.flags_mut(flags)
            .append
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Put `values` in front of the flags accumulated by earlier layers.
    pub fn prepend<S: Into<String>>(
        &mut self,
        flags: Flags,
        values: impl IntoIterator<Item = S>,
    ) -> &mut Self {
        self.flags_mut(flags)
            .prepend
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn append_paths<P: Into<PathBuf>>(
        &mut self,
        paths: Paths,
        values: impl IntoIterator<Item = P>,
    ) -> &mut Self {
        self.paths_mut(paths)
            .append
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Put `values` in front of the paths accumulated by earlier layers, so that
    /// they take priority over framework defaults.
    pub fn prepend_paths<P: Into<PathBuf>>(
        &mut self,
        paths: Paths,
        values: impl IntoIterator<Item = P>,
    ) -> &mut Self {
        self.paths_mut(paths)
            .prepend
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn define(&mut self, define: Define) -> &mut Self {
        self.cppdefines.push(define);
        self
    }

    pub fn defines(&mut self, defines: impl IntoIterator<Item = Define>) -> &mut Self {
        self.cppdefines.extend(defines);
        self
    }

    /// Add extra build flags, e.g. `-DFOO=1 -Iinclude -Os -Wl,--gc-sections -lm`.
    ///
    /// `-D` and `-I` arguments become defines and include paths. `-Wl,` options are
    /// link flags, `-L` and `-l` arguments are library paths and libraries. Everything
    /// else is a common C/C++ flag. The string is split with POSIX shell rules.
    pub fn build_flags(&mut self, flags: &str) -> &mut Self {
        let words = shlex::split(flags).unwrap_or_else(|| {
            warn!("Unbalanced quotes in build flags '{}'", flags);
            flags.split_whitespace().map(str::to_owned).collect()
        });

        let mut words = words.into_iter();
        while let Some(word) = words.next() {
            match word.as_str() {
                "-D" | "-I" | "-L" | "-l" => {
                    match words.next() {
                        Some(value) => self.build_flag(&format!("{}{}", word, value)),
                        None => self.append(Flags::CcFlags, [word.as_str()]),
                    };
                }
                _ => {
                    self.build_flag(&word);
                }
            }
        }

        self
    }

    fn build_flag(&mut self, word: &str) -> &mut Self {
        if word.starts_with("-D") {
            self.define(word.into())
        } else if let Some(path) = word.strip_prefix("-I") {
            self.append_paths(Paths::CppPath, [path])
        } else if let Some(path) = word.strip_prefix("-L") {
            self.append_paths(Paths::LibPath, [path])
        } else if let Some(lib) = word.strip_prefix("-l") {
            self.append(Flags::Libs, [lib])
        } else if word.starts_with("-Wl,") {
            self.append(Flags::LinkFlags, [word])
        } else {
            self.append(Flags::CcFlags, [word])
        }
    }

    /// Set the program name unless a previous layer set it explicitly.
    pub fn default_progname(&mut self, progname: impl Into<String>) -> &mut Self {
        self.progname = Some(Scalar {
            value: progname.into(),
            precedence: Precedence::Default,
        });
        self
    }

    /// Set the program name; later defaults will not replace it.
    pub fn progname(&mut self, progname: impl Into<String>) -> &mut Self {
        self.progname = Some(Scalar {
            value: progname.into(),
            precedence: Precedence::Explicit,
        });
        self
    }

    /// Set the linker script unless a previous layer set it explicitly.
    pub fn default_ldscript(&mut self, ldscript: impl Into<PathBuf>) -> &mut Self {
        self.ldscript_path = Some(Scalar {
            value: ldscript.into(),
            precedence: Precedence::Default,
        });
        self
    }

    /// Set the linker script; later defaults will not replace it.
    pub fn ldscript(&mut self, ldscript: impl Into<PathBuf>) -> &mut Self {
        self.ldscript_path = Some(Scalar {
            value: ldscript.into(),
            precedence: Precedence::Explicit,
        });
        self
    }

    /// Whether this layer contributes nothing.
    pub fn is_empty(&self) -> bool {
        Flags::iter().all(|f| self.flags(f).is_empty())
            && Paths::iter().all(|p| self.paths(p).is_empty())
            && self.cppdefines.is_empty()
            && self.progname.is_none()
            && self.ldscript_path.is_none()
    }
}

/// The result of [`compose`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposedConfig {
    pub asflags: Vec<String>,
    pub cflags: Vec<String>,
    pub ccflags: Vec<String>,
    pub cxxflags: Vec<String>,
    pub cppdefines: Vec<Define>,
    pub cpppath: Vec<PathBuf>,
    pub libpath: Vec<PathBuf>,
    pub libs: Vec<String>,
    pub linkflags: Vec<String>,
    pub libsource_dirs: Vec<PathBuf>,
    pub progname: String,
    pub ldscript_path: Option<PathBuf>,
}

/// Merge `layers` in order.
pub fn compose<'a>(layers: impl IntoIterator<Item = &'a ConfigLayer>) -> ComposedConfig {
    let mut cflags = Vec::new();
    let mut ccflags = Vec::new();
    let mut cxxflags = Vec::new();
    let mut linkflags = Vec::new();
    let mut libs = Vec::new();
    let mut cppdefines = Vec::new();
    let mut cpppath = Vec::new();
    let mut libpath = Vec::new();
    let mut libsource_dirs = Vec::new();
    let mut progname = None;
    let mut ldscript_path = None;

    for layer in layers {
        debug!("Applying configuration layer '{}'", layer.name);

        layer.cflags.apply_to(&mut cflags);
        layer.ccflags.apply_to(&mut ccflags);
        layer.cxxflags.apply_to(&mut cxxflags);
        layer.linkflags.apply_to(&mut linkflags);
        layer.libs.apply_to(&mut libs);
        cppdefines.extend(layer.cppdefines.iter().cloned());
        layer.cpppath.apply_to(&mut cpppath);
        layer.libpath.apply_to(&mut libpath);
        layer.libsource_dirs.apply_to(&mut libsource_dirs);

        if let Some(scalar) = &layer.progname {
            scalar.apply_to(&mut progname, &layer.name, "program name");
        }
        if let Some(scalar) = &layer.ldscript_path {
            scalar.apply_to(&mut ldscript_path, &layer.name, "linker script");
        }
    }

    // Only now are the common flags final
    let asflags = ASFLAGS_PREFIX
        .iter()
        .map(|s| s.to_string())
        .chain(ccflags.iter().cloned())
        .collect();

    ComposedConfig {
        asflags,
        cflags,
        ccflags,
        cxxflags,
        cppdefines,
        cpppath,
        libpath,
        libs,
        linkflags,
        libsource_dirs,
        progname: progname
            .map(|s| s.value)
            .unwrap_or_else(|| DEFAULT_PROGNAME.to_owned()),
        ldscript_path: ldscript_path.map(|s| s.value),
    }
}

impl ComposedConfig {
    fn preprocessor_args(&self) -> impl Iterator<Item = String> + '_ {
        self.cppdefines
            .iter()
            .map(Define::arg)
            .chain(self.cpppath.iter().map(|p| format!("-I{}", p.display())))
    }

    /// Arguments for compiling a C source.
    pub fn c_args(&self) -> Vec<String> {
        self.ccflags
            .iter()
            .chain(&self.cflags)
            .cloned()
            .chain(self.preprocessor_args())
            .collect()
    }

    /// Arguments for compiling a C++ source.
    pub fn cxx_args(&self) -> Vec<String> {
        self.ccflags
            .iter()
            .chain(&self.cxxflags)
            .cloned()
            .chain(self.preprocessor_args())
            .collect()
    }

    /// Arguments for assembling a (preprocessed) assembler source.
    pub fn asm_args(&self) -> Vec<String> {
        self.asflags
            .iter()
            .cloned()
            .chain(self.preprocessor_args())
            .collect()
    }

    /// Arguments for linking, without the object files.
    pub fn link_args(&self) -> Vec<String> {
        let mut args = self.linkflags.clone();

        if let Some(ldscript) = &self.ldscript_path {
            args.push("-T".into());
            args.push(ldscript.display().to_string());
        }

        args.extend(self.libpath.iter().map(|p| format!("-L{}", p.display())));

        if !self.libs.is_empty() {
            args.push("-Wl,--start-group".into());
            args.extend(self.libs.iter().map(|lib| lib_arg(lib)));
            args.push("-Wl,--end-group".into());
        }

        args
    }
}

fn lib_arg(lib: &str) -> String {
    if lib.starts_with('-') || lib.ends_with(".a") || Path::new(lib).components().count() > 1 {
        lib.to_owned()
    } else {
        format!("-l{}", lib)
    }
}
