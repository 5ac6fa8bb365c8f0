//! Configuration entry point.
//!
//! An [`Environment`] holds what a build is about (board, framework and where
//! things live) and turns it, together with the user's [`BuildOptions`], into a
//! [`Configuration`]: the composed flags, the linker script, the package selection
//! and the target graph with its upload plan.
//!
//! Every configuration error is fatal and returned before any external tool runs.

use std::env;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Serialize;

use crate::board::BoardDescriptor;
use crate::config::{compose, ComposedConfig, ConfigLayer, Paths};
use crate::error::ConfigError;
use crate::frameworks::{framework_layers, Framework, FrameworkContext, SourceSet};
use crate::packages::{self, select_packages, PackageLocator, PackageSelection};
use crate::target::TargetGraph;
use crate::upload::{self, UploadOptions};
use crate::utils::PathExt;

/// The environment variable the upload verbosity falls back to.
pub const VERBOSE_VAR: &str = "SAMBUILD_VERBOSE";

/// User overrides.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// An explicit linker script; frameworks then don't select one.
    pub ldscript: Option<PathBuf>,
    /// A project directory with custom board variants.
    pub variants_dir: Option<PathBuf>,
    pub progname: Option<String>,
    /// Extra build flags, parsed like the board's `build.extra_flags`.
    pub build_flags: Vec<String>,
    /// Include paths searched before all others.
    pub cpppath: Vec<PathBuf>,
    pub upload: UploadOptions,
    /// Upload verbosity; [`VERBOSE_VAR`] if not set.
    pub verbose: Option<u8>,
}

impl BuildOptions {
    pub fn verbosity(&self) -> u8 {
        self.verbose.unwrap_or_else(|| {
            env::var(VERBOSE_VAR)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(0)
        })
    }

    /// The layer applied on top of all framework layers.
    fn layer(&self, project_dir: &Path) -> ConfigLayer {
        let mut layer = ConfigLayer::new("user");

        for flags in &self.build_flags {
            layer.build_flags(flags);
        }
        layer.prepend_paths(
            Paths::CppPath,
            self.cpppath.iter().map(|p| p.abspath_relative_to(project_dir)),
        );

        if let Some(progname) = &self.progname {
            layer.progname(progname.as_str());
        }
        if let Some(ldscript) = &self.ldscript {
            layer.ldscript(ldscript.abspath_relative_to(project_dir));
        }

        layer
    }
}

/// A board, a framework and the directories a build uses.
pub struct Environment<'a> {
    pub board: BoardDescriptor,
    pub framework: Framework,
    pub project_dir: PathBuf,
    pub build_dir: PathBuf,
    pub packages: &'a dyn PackageLocator,
}

/// A resolved configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Configuration {
    /// The board with its default debug tools.
    pub board: BoardDescriptor,
    pub framework: Framework,
    pub packages: PackageSelection,
    pub config: ComposedConfig,
    pub sources: Vec<SourceSet>,
    pub targets: TargetGraph,
}

impl Configuration {
    pub fn ldscript(&self) -> Option<&Path> {
        self.config.ldscript_path.as_deref()
    }
}

impl<'a> Environment<'a> {
    pub fn new(
        board: BoardDescriptor,
        framework: Framework,
        project_dir: impl Into<PathBuf>,
        packages: &'a dyn PackageLocator,
    ) -> Self {
        let project_dir = project_dir.into();

        Self {
            build_dir: project_dir.join("build"),
            board,
            framework,
            project_dir,
            packages,
        }
    }

    pub fn with_build_dir(mut self, build_dir: impl Into<PathBuf>) -> Self {
        self.build_dir = build_dir.into();
        self
    }

    /// Resolve the configuration.
    pub fn configure(&self, options: &BuildOptions) -> Result<Configuration, ConfigError> {
        let mut board = self.board.with_default_debug_tools()?;
        if let Some(variants_dir) = &options.variants_dir {
            board.build.variants_dir = Some(variants_dir.clone());
        }

        let protocol = options.upload.protocol(&board);
        info!(
            "Configuring board '{}' ({}) with framework '{}', upload protocol '{}'",
            board.id,
            board.mcu(),
            self.framework,
            protocol
        );

        let packages = select_packages(&board, self.framework, protocol.name())?;
        for package in &packages.packages {
            if self.packages.package_dir(&package.name).is_none() {
                debug!("Package '{}' is not installed", package.name);
            }
        }

        let ctx = FrameworkContext {
            board: &board,
            packages: self.packages,
            project_dir: &self.project_dir,
            build_dir: &self.build_dir,
            ldscript_override: options.ldscript.as_deref(),
        };
        let mut framework = framework_layers(self.framework, &ctx)?;
        framework.layers.push(options.layer(&self.project_dir));

        let config = compose(&framework.layers);
        match &config.ldscript_path {
            Some(ldscript) => info!("Linker script: {}", ldscript.display()),
            None => warn!("No linker script selected; the link step has to provide one"),
        }
        debug!("Composed configuration: {:?}", config);

        let plan = upload::dispatch(
            &board,
            &options.upload,
            self.packages,
            &self.build_dir,
            options.verbosity(),
        )?;

        let toolchain = self.packages.package_dir(packages::TOOLCHAIN);
        let targets =
            TargetGraph::assemble(&config, plan, &self.build_dir, toolchain.as_deref());

        Ok(Configuration {
            board,
            framework: self.framework,
            packages,
            config,
            sources: framework.sources,
            targets,
        })
    }
}
