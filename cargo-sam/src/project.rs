use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use log::debug;
use sambuild::board::BoardDescriptor;
use sambuild::env::{BuildOptions, Configuration, Environment};
use sambuild::frameworks::Framework;
use sambuild::packages::PackagesDir;
use sambuild::upload::UploadOptions;

#[derive(Args)]
pub struct ProjectOpts {
    /// The board manifest, as a path to a JSON file or a board id in `--boards-dir`
    #[clap(short, long, env = "SAMBUILD_BOARD")]
    board: String,

    /// Where board ids are looked up [default: <project-dir>/boards]
    #[clap(long)]
    boards_dir: Option<PathBuf>,

    /// The framework [possible values: baremetal, cmsis, arduino]
    #[clap(short, long, default_value = "arduino", parse(try_from_str = Framework::from_name))]
    framework: Framework,

    /// The project directory [default: the current directory]
    #[clap(long)]
    project_dir: Option<PathBuf>,

    /// The build directory [default: <project-dir>/build]
    #[clap(long)]
    build_dir: Option<PathBuf>,

    /// The directory holding the installed packages
    #[clap(long, env = "SAMBUILD_PACKAGES_DIR")]
    packages_dir: Option<PathBuf>,

    /// An explicit linker script
    #[clap(long)]
    ldscript: Option<PathBuf>,

    /// A project directory with custom board variants
    #[clap(long)]
    variants_dir: Option<PathBuf>,

    /// The program name [default: the framework's]
    #[clap(long)]
    progname: Option<String>,

    /// Extra build flags, e.g. `-DDEBUG -Iinclude`
    #[clap(long = "build-flags", allow_hyphen_values = true)]
    build_flags: Vec<String>,

    /// Include directories searched before all others
    #[clap(short = 'I', long = "include")]
    cpppath: Vec<PathBuf>,

    #[clap(flatten)]
    upload: UploadOpts,

    /// Upload verbosity; `SAMBUILD_VERBOSE` if not given
    #[clap(short, long, parse(from_occurrences))]
    verbose: u8,
}

#[derive(Args)]
pub struct UploadOpts {
    /// The upload protocol [default: the board's]
    #[clap(long)]
    upload_protocol: Option<String>,

    /// The serial port or probe address [default: detected]
    #[clap(short, long)]
    port: Option<String>,

    /// A custom upload command using `$SOURCE` and `$UPLOAD_PORT`
    #[clap(long, allow_hyphen_values = true)]
    upload_command: Option<String>,

    /// The upload speed [default: the board's]
    #[clap(long)]
    upload_speed: Option<u32>,
}

impl ProjectOpts {
    /// Resolve the configuration; any error here aborts before a tool is run.
    pub fn configure(self) -> Result<Configuration> {
        let project_dir = match &self.project_dir {
            Some(dir) => dir.clone(),
            None => env::current_dir()?,
        };

        let board = self.load_board(&project_dir)?;

        let Self {
            board: board_id,
            framework,
            build_dir,
            packages_dir,
            ldscript,
            variants_dir,
            progname,
            build_flags,
            cpppath,
            upload,
            verbose,
            ..
        } = self;

        let packages =
            PackagesDir::new(packages_dir.unwrap_or_else(|| project_dir.join("packages")));
        debug!("Packages root: {}", packages.root().display());

        let mut environment = Environment::new(board, framework, &project_dir, &packages);
        if let Some(build_dir) = build_dir {
            environment = environment.with_build_dir(build_dir);
        }

        let options = BuildOptions {
            ldscript,
            variants_dir,
            progname,
            build_flags,
            cpppath,
            upload: UploadOptions {
                protocol: upload.upload_protocol,
                port: upload.port,
                command: upload.upload_command,
                speed: upload.upload_speed,
            },
            verbose: (verbose > 0).then(|| verbose),
        };

        environment
            .configure(&options)
            .with_context(|| format!("Configuring board '{}' failed", board_id))
    }

    fn load_board(&self, project_dir: &std::path::Path) -> Result<BoardDescriptor> {
        let path = PathBuf::from(&self.board);

        let path = if path.is_file() {
            path
        } else {
            let boards_dir = self
                .boards_dir
                .clone()
                .unwrap_or_else(|| project_dir.join("boards"));
            let path = boards_dir.join(format!("{}.json", self.board));

            if !path.is_file() {
                bail!(
                    "Board '{}' is neither a manifest nor in '{}'",
                    self.board,
                    boards_dir.display()
                );
            }
            path
        };

        Ok(BoardDescriptor::from_json_file(&path)?)
    }
}
