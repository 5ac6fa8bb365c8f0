use std::str::FromStr;

use anyhow::Result;
use clap::{AppSettings, Parser, Subcommand};
use log::{info, LevelFilter};
use sambuild::target::TargetName;
use sambuild::upload::{SystemPorts, Uploader};

mod project;

#[derive(Parser)]
#[clap(global_setting = AppSettings::PropagateVersion)]
#[clap(global_setting = AppSettings::DeriveDisplayOrder)]
#[clap(version)]
#[clap(bin_name = "cargo")]
struct Opts {
    #[clap(subcommand)]
    sub_cmd: CargoSubCommand,
}

#[derive(Subcommand)]
enum CargoSubCommand {
    #[clap(subcommand)]
    Sam(CargoSamOpts),
}

#[derive(Subcommand)]
enum CargoSamOpts {
    /// Print the resolved configuration as JSON
    Config(project::ProjectOpts),
    /// Print the linker script path, patching it if needed
    Ldscript(project::ProjectOpts),
    /// Print or run the commands of build targets
    Targets(TargetsOpts),
    /// Build the image and upload it
    Upload(UploadOpts),
}

#[derive(clap::Args)]
struct TargetsOpts {
    /// The targets [possible values: buildprog, size, upload, nobuild] [default: buildprog, size]
    #[clap(parse(try_from_str = TargetName::from_str))]
    targets: Vec<TargetName>,

    /// Run the targets instead of printing their commands
    #[clap(long)]
    run: bool,

    #[clap(flatten)]
    project: project::ProjectOpts,
}

#[derive(clap::Args)]
struct UploadOpts {
    /// Upload the existing image without building it
    #[clap(long)]
    nobuild: bool,

    #[clap(flatten)]
    project: project::ProjectOpts,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .write_style_or("CARGO_SAM_LOG_STYLE", "Auto")
            .filter_or("CARGO_SAM_LOG", LevelFilter::Info.to_string()),
    )
    .target(env_logger::Target::Stderr)
    .format_indent(None)
    .format_module_path(false)
    .format_timestamp(None)
    .init();

    let CargoSubCommand::Sam(opts) = Opts::parse().sub_cmd;
    match opts {
        CargoSamOpts::Config(opts) => {
            let configuration = opts.configure()?;
            println!("{}", serde_json::to_string_pretty(&configuration)?);
        }
        CargoSamOpts::Ldscript(opts) => match opts.configure()?.ldscript() {
            Some(ldscript) => println!("{}", ldscript.display()),
            None => anyhow::bail!("No linker script is configured"),
        },
        CargoSamOpts::Targets(opts) => {
            let configuration = opts.project.configure()?;
            let graph = &configuration.targets;

            if opts.run {
                graph.run(&opts.targets, &mut Uploader::new(SystemPorts))?;
            } else {
                for target in graph.schedule(&opts.targets) {
                    println!("{}:", target);
                    for cmd in graph.commands(target) {
                        println!("    {}", cmd);
                    }
                }
            }
        }
        CargoSamOpts::Upload(opts) => {
            let configuration = opts.project.configure()?;

            let mut targets = vec![TargetName::Upload];
            if opts.nobuild {
                targets.insert(0, TargetName::Nobuild);
            }

            configuration
                .targets
                .run(&targets, &mut Uploader::new(SystemPorts))?;
            info!("Upload finished");
        }
    }

    Ok(())
}
