//! # Build and flash configuration for Atmel SAM microcontrollers
//!
//! Resolves a board (an MCU part number plus a vendor core) into everything an ARM
//! GCC build and upload needs:
//!
//! - the MCU family ([`family`]),
//! - a linker script, patched for a bootloader offset if needed ([`ldscript`]),
//! - compiler, assembler and linker flags composed from ordered layers ([`config`],
//!   [`frameworks`]),
//! - an upload plan for the board's protocol ([`upload`]),
//! - the `buildprog`, `size`, `upload` and `nobuild` targets ([`target`]).
//!
//! [`env::Environment`] ties them together.
//!
//! ```no_run
//! # use sambuild::{board::BoardDescriptor, env::{BuildOptions, Environment}};
//! # use sambuild::{frameworks::Framework, packages::PackagesDir};
//! let board = BoardDescriptor::from_json_file("boards/zeroUSB.json")?;
//! let packages = PackagesDir::new("/opt/packages");
//!
//! let configuration = Environment::new(board, Framework::Arduino, ".", &packages)
//!     .configure(&BuildOptions::default())?;
//! println!("{:?}", configuration.config.link_args());
//! # Ok::<(), sambuild::error::ConfigError>(())
//! ```

// Allows docs.rs to document any needed features for items (needs nightly rust).
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod board;
pub mod cmd;
pub mod config;
pub mod env;
pub mod error;
pub mod family;
pub mod frameworks;
pub mod fs;
pub mod ldscript;
pub mod packages;
pub mod target;
pub mod upload;
pub mod utils;
