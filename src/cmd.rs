//! Command building and running utilities.

use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::process::{self, Command, ExitStatus};

/// Error when trying to execute a command.
#[derive(Debug, thiserror::Error)]
pub enum CmdError {
    /// The command failed to start.
    #[error("command '{0}' failed to start")]
    NoRun(String, #[source] io::Error),
    /// The command exited unsucessfully (with non-zero exit status).
    #[error("command '{0}' exited with non-zero status code {1}")]
    Unsuccessful(String, i32),
    /// The command was terminated unexpectedly.
    #[error("command '{0}' was terminated unexpectedly")]
    Terminated(String),
}

impl CmdError {
    /// Convert a [`process::ExitStatus`] into a `Result<(), CmdError>`.
    pub fn status_into_result(status: ExitStatus, cmd: &Cmd) -> Result<(), Self> {
        if status.success() {
            Ok(())
        } else if let Some(code) = status.code() {
            Err(CmdError::Unsuccessful(cmd.to_string(), code))
        } else {
            Err(CmdError::Terminated(cmd.to_string()))
        }
    }
}

/// A wrapper over a [`std::process::Command`] that renders as a shell command line.
#[derive(Debug)]
pub struct Cmd {
    /// The actual [`std::process::Command`] wrapped.
    pub cmd: process::Command,
}

impl std::ops::Deref for Cmd {
    type Target = process::Command;

    fn deref(&self) -> &Self::Target {
        &self.cmd
    }
}

impl std::ops::DerefMut for Cmd {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.cmd
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = std::iter::once(self.cmd.get_program())
            .chain(self.cmd.get_args())
            .map(|word| {
                let word = word.to_string_lossy();
                match shlex::try_quote(&word) {
                    Ok(quoted) => quoted.into_owned(),
                    Err(_) => word.to_string(),
                }
            })
            .collect::<Vec<_>>();

        f.write_str(&words.join(" "))
    }
}

impl Cmd {
    /// Construct a new [`Cmd`] for launching `program` (see
    /// [`std::process::Command::new`]).
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            cmd: Command::new(program),
        }
    }

    /// Run the command to completion, inheriting stdio.
    ///
    /// A program that exits with an error or fails to start returns [`Err`].
    pub fn run(&mut self) -> Result<(), CmdError> {
        log::debug!("Running: {}", self);

        let status = self
            .cmd
            .status()
            .map_err(|e| CmdError::NoRun(self.to_string(), e))?;

        CmdError::status_into_result(status, self)
    }
}

/// Build a command using a given [`std::process::Command`] or [`Cmd`] and return it.
///
/// Every comma separated argument after the builder is added to the command's
/// arguments. Arguments after an `@`-sign specify collections of arguments
/// (specifically `impl IntoIterator<Item = impl AsRef<OsStr>`). The optional
/// `key=value` arguments after a semicolon are translated to calling the
/// `<key>` method with `value` as its arguments.
///
/// # Examples
/// ```
/// # use sambuild::{cmd::Cmd, cmd_build};
/// let port = ["--port", "/dev/ttyACM0"];
/// let mut cmd = Cmd::new("bossac");
/// let cmd = cmd_build!(cmd, @port, "--erase"; arg=("firmware.bin"));
/// ```
#[macro_export]
macro_rules! cmd_build {
    ($builder:ident $(, $(@$cmdargs:expr,)* $cmdarg:expr)* $(; $($k:ident = $v:tt),*)?) => {{
        $(
            $($builder .args($cmdargs);)*
            $builder .arg($cmdarg);
        )*
        $($($builder . $k $v;)*)?

        $builder
    }}
}

/// Create a new [`Cmd`] instance.
///
/// The first argument is the program to run, the rest works like [`cmd_build!`].
///
/// # Examples
/// ```
/// # use sambuild::cmd;
/// let args = ["-device", "ATSAMD21G18", "-if", "swd"];
/// let cmd = cmd!("JLinkExe", @args, "-autoconnect"; arg=("1"));
/// assert!(cmd.to_string().starts_with("JLinkExe"));
/// ```
#[macro_export]
macro_rules! cmd {
    ($cmd:expr $(, $(@$cmdargs:expr,)* $cmdarg:expr)* $(; $($k:ident = $v:tt),*)?) => {{
        let mut cmd = $crate::cmd::Cmd::new($cmd);
        $crate::cmd_build!(cmd $(, $(@$cmdargs,)* $cmdarg)* $(; $($k = $v),* )?)
    }};
}
