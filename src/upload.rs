//! Upload protocols.
//!
//! [`dispatch`] turns a board and the user's upload options into an [`UploadPlan`]:
//! the uploader executable, its argument templates and the actions that have to run
//! before it, e.g. resetting a board into its serial bootloader. Arguments may
//! contain two placeholders which are only known when the upload runs:
//!
//! - `$UPLOAD_PORT`: the serial port, after all pre-upload actions ran;
//! - `$SOURCE`: the firmware image.
//!
//! An [`Uploader`] executes a plan against a [`SerialPorts`] implementation.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use strum::{Display, EnumString};

use crate::board::BoardDescriptor;
use crate::cmd;
use crate::cmd::Cmd;
use crate::error::{ConfigError, UploadError};
use crate::packages::{self, PackageLocator};
use crate::utils::PathExt;

pub const PORT_PLACEHOLDER: &str = "$UPLOAD_PORT";
pub const SOURCE_PLACEHOLDER: &str = "$SOURCE";

/// How long [`UploadAction::WaitForNewPort`] waits for the bootloader's port.
pub const DEFAULT_PORT_TIMEOUT: Duration = Duration::from_secs(5);
/// How often [`UploadAction::WaitForNewPort`] scans the serial ports.
pub const DEFAULT_PORT_INTERVAL: Duration = Duration::from_millis(250);
/// Shorter scan intervals are raised to this.
const MIN_PORT_INTERVAL: Duration = Duration::from_millis(10);

/// An upload protocol, parsed from its kebab-case name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, EnumString, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(into = "String")]
pub enum Protocol {
    Openocd,
    AtmelIce,
    CmsisDap,
    Stlink,
    Blackmagic,
    SamBa,
    #[strum(serialize = "stk500v2")]
    Stk500v2,
    Jlink,
    Mbctool,
    Custom,
    /// A protocol nothing knows how to upload with.
    #[strum(default)]
    Unknown(String),
}

impl Protocol {
    pub fn name(&self) -> &str {
        match self {
            Self::Openocd => "openocd",
            Self::AtmelIce => "atmel-ice",
            Self::CmsisDap => "cmsis-dap",
            Self::Stlink => "stlink",
            Self::Blackmagic => "blackmagic",
            Self::SamBa => "sam-ba",
            Self::Stk500v2 => "stk500v2",
            Self::Jlink => "jlink",
            Self::Mbctool => "mbctool",
            Self::Custom => "custom",
            Self::Unknown(name) => name,
        }
    }

    /// Whether uploads go through a serial bootloader on the board.
    pub fn is_serial(&self) -> bool {
        matches!(self, Self::SamBa | Self::Stk500v2 | Self::Mbctool)
    }

    /// The image format the uploader takes.
    pub fn image(&self) -> ImageKind {
        match self {
            Self::Stk500v2 => ImageKind::Hex,
            Self::Blackmagic => ImageKind::Elf,
            _ => ImageKind::Bin,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<Protocol> for String {
    fn from(protocol: Protocol) -> Self {
        protocol.name().to_owned()
    }
}

/// The firmware image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Bin,
    Hex,
    Elf,
}

impl ImageKind {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Bin => "bin",
            Self::Hex => "hex",
            Self::Elf => "elf",
        }
    }
}

/// A step that runs before the uploader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UploadAction {
    /// Pick a port if none is configured, preferring one with the board's USB ids.
    AutodetectPort,
    /// Drain the port's input buffer and pulse DTR/RTS.
    FlushSerialBuffer,
    /// Remember the ports present now, for [`UploadAction::WaitForNewPort`].
    SnapshotPorts,
    /// Open and close the port at `baud`, which resets many bootloaders.
    TouchSerialPort { baud: u32 },
    /// Wait for a port that was not in the snapshot and upload to it instead.
    WaitForNewPort { timeout: Duration, interval: Duration },
    /// Use only the port's file name, e.g. `ttyACM0` for `/dev/ttyACM0`.
    StripPortPath,
    /// Write a helper file; its contents may use the placeholders.
    WriteFile { path: PathBuf, contents: String },
}

/// Everything needed to upload a firmware image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadPlan {
    pub protocol: Protocol,
    /// The uploader; `None` if the protocol is not supported.
    pub executable: Option<PathBuf>,
    /// Argument templates.
    pub args: Vec<String>,
    pub actions: Vec<UploadAction>,
    pub image: ImageKind,
    /// The configured port, if any.
    pub port: Option<String>,
    /// USB `(vid, pid)` pairs of the board, for port autodetection.
    pub hwids: Vec<(u16, u16)>,
}

impl UploadPlan {
    /// The arguments with the placeholders replaced.
    pub fn render_args(&self, port: Option<&str>, source: &Path) -> Result<Vec<String>, UploadError> {
        self.args
            .iter()
            .map(|arg| substitute(arg, port, source))
            .collect()
    }
}

fn substitute(template: &str, port: Option<&str>, source: &Path) -> Result<String, UploadError> {
    let mut result = template.replace(SOURCE_PLACEHOLDER, &source.display().to_string());

    if result.contains(PORT_PLACEHOLDER) {
        result = result.replace(PORT_PLACEHOLDER, port.ok_or(UploadError::NoPort)?);
    }

    Ok(result)
}

/// User settings for uploading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    /// Overrides the board's `upload.protocol`.
    pub protocol: Option<String>,
    pub port: Option<String>,
    /// A custom uploader command line; replaces the protocol's uploader.
    pub command: Option<String>,
    /// Overrides the board's `upload.speed`.
    pub speed: Option<u32>,
}

impl UploadOptions {
    /// The protocol to upload with: the user's choice, else the board's.
    pub fn protocol(&self, board: &BoardDescriptor) -> Protocol {
        let name = self
            .protocol
            .as_deref()
            .or_else(|| board.upload_protocol())
            .unwrap_or_default();

        // Parsing never fails, unknown names become `Protocol::Unknown`
        Protocol::from_str(name).unwrap_or_else(|_| Protocol::Unknown(name.to_owned()))
    }
}

/// Build the upload plan for `board`.
///
/// Missing board fields the protocol needs are fatal. An unknown protocol is not: it
/// only yields a plan that fails once it is run.
pub fn dispatch(
    board: &BoardDescriptor,
    options: &UploadOptions,
    packages: &dyn PackageLocator,
    build_dir: &Path,
    verbose: u8,
) -> Result<UploadPlan, ConfigError> {
    let protocol = options.protocol(board);

    let mut plan = UploadPlan {
        image: protocol.image(),
        protocol: protocol.clone(),
        executable: None,
        args: Vec::new(),
        actions: Vec::new(),
        port: options.port.clone(),
        hwids: board
            .build
            .hwids
            .iter()
            .filter_map(|[vid, pid]| Some((parse_hex_id(vid)?, parse_hex_id(pid)?)))
            .collect(),
    };

    if let Some(command) = &options.command {
        custom_command(&mut plan, command);
        return Ok(plan);
    }

    let mcu = board.mcu();

    match &protocol {
        Protocol::Openocd => {
            let scripts = tool_dir(packages, packages::TOOL_OPENOCD).join("scripts");
            let cfg = required(board, &board.upload.openocdcfg, "upload.openocdcfg")?;

            plan.executable = Some(tool(packages, packages::TOOL_OPENOCD, "bin/openocd"));
            plan.args = strings(["-s", &scripts.display().to_string(), "-f", cfg]);

            if board.id.contains("zero") {
                if let Some(framework_dir) = packages.package_dir(&packages::arduino_package(board)) {
                    let mut dir = framework_dir.join("variants");
                    if let Some(variant) = &board.build.variant {
                        dir.push(variant);
                    }
                    plan.args.push("-s".into());
                    plan.args.push(dir.join("openocd_scripts").display().to_string());
                }
            }

            plan.args.push("-c".into());
            plan.args.push(format!(
                "telnet_port disabled; program {{{}}} verify reset {}; shutdown",
                SOURCE_PLACEHOLDER,
                board.upload.section_start.as_deref().unwrap_or_default()
            ));
        }
        Protocol::AtmelIce | Protocol::CmsisDap | Protocol::Stlink => {
            let openocd_dir = tool_dir(packages, packages::TOOL_OPENOCD);

            // Manifest entries may only flag a probe as onboard
            let server = match board
                .debug
                .tools
                .get(protocol.name())
                .and_then(|tool| tool.server.clone())
            {
                Some(server) => server,
                None => board
                    .default_debug_tool(protocol.name())?
                    .server
                    .ok_or_else(|| ConfigError::MissingBoardField {
                        board: board.id.clone(),
                        field: "debug.tools",
                    })?,
            };

            plan.executable = Some(tool(packages, packages::TOOL_OPENOCD, "bin/openocd"));
            plan.args = server
                .arguments
                .iter()
                .map(|arg| arg.replace("$PACKAGE_DIR", &openocd_dir.display().to_string()))
                .collect();
            plan.args.push("-c".into());
            plan.args.push(format!(
                "program {{{}}} verify reset {}; shutdown",
                SOURCE_PLACEHOLDER,
                board.upload.offset_address.as_deref().unwrap_or_default()
            ));
        }
        Protocol::Blackmagic => {
            plan.executable = Some("arm-none-eabi-gdb".into());
            plan.args = strings([
                "-nx",
                "--batch",
                "-ex",
                "target extended-remote $UPLOAD_PORT",
                "-ex",
                "monitor swdp_scan",
                "-ex",
                "attach 1",
                "-ex",
                "load",
                "-ex",
                "compare-sections",
                "-ex",
                "kill",
                SOURCE_PLACEHOLDER,
            ]);
            if plan.port.is_none() {
                plan.actions.push(UploadAction::AutodetectPort);
            }
        }
        Protocol::SamBa => {
            plan.executable = Some(tool(packages, packages::TOOL_BOSSAC, "bossac"));
            if verbose > 0 {
                plan.args = strings(["--info", "--debug"]);
            }
            plan.args.extend(strings([
                "--port",
                PORT_PLACEHOLDER,
                "--erase",
                "--write",
                "--verify",
                "--reset",
                "-U",
                if board.upload.native_usb { "true" } else { "false" },
            ]));
            if mcu.contains("sam3x8e") {
                plan.args.push("--boot".into());
            }
            plan.args.push(SOURCE_PLACEHOLDER.into());
            plan.actions = serial_actions(board, plan.port.is_some(), true);
        }
        Protocol::Stk500v2 => {
            let conf = tool_dir(packages, packages::TOOL_AVRDUDE).join("avrdude.conf");
            let speed = options
                .speed
                .or(board.upload.speed)
                .ok_or_else(|| ConfigError::MissingBoardField {
                    board: board.id.clone(),
                    field: "upload.speed",
                })?;

            plan.executable = Some(tool(packages, packages::TOOL_AVRDUDE, "avrdude"));
            plan.args = strings([
                "-p",
                "atmega2560",
                "-C",
                &conf.display().to_string(),
                "-c",
                protocol.name(),
                "-P",
                PORT_PLACEHOLDER,
                "-b",
                &speed.to_string(),
                "-u",
                "-U",
                "flash:w:$SOURCE:i",
            ]);
            if verbose > 0 {
                plan.args.insert(0, "-v".into());
            }
            plan.actions = serial_actions(board, plan.port.is_some(), false);
        }
        Protocol::Jlink => {
            let device = required(board, &board.debug.jlink_device, "debug.jlink_device")?;
            let script = build_dir.join("upload.jlink");
            let offset = board
                .upload
                .offset_address
                .as_deref()
                .unwrap_or("0x0");

            plan.executable = Some(tool(
                packages,
                packages::TOOL_JLINK,
                if cfg!(windows) { "JLink.exe" } else { "JLinkExe" },
            ));
            plan.args = strings([
                "-device",
                device,
                "-speed",
                "4000",
                "-if",
                "swd",
                "-autoconnect",
                "1",
                "-CommanderScript",
                &script.display().to_string(),
            ]);
            plan.actions.push(UploadAction::WriteFile {
                path: script,
                contents: ["h", &format!("loadbin {}, {}", SOURCE_PLACEHOLDER, offset), "r", "q"]
                    .join("\n"),
            });
        }
        Protocol::Mbctool => {
            plan.executable = Some(tool(packages, packages::TOOL_MBCTOOL, "mbctool"));
            plan.args = strings([
                "--device",
                "samd",
                "--speed",
                "1500000",
                "--port",
                PORT_PLACEHOLDER,
                "--upload",
                SOURCE_PLACEHOLDER,
            ]);
            plan.actions = serial_actions(board, plan.port.is_some(), false);
        }
        Protocol::Custom => {
            warn!("Upload protocol 'custom' needs an upload command; uploads will fail");
        }
        Protocol::Unknown(name) => {
            warn!(
                "Unknown upload protocol '{}' for board '{}'; uploads will fail",
                name, board.id
            );
        }
    }

    if let Some(executable) = &plan.executable {
        info!("Upload tool: {} ({})", executable.display(), protocol);
    }
    debug!("Upload plan: {:?}", plan);

    Ok(plan)
}

fn custom_command(plan: &mut UploadPlan, command: &str) {
    let mut words = shlex::split(command)
        .unwrap_or_else(|| command.split_whitespace().map(str::to_owned).collect())
        .into_iter();

    plan.executable = words.next().map(PathBuf::from);
    plan.args = words.collect();

    if plan.port.is_none() && command.contains(PORT_PLACEHOLDER) {
        plan.actions.push(UploadAction::AutodetectPort);
    }

    info!("Custom upload command: {}", command);
}

/// The pre-upload sequence of serial bootloaders.
fn serial_actions(board: &BoardDescriptor, port_configured: bool, strip: bool) -> Vec<UploadAction> {
    let mut actions = Vec::new();

    if !port_configured {
        actions.push(UploadAction::AutodetectPort);
    }
    if !board.upload.disable_flushing {
        actions.push(UploadAction::FlushSerialBuffer);
    }
    actions.push(UploadAction::SnapshotPorts);
    if board.upload.use_1200bps_touch {
        actions.push(UploadAction::TouchSerialPort { baud: 1200 });
    }
    if board.upload.wait_for_upload_port {
        actions.push(UploadAction::WaitForNewPort {
            timeout: DEFAULT_PORT_TIMEOUT,
            interval: DEFAULT_PORT_INTERVAL,
        });
    }
    if strip {
        actions.push(UploadAction::StripPortPath);
    }

    actions
}

fn required<'a>(
    board: &BoardDescriptor,
    value: &'a Option<String>,
    field: &'static str,
) -> Result<&'a str, ConfigError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingBoardField {
            board: board.id.clone(),
            field,
        })
}

fn tool_dir(packages: &dyn PackageLocator, package: &str) -> PathBuf {
    packages.package_dir(package).unwrap_or_else(|| {
        warn!("Package '{}' is not installed", package);
        PathBuf::new()
    })
}

/// `executable` inside `package`, or just its name to be looked up in `PATH`.
fn tool(packages: &dyn PackageLocator, package: &str, executable: &str) -> PathBuf {
    packages
        .package_dir(package)
        .map(|dir| dir.join(executable))
        .filter(|path| path.is_file())
        .unwrap_or_else(|| executable.basename().into())
}

fn strings<'a>(args: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    args.into_iter().map(str::to_owned).collect()
}

fn parse_hex_id(id: &str) -> Option<u16> {
    let id = id.trim();
    let digits = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .unwrap_or(id);

    u16::from_str_radix(digits, 16).ok()
}

/// A serial port seen by [`SerialPorts::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    /// USB `(vid, pid)`, for USB ports.
    pub hwid: Option<(u16, u16)>,
}

/// Access to the serial ports of the host.
pub trait SerialPorts {
    fn list(&mut self) -> Result<Vec<PortInfo>, UploadError>;

    /// Discard pending input and pulse DTR/RTS.
    fn flush(&mut self, port: &str) -> Result<(), UploadError>;

    /// Open `port` at `baud` with DTR low and close it again.
    fn touch(&mut self, port: &str, baud: u32) -> Result<(), UploadError>;

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[cfg(feature = "serial")]
pub use self::system::SystemPorts;

#[cfg(feature = "serial")]
mod system {
    use std::thread;
    use std::time::Duration;

    use serialport::{ClearBuffer, SerialPortType};

    use super::{PortInfo, SerialPorts};
    use crate::error::UploadError;

    /// The host's serial ports, through the `serialport` crate.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SystemPorts;

    fn serial_error(port: &str) -> impl FnOnce(serialport::Error) -> UploadError + '_ {
        move |e| UploadError::Serial {
            port: port.to_owned(),
            message: e.to_string(),
        }
    }

    impl SerialPorts for SystemPorts {
        fn list(&mut self) -> Result<Vec<PortInfo>, UploadError> {
            let ports = serialport::available_ports().map_err(serial_error("*"))?;

            Ok(ports
                .into_iter()
                .map(|port| PortInfo {
                    hwid: match &port.port_type {
                        SerialPortType::UsbPort(usb) => Some((usb.vid, usb.pid)),
                        _ => None,
                    },
                    name: port.port_name,
                })
                .collect())
        }

        fn flush(&mut self, port: &str) -> Result<(), UploadError> {
            let mut serial = serialport::new(port, 9600)
                .timeout(Duration::from_millis(100))
                .open()
                .map_err(serial_error(port))?;

            serial.clear(ClearBuffer::Input).map_err(serial_error(port))?;
            serial
                .write_data_terminal_ready(false)
                .map_err(serial_error(port))?;
            serial.write_request_to_send(false).map_err(serial_error(port))?;
            thread::sleep(Duration::from_millis(100));
            serial
                .write_data_terminal_ready(true)
                .map_err(serial_error(port))?;
            serial.write_request_to_send(true).map_err(serial_error(port))?;

            Ok(())
        }

        fn touch(&mut self, port: &str, baud: u32) -> Result<(), UploadError> {
            let mut serial = serialport::new(port, baud)
                .timeout(Duration::from_millis(100))
                .open()
                .map_err(serial_error(port))?;

            serial
                .write_data_terminal_ready(false)
                .map_err(serial_error(port))?;
            drop(serial);

            thread::sleep(Duration::from_millis(400));

            Ok(())
        }
    }
}

/// Runs [`UploadPlan`]s.
#[derive(Debug)]
pub struct Uploader<P> {
    ports: P,
}

impl<P: SerialPorts> Uploader<P> {
    pub fn new(ports: P) -> Self {
        Self { ports }
    }

    pub fn ports(&mut self) -> &mut P {
        &mut self.ports
    }

    /// Run the plan's pre-upload actions and return the port to upload to.
    pub fn prepare(&mut self, plan: &UploadPlan, source: &Path) -> Result<Option<String>, UploadError> {
        let mut port = plan.port.clone();
        let mut snapshot = Vec::new();

        for action in &plan.actions {
            debug!("Upload action: {:?}", action);

            match action {
                UploadAction::AutodetectPort => {
                    if port.is_none() {
                        port = Some(self.autodetect(&plan.hwids)?);
                    }
                }
                UploadAction::FlushSerialBuffer => {
                    self.ports.flush(port.as_deref().ok_or(UploadError::NoPort)?)?
                }
                UploadAction::SnapshotPorts => {
                    snapshot = self.port_names()?;
                }
                UploadAction::TouchSerialPort { baud } => {
                    self.ports
                        .touch(port.as_deref().ok_or(UploadError::NoPort)?, *baud)?
                }
                UploadAction::WaitForNewPort { timeout, interval } => {
                    let new_port =
                        self.wait_for_new_port(port.as_deref(), snapshot.clone(), *timeout, *interval)?;
                    port = Some(new_port);
                }
                UploadAction::StripPortPath => {
                    if let Some(p) = &port {
                        if p.contains('/') {
                            port = Some(p.basename());
                        }
                    }
                }
                UploadAction::WriteFile { path, contents } => {
                    let contents = substitute(contents, port.as_deref(), source)?;
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent).map_err(|source| UploadError::Io {
                            path: parent.to_owned(),
                            source,
                        })?;
                    }
                    fs::write(path, contents).map_err(|source| UploadError::Io {
                        path: path.clone(),
                        source,
                    })?;
                }
            }
        }

        Ok(port)
    }

    /// The uploader command for `plan`, uploading `source` through `port`.
    pub fn command(
        &self,
        plan: &UploadPlan,
        port: Option<&str>,
        source: &Path,
    ) -> Result<Cmd, UploadError> {
        let executable = plan
            .executable
            .as_ref()
            .ok_or_else(|| UploadError::NoUploader(plan.protocol.to_string()))?;

        let executable = if executable.components().count() == 1 {
            which::which(executable).unwrap_or_else(|_| executable.clone())
        } else {
            executable.clone()
        };

        let args = plan.render_args(port, source)?;

        Ok(cmd!(executable; args=(args)))
    }

    /// Run the pre-upload actions and the uploader.
    pub fn upload(&mut self, plan: &UploadPlan, source: &Path) -> Result<(), UploadError> {
        if plan.executable.is_none() {
            return Err(UploadError::NoUploader(plan.protocol.to_string()));
        }

        let port = self.prepare(plan, source)?;
        let mut cmd = self.command(plan, port.as_deref(), source)?;

        info!("Uploading {} with {}", source.display(), cmd);

        cmd.run()?;

        Ok(())
    }

    fn port_names(&mut self) -> Result<Vec<String>, UploadError> {
        Ok(self.ports.list()?.into_iter().map(|p| p.name).collect())
    }

    fn autodetect(&mut self, hwids: &[(u16, u16)]) -> Result<String, UploadError> {
        let ports = self.ports.list()?;

        let port = ports
            .iter()
            .find(|p| p.hwid.map(|id| hwids.contains(&id)).unwrap_or(false))
            .or_else(|| ports.first())
            .ok_or(UploadError::NoPort)?;

        info!("Auto-detected upload port: {}", port.name);

        Ok(port.name.clone())
    }

    /// Poll until a port shows up that was not there in the previous scan.
    ///
    /// If none does, the previous port is kept as long as it still exists.
    fn wait_for_new_port(
        &mut self,
        previous: Option<&str>,
        mut before: Vec<String>,
        timeout: Duration,
        interval: Duration,
    ) -> Result<String, UploadError> {
        info!("Waiting for the new upload port...");

        let interval = interval.max(MIN_PORT_INTERVAL);
        let mut elapsed = Duration::ZERO;
        let mut now = before.clone();

        while elapsed < timeout {
            now = self.port_names()?;

            if let Some(new_port) = now.iter().find(|p| !before.contains(p)) {
                info!("New upload port: {}", new_port);
                return Ok(new_port.clone());
            }

            before = now.clone();
            self.ports.sleep(interval);
            elapsed += interval;
        }

        match previous {
            Some(previous) if now.iter().any(|p| p == previous) => {
                debug!("No new port appeared, keeping {}", previous);
                Ok(previous.to_owned())
            }
            _ => Err(UploadError::PortTimeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};

    use super::*;
    use crate::board::tests::test_board;

    /// Serial ports that change according to a script of scans.
    #[derive(Default)]
    struct FakePorts {
        scans: VecDeque<Vec<&'static str>>,
        current: Vec<&'static str>,
        log: Vec<String>,
        slept: Duration,
    }

    impl FakePorts {
        fn new(scans: &[&[&'static str]]) -> Self {
            Self {
                scans: scans.iter().map(|s| s.to_vec()).collect(),
                ..Default::default()
            }
        }
    }

    impl SerialPorts for FakePorts {
        fn list(&mut self) -> Result<Vec<PortInfo>, UploadError> {
            if let Some(scan) = self.scans.pop_front() {
                self.current = scan;
            }

            Ok(self
                .current
                .iter()
                .map(|name| PortInfo {
                    name: name.to_string(),
                    hwid: name.contains("ACM").then(|| (0x2341, 0x804d)),
                })
                .collect())
        }

        fn flush(&mut self, port: &str) -> Result<(), UploadError> {
            self.log.push(format!("flush {}", port));
            Ok(())
        }

        fn touch(&mut self, port: &str, baud: u32) -> Result<(), UploadError> {
            self.log.push(format!("touch {} {}", port, baud));
            Ok(())
        }

        fn sleep(&mut self, duration: Duration) {
            self.slept += duration;
        }
    }

    fn no_packages() -> BTreeMap<String, PathBuf> {
        BTreeMap::new()
    }

    fn plan_for(board: &BoardDescriptor, options: &UploadOptions, verbose: u8) -> UploadPlan {
        dispatch(board, options, &no_packages(), Path::new("build"), verbose).unwrap()
    }

    fn with_port(port: &str) -> UploadOptions {
        UploadOptions {
            port: Some(port.into()),
            ..Default::default()
        }
    }

    #[test]
    fn parse_protocols() {
        assert_eq!("sam-ba".parse::<Protocol>().unwrap(), Protocol::SamBa);
        assert_eq!("stk500v2".parse::<Protocol>().unwrap(), Protocol::Stk500v2);
        assert_eq!("atmel-ice".parse::<Protocol>().unwrap(), Protocol::AtmelIce);
        assert_eq!(
            "mystery-protocol".parse::<Protocol>().unwrap(),
            Protocol::Unknown("mystery-protocol".into())
        );
        assert_eq!(Protocol::SamBa.to_string(), "sam-ba");
        assert_eq!(Protocol::Unknown("x".into()).to_string(), "x");
        assert_eq!(Protocol::Stk500v2.image(), ImageKind::Hex);
        assert_eq!(Protocol::Blackmagic.image(), ImageKind::Elf);
        assert_eq!(Protocol::SamBa.image(), ImageKind::Bin);
    }

    #[test]
    fn sam_ba_plan() {
        let board = test_board("zeroUSB");
        let plan = plan_for(&board, &with_port("/dev/ttyACM0"), 0);

        assert_eq!(plan.protocol, Protocol::SamBa);
        assert_eq!(plan.executable, Some(PathBuf::from("bossac")));
        assert_eq!(
            plan.args,
            [
                "--port", "$UPLOAD_PORT", "--erase", "--write", "--verify", "--reset", "-U",
                "true", "$SOURCE"
            ]
        );
        // Flushing is disabled for this board
        assert_eq!(
            plan.actions,
            [
                UploadAction::SnapshotPorts,
                UploadAction::TouchSerialPort { baud: 1200 },
                UploadAction::WaitForNewPort {
                    timeout: DEFAULT_PORT_TIMEOUT,
                    interval: DEFAULT_PORT_INTERVAL
                },
                UploadAction::StripPortPath,
            ]
        );
        assert_eq!(plan.hwids[0], (0x2341, 0x804d));
    }

    #[test]
    fn sam_ba_due_verbose() {
        let board = test_board("due");
        let plan = plan_for(&board, &UploadOptions::default(), 1);

        assert_eq!(&plan.args[..2], ["--info", "--debug"]);
        assert!(plan.args.contains(&"--boot".to_owned()));
        assert_eq!(plan.args.last().unwrap(), SOURCE_PLACEHOLDER);
        assert_eq!(plan.actions[0], UploadAction::AutodetectPort);
    }

    #[test]
    fn wait_substitutes_new_port() {
        let board = test_board("zeroUSB");
        let plan = plan_for(&board, &with_port("/dev/ttyACM0"), 0);

        let mut uploader = Uploader::new(FakePorts::new(&[
            &["/dev/ttyACM0", "/dev/ttyS0"],
            &["/dev/ttyS0"],
            &["/dev/ttyS0"],
            &["/dev/ttyACM1", "/dev/ttyS0"],
        ]));

        let source = Path::new("build/firmware.bin");
        let port = uploader.prepare(&plan, source).unwrap();
        assert_eq!(port.as_deref(), Some("ttyACM1"));
        assert_eq!(uploader.ports().log, ["touch /dev/ttyACM0 1200"]);
        assert_eq!(uploader.ports().slept, DEFAULT_PORT_INTERVAL * 2);

        let cmd = uploader.command(&plan, port.as_deref(), source).unwrap();
        let args = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect::<Vec<_>>();
        assert_eq!(&args[..2], ["--port", "ttyACM1"]);
        assert_eq!(args.last().unwrap(), "build/firmware.bin");
    }

    #[test]
    fn without_wait_the_configured_port_is_kept() {
        let mut board = test_board("zeroUSB");
        board.upload.protocol = Some("mbctool".into());
        board.upload.wait_for_upload_port = false;
        board.upload.disable_flushing = false;

        let plan = plan_for(&board, &with_port("/dev/ttyACM0"), 0);
        assert_eq!(
            plan.actions,
            [
                UploadAction::FlushSerialBuffer,
                UploadAction::SnapshotPorts,
                UploadAction::TouchSerialPort { baud: 1200 },
            ]
        );

        let mut uploader = Uploader::new(FakePorts::new(&[&["/dev/ttyACM0"], &["/dev/ttyACM5"]]));
        let port = uploader.prepare(&plan, Path::new("fw.bin")).unwrap();

        assert_eq!(port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(
            uploader.ports().log,
            ["flush /dev/ttyACM0", "touch /dev/ttyACM0 1200"]
        );
        assert_eq!(
            plan.render_args(port.as_deref(), Path::new("fw.bin")).unwrap(),
            [
                "--device", "samd", "--speed", "1500000", "--port", "/dev/ttyACM0", "--upload",
                "fw.bin"
            ]
        );
    }

    #[test]
    fn wait_times_out() {
        let board = test_board("zeroUSB");
        let plan = plan_for(&board, &with_port("/dev/ttyUSB9"), 0);

        let mut uploader = Uploader::new(FakePorts::new(&[&["/dev/ttyS0"]]));
        match uploader.prepare(&plan, Path::new("fw.bin")) {
            Err(UploadError::PortTimeout(timeout)) => assert_eq!(timeout, DEFAULT_PORT_TIMEOUT),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(uploader.ports().slept, DEFAULT_PORT_TIMEOUT);
    }

    #[test]
    fn wait_with_zero_interval_still_times_out() {
        let timeout = Duration::from_millis(50);
        let mut uploader = Uploader::new(FakePorts::new(&[&["/dev/ttyS0"]]));

        match uploader.wait_for_new_port(None, vec!["/dev/ttyS0".into()], timeout, Duration::ZERO) {
            Err(UploadError::PortTimeout(t)) => assert_eq!(t, timeout),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(uploader.ports().slept, timeout);
    }

    #[test]
    fn wait_keeps_previous_port_if_still_present() {
        let board = test_board("zeroUSB");
        let plan = plan_for(&board, &with_port("/dev/ttyACM0"), 0);

        let mut uploader = Uploader::new(FakePorts::new(&[&["/dev/ttyACM0"]]));
        let port = uploader.prepare(&plan, Path::new("fw.bin")).unwrap();
        assert_eq!(port.as_deref(), Some("ttyACM0"));
    }

    #[test]
    fn autodetect_prefers_board_hwids() {
        let mut board = test_board("zeroUSB");
        board.upload.wait_for_upload_port = false;
        board.upload.use_1200bps_touch = false;

        let plan = plan_for(&board, &UploadOptions::default(), 0);
        assert_eq!(plan.actions[0], UploadAction::AutodetectPort);

        let mut uploader = Uploader::new(FakePorts::new(&[&["/dev/ttyS0", "/dev/ttyACM3"]]));
        let port = uploader.prepare(&plan, Path::new("fw.bin")).unwrap();
        assert_eq!(port.as_deref(), Some("ttyACM3"));

        let mut uploader = Uploader::new(FakePorts::new(&[&[]]));
        assert!(matches!(
            uploader.prepare(&plan, Path::new("fw.bin")),
            Err(UploadError::NoPort)
        ));
    }

    #[test]
    fn unknown_protocol() {
        let board = test_board("zeroUSB");
        let options = UploadOptions {
            protocol: Some("mystery-protocol".into()),
            ..Default::default()
        };

        let plan = plan_for(&board, &options, 0);
        assert_eq!(plan.protocol, Protocol::Unknown("mystery-protocol".into()));
        assert!(plan.executable.is_none());
        assert!(plan.actions.is_empty());

        let mut uploader = Uploader::new(FakePorts::default());
        assert!(matches!(
            uploader.upload(&plan, Path::new("fw.bin")),
            Err(UploadError::NoUploader(name)) if name == "mystery-protocol"
        ));
        assert!(uploader.ports().log.is_empty());
    }

    #[test]
    fn openocd_zero() {
        let dir = tempfile::tempdir().unwrap();
        let packages: BTreeMap<String, PathBuf> = [
            ("tool-openocd".to_owned(), dir.path().join("tool-openocd")),
            (
                "framework-arduino-samd".to_owned(),
                dir.path().join("framework-arduino-samd"),
            ),
        ]
        .into_iter()
        .collect();

        let board = test_board("zero");
        let plan = dispatch(&board, &UploadOptions::default(), &packages, dir.path(), 0).unwrap();

        assert_eq!(plan.executable, Some(PathBuf::from("openocd")));
        assert!(plan.actions.is_empty());
        assert_eq!(
            plan.args,
            [
                "-s".to_owned(),
                dir.path().join("tool-openocd/scripts").display().to_string(),
                "-f".to_owned(),
                "arduino_zero.cfg".to_owned(),
                "-s".to_owned(),
                dir.path()
                    .join("framework-arduino-samd/variants/arduino_zero/openocd_scripts")
                    .display()
                    .to_string(),
                "-c".to_owned(),
                "telnet_port disabled; program {$SOURCE} verify reset 0x2000; shutdown".to_owned(),
            ]
        );

        let mut board = board;
        board.upload.openocdcfg = None;
        assert!(matches!(
            dispatch(&board, &UploadOptions::default(), &packages, dir.path(), 0),
            Err(ConfigError::MissingBoardField { field: "upload.openocdcfg", .. })
        ));
    }

    #[test]
    fn debug_probe() {
        let board = test_board("zeroUSB");
        let options = UploadOptions {
            protocol: Some("atmel-ice".into()),
            ..Default::default()
        };

        let plan = plan_for(&board, &options, 0);
        assert_eq!(plan.protocol, Protocol::AtmelIce);
        assert!(plan.args.contains(&"interface/cmsis-dap.cfg".to_owned()));
        assert!(plan.args.contains(&"target/at91samdXX.cfg".to_owned()));
        assert_eq!(
            plan.args.last().unwrap(),
            "program {$SOURCE} verify reset 0x2000; shutdown"
        );

        // The manifest's onboard entry has no server of its own
        let edbg = dispatch(
            &board,
            &UploadOptions {
                protocol: Some("cmsis-dap".into()),
                ..Default::default()
            },
            &no_packages(),
            Path::new("build"),
            0,
        )
        .unwrap();
        assert!(edbg.args.contains(&"interface/cmsis-dap.cfg".to_owned()));

        let mut board = board;
        board.debug.openocd_chipname = None;
        assert!(matches!(
            dispatch(&board, &options, &no_packages(), Path::new("build"), 0),
            Err(ConfigError::MissingBoardField { field: "debug.openocd_chipname", .. })
        ));
    }

    #[test]
    fn stk500v2() {
        let mut board = test_board("zeroUSB");
        board.upload.protocol = Some("stk500v2".into());

        assert!(matches!(
            dispatch(&board, &UploadOptions::default(), &no_packages(), Path::new("build"), 0),
            Err(ConfigError::MissingBoardField { field: "upload.speed", .. })
        ));

        board.upload.speed = Some(57600);
        let plan = plan_for(&board, &with_port("/dev/ttyACM0"), 1);

        assert_eq!(plan.image, ImageKind::Hex);
        assert_eq!(plan.executable, Some(PathBuf::from("avrdude")));
        assert_eq!(plan.args[0], "-v");
        assert_eq!(
            plan.render_args(Some("/dev/ttyACM0"), Path::new("fw.hex")).unwrap()[7..],
            [
                "-P", "/dev/ttyACM0", "-b", "57600", "-u", "-U", "flash:w:fw.hex:i"
            ]
        );
        assert!(!plan.actions.contains(&UploadAction::StripPortPath));
    }

    #[test]
    fn jlink_script() {
        let dir = tempfile::tempdir().unwrap();
        let mut board = test_board("zeroUSB");
        board.upload.protocol = Some("jlink".into());

        let plan = dispatch(&board, &UploadOptions::default(), &no_packages(), dir.path(), 0).unwrap();
        let script = dir.path().join("upload.jlink");

        assert_eq!(&plan.args[..2], ["-device", "ATSAMD21G18"]);
        assert_eq!(plan.args.last().unwrap(), &script.display().to_string());

        let mut uploader = Uploader::new(FakePorts::default());
        uploader.prepare(&plan, Path::new("fw.bin")).unwrap();
        assert_eq!(
            fs::read_to_string(&script).unwrap(),
            "h\nloadbin fw.bin, 0x2000\nr\nq"
        );

        board.debug.jlink_device = None;
        assert!(matches!(
            dispatch(&board, &UploadOptions::default(), &no_packages(), dir.path(), 0),
            Err(ConfigError::MissingBoardField { field: "debug.jlink_device", .. })
        ));
    }

    #[test]
    fn custom_upload_command() {
        let board = test_board("zeroUSB");
        let options = UploadOptions {
            protocol: Some("custom".into()),
            command: Some(r#"my-flasher --port "$UPLOAD_PORT" "$SOURCE""#.into()),
            ..Default::default()
        };

        let plan = plan_for(&board, &options, 0);
        assert_eq!(plan.executable, Some(PathBuf::from("my-flasher")));
        assert_eq!(plan.args, ["--port", "$UPLOAD_PORT", "$SOURCE"]);
        assert_eq!(plan.actions, [UploadAction::AutodetectPort]);
        assert!(matches!(
            plan.render_args(None, Path::new("fw.bin")),
            Err(UploadError::NoPort)
        ));
    }

    #[test]
    fn blackmagic() {
        let board = test_board("zeroUSB");
        let options = UploadOptions {
            protocol: Some("blackmagic".into()),
            port: Some("/dev/ttyACM2".into()),
            ..Default::default()
        };

        let plan = plan_for(&board, &options, 0);
        assert_eq!(plan.image, ImageKind::Elf);
        assert!(plan.actions.is_empty());
        assert!(plan
            .render_args(plan.port.as_deref(), Path::new("fw.elf"))
            .unwrap()
            .contains(&"target extended-remote /dev/ttyACM2".to_owned()));
    }
}
