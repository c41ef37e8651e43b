//! Structured external-command execution.
//!
//! Every OS utility the engine drives (parted, losetup, mkfs, lvm tools,
//! grub tools, tar, qemu-img) goes through [`Cmd`]. Arguments are always
//! passed as a list, never concatenated into a shell string, so labels and
//! paths need no quoting and cannot be misinterpreted by a shell.

use std::ffi::OsString;
use std::path::Path;
use std::process::{Command, Stdio};

use log::{debug, warn};

use crate::error::{BuildError, Result};

/// Builder for a single blocking external command invocation.
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    current_dir: Option<OsString>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.as_os_str().to_owned());
        self
    }

    /// A non-zero exit (or a spawn failure) is logged and swallowed instead
    /// of aborting the build. Used for best-effort teardown steps.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// The full command line, for logs and error reports.
    fn command_line(&self) -> String {
        let mut line = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
    }

    /// Run the command to completion, inheriting stdout/stderr.
    pub fn run(self) -> Result<()> {
        let line = self.command_line();
        debug!("running: {}", line);

        let status = match self.command().status() {
            Ok(status) => status,
            Err(err) => {
                if self.allow_fail {
                    warn!("could not run {} (ignored): {}", line, err);
                    return Ok(());
                }
                return Err(BuildError::Io(err));
            }
        };

        if status.success() {
            return Ok(());
        }
        if self.allow_fail {
            warn!("command failed (ignored): {} (exit={:?})", line, status.code());
            return Ok(());
        }
        warn!("command failed: {} (exit={:?})", line, status.code());
        Err(BuildError::ToolInvocation {
            command: line,
            code: status.code(),
        })
    }

    /// Run the command and capture its trimmed stdout.
    pub fn read_stdout(self) -> Result<String> {
        let line = self.command_line();
        debug!("running: {}", line);

        let output = self
            .command()
            .stderr(Stdio::inherit())
            .output()
            .map_err(BuildError::Io)?;

        if !output.status.success() {
            return Err(BuildError::ToolInvocation {
                command: line,
                code: output.status.code(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}
