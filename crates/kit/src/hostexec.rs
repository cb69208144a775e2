//! Host command execution capability
//!
//! Everything that touches host tools (qemu-img, ip, brctl, iptables,
//! dnsmasq, isoinfo) goes through the [`HostExec`] trait so that the
//! callers stay testable and the literal process spawning lives in one
//! place.

use std::path::Path;
use std::process::{Command, Stdio};

use thiserror::Error;

/// Failure of a host command invocation.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("{command} exited with {status}")]
    Status { command: String, status: String },
    #[error("writing {path}: {source}")]
    WriteFile {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to signal pid {pid}")]
    Kill { pid: u32 },
}

/// Capability for running commands and mutating host state.
///
/// The real implementation is [`HostCommand`]; tests inject a recording
/// stub instead.
pub trait HostExec: Send + Sync {
    /// Run a command to completion, discarding output.
    fn run(&self, argv: &[&str]) -> Result<(), ExecError>;

    /// Run a command to completion and capture stdout.
    fn run_get_output(&self, argv: &[&str]) -> Result<Vec<u8>, ExecError>;

    /// Spawn a command that manages its own lifetime (e.g. a daemon
    /// that forks and writes a pidfile).
    fn spawn_detached(&self, argv: &[&str]) -> Result<(), ExecError>;

    /// Write a small host control file (sysctl style).
    fn write_file(&self, path: &Path, contents: &str) -> Result<(), ExecError>;

    /// Send SIGTERM to a process.
    fn kill(&self, pid: u32) -> Result<(), ExecError>;

    /// Run a command and capture stdout as a lossy string.
    fn run_get_string(&self, argv: &[&str]) -> Result<String, ExecError> {
        let out = self.run_get_output(argv)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

fn display(argv: &[&str]) -> String {
    argv.join(" ")
}

/// [`HostExec`] implementation that actually spawns processes.
#[derive(Debug, Default)]
pub struct HostCommand;

impl HostCommand {
    fn command(argv: &[&str]) -> Command {
        let mut c = Command::new(argv[0]);
        c.args(&argv[1..]);
        c
    }
}

impl HostExec for HostCommand {
    fn run(&self, argv: &[&str]) -> Result<(), ExecError> {
        let cmd = display(argv);
        tracing::debug!("+ {cmd}");
        let status = Self::command(argv)
            .stdout(Stdio::null())
            .status()
            .map_err(|e| ExecError::Spawn {
                command: display(argv),
                source: e,
            })?;
        if !status.success() {
            return Err(ExecError::Status {
                command: display(argv),
                status: status.to_string(),
            });
        }
        Ok(())
    }

    fn run_get_output(&self, argv: &[&str]) -> Result<Vec<u8>, ExecError> {
        let cmd = display(argv);
        tracing::debug!("+ {cmd}");
        let output = Self::command(argv)
            .stderr(Stdio::inherit())
            .output()
            .map_err(|e| ExecError::Spawn {
                command: display(argv),
                source: e,
            })?;
        if !output.status.success() {
            return Err(ExecError::Status {
                command: display(argv),
                status: output.status.to_string(),
            });
        }
        Ok(output.stdout)
    }

    fn spawn_detached(&self, argv: &[&str]) -> Result<(), ExecError> {
        let cmd = display(argv);
        tracing::debug!("+ {cmd} &");
        Self::command(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ExecError::Spawn {
                command: display(argv),
                source: e,
            })?;
        Ok(())
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<(), ExecError> {
        std::fs::write(path, contents).map_err(|e| ExecError::WriteFile {
            path: path.display().to_string(),
            source: e,
        })
    }

    fn kill(&self, pid: u32) -> Result<(), ExecError> {
        let Some(target) = rustix::process::Pid::from_raw(pid as i32) else {
            return Err(ExecError::Kill { pid });
        };
        rustix::process::kill_process(target, rustix::process::Signal::TERM)
            .map_err(|_| ExecError::Kill { pid })
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use super::{ExecError, HostExec};

    /// Records every invocation instead of spawning anything. Canned
    /// stdout can be registered per argv; `qemu-img create` calls touch
    /// the target file so directory scans behave like the real tool.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingExec {
        commands: Mutex<Vec<Vec<String>>>,
        pub writes: Mutex<Vec<(PathBuf, String)>>,
        pub kills: Mutex<Vec<u32>>,
        outputs: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl RecordingExec {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn stub_output(&self, argv: &[&str], output: &[u8]) {
            self.outputs
                .lock()
                .unwrap()
                .insert(argv.join(" "), output.to_vec());
        }

        pub fn recorded(&self) -> Vec<Vec<String>> {
            self.commands.lock().unwrap().clone()
        }

        fn record(&self, argv: &[&str]) {
            self.commands
                .lock()
                .unwrap()
                .push(argv.iter().map(|s| s.to_string()).collect());
        }

        fn fake_qemu_img(argv: &[&str]) {
            if argv[0] != "qemu-img" || argv.get(1) != Some(&"create") {
                return;
            }
            let mut skip_next = false;
            for arg in &argv[2..] {
                if skip_next {
                    skip_next = false;
                    continue;
                }
                match *arg {
                    "-f" | "-b" | "-F" => skip_next = true,
                    a if a.ends_with(".qcow2") => {
                        std::fs::write(a, b"").unwrap();
                        return;
                    }
                    _ => {}
                }
            }
        }
    }

    impl HostExec for RecordingExec {
        fn run(&self, argv: &[&str]) -> Result<(), ExecError> {
            self.record(argv);
            Self::fake_qemu_img(argv);
            Ok(())
        }

        fn run_get_output(&self, argv: &[&str]) -> Result<Vec<u8>, ExecError> {
            self.record(argv);
            Ok(self
                .outputs
                .lock()
                .unwrap()
                .get(&argv.join(" "))
                .cloned()
                .unwrap_or_default())
        }

        fn spawn_detached(&self, argv: &[&str]) -> Result<(), ExecError> {
            self.record(argv);
            Ok(())
        }

        fn write_file(&self, path: &Path, contents: &str) -> Result<(), ExecError> {
            self.writes
                .lock()
                .unwrap()
                .push((path.to_owned(), contents.to_owned()));
            Ok(())
        }

        fn kill(&self, pid: u32) -> Result<(), ExecError> {
            self.kills.lock().unwrap().push(pid);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_get_string() {
        let exec = HostCommand;
        let out = exec.run_get_string(&["echo", "hello"]).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn test_spawn_detached() {
        let exec = HostCommand;
        exec.spawn_detached(&["true"]).unwrap();
    }

    #[test]
    fn test_failed_status() {
        let exec = HostCommand;
        let err = exec.run(&["false"]).unwrap_err();
        assert!(matches!(err, ExecError::Status { .. }));
    }
}
