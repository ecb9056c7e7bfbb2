//! Live capture through an external capture tool.
//!
//! The tool is spawned with its pcap output on stdout, which is decoded by
//! [`PcapFrameReader`]. By default this is `dumpcap`; any tool that writes
//! classic pcap or pcapng to stdout can be configured with a template:
//!
//! ```text
//! tcpdump -i {interface} -U -w - {filter}
//! ```
//!
//! Placeholders: `{interface}`, `{snaplen}`, `{filter}`. An argument holding
//! `{filter}` is dropped when no native filter is set, together with a
//! preceding option flag such as `-f`.

use std::io::{BufRead, BufReader, ErrorKind};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::{CaptureHandle, Interrupter, OpenOptions, PcapFrameReader, RawFrame};

/// Upper bound on retained stderr text.
const STDERR_LIMIT: usize = 8192;

/// How to launch the live capture tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureCommand {
    program: String,
    /// Argument template; `None` uses the built-in dumpcap arguments.
    template: Option<Vec<String>>,
}

impl Default for CaptureCommand {
    fn default() -> Self {
        Self::dumpcap()
    }
}

impl CaptureCommand {
    /// `dumpcap -i <interface> -w - -F pcap -q -s <snaplen> [-p] [-f <filter>]`
    pub fn dumpcap() -> Self {
        Self {
            program: "dumpcap".to_string(),
            template: None,
        }
    }

    /// Parse a whitespace-separated command template.
    pub fn parse(command_line: &str) -> Result<Self> {
        let mut words = command_line.split_whitespace().map(str::to_string);
        let program = words.next().ok_or_else(|| Error::InvalidParameters {
            reason: "Capture command is empty".to_string(),
        })?;
        Ok(Self {
            program,
            template: Some(words.collect()),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments for capturing on `interface`.
    pub fn args(&self, interface: &str, options: &OpenOptions) -> Vec<String> {
        let Some(template) = &self.template else {
            let mut args: Vec<String> = ["-i", interface, "-w", "-", "-F", "pcap", "-q", "-s"]
                .iter()
                .map(|s| s.to_string())
                .collect();
            args.push(options.snaplen.to_string());
            if !options.promiscuous {
                args.push("-p".to_string());
            }
            if let Some(filter) = &options.filter {
                args.push("-f".to_string());
                args.push(filter.clone());
            }
            return args;
        };

        let mut args: Vec<String> = Vec::with_capacity(template.len());
        for arg in template {
            if arg.contains("{filter}") && options.filter.is_none() {
                if args.last().is_some_and(|prev| prev.starts_with('-')) {
                    args.pop();
                }
                continue;
            }
            args.push(
                arg.replace("{interface}", interface)
                    .replace("{snaplen}", &options.snaplen.to_string())
                    .replace("{filter}", options.filter.as_deref().unwrap_or_default()),
            );
        }
        args
    }

    /// Spawn the tool and wait for its capture header.
    pub fn spawn(&self, interface: &str, options: &OpenOptions) -> Result<CommandCapture> {
        let args = self.args(interface, options);
        debug!(program = %self.program, ?args, "Spawning capture command");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::PermissionDenied => Error::PermissionDenied {
                    platform: std::env::consts::OS,
                    detail: format!("cannot execute {}: {e}", self.program),
                },
                _ => Error::DeviceUnavailable {
                    device: interface.to_string(),
                    reason: format!("failed to start {}: {e}", self.program),
                },
            })?;

        let stderr = Arc::new(Mutex::new(String::new()));
        let drain = child.stderr.take().map(|pipe| {
            let stderr = Arc::clone(&stderr);
            thread::spawn(move || {
                for line in BufReader::new(pipe).lines().map_while(std::io::Result::ok) {
                    let mut text = stderr.lock().unwrap_or_else(PoisonError::into_inner);
                    if text.len() < STDERR_LIMIT {
                        text.push_str(&line);
                        text.push('\n');
                    }
                }
            })
        });

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::DeviceUnavailable {
                device: interface.to_string(),
                reason: "capture command has no stdout".to_string(),
            });
        };

        match PcapFrameReader::new(stdout) {
            Ok(reader) => Ok(CommandCapture {
                reader,
                interface: interface.to_string(),
                child: Arc::new(Mutex::new(child)),
                stopped: Arc::new(AtomicBool::new(false)),
                stderr,
            }),
            Err(err) => {
                // The tool failed before producing a header
                let _ = child.kill();
                let status = child.wait();
                if let Some(drain) = drain {
                    let _ = drain.join();
                }
                let text = stderr.lock().unwrap_or_else(PoisonError::into_inner).clone();
                debug!(program = %self.program, ?status, stderr = %text.trim(), "Capture command failed");
                Err(classify(interface, text.trim(), err))
            }
        }
    }
}

/// Map tool output to a permission or device error.
fn classify(interface: &str, stderr: &str, err: Error) -> Error {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("not permitted") {
        return Error::PermissionDenied {
            platform: std::env::consts::OS,
            detail: stderr.to_string(),
        };
    }
    Error::DeviceUnavailable {
        device: interface.to_string(),
        reason: if stderr.is_empty() {
            err.to_string()
        } else {
            stderr.to_string()
        },
    }
}

/// A running capture tool.
///
/// The child process is killed when the handle is closed or dropped.
pub struct CommandCapture {
    reader: PcapFrameReader,
    interface: String,
    child: Arc<Mutex<Child>>,
    stopped: Arc<AtomicBool>,
    stderr: Arc<Mutex<String>>,
}

impl CommandCapture {
    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = child.kill();
    }

    fn exit_error(&self) -> Option<Error> {
        let status = {
            let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
            child.wait().ok()?
        };
        if status.success() {
            return None;
        }
        let stderr = self.stderr.lock().unwrap_or_else(PoisonError::into_inner);
        Some(classify(
            &self.interface,
            stderr.trim(),
            Error::DeviceUnavailable {
                device: self.interface.clone(),
                reason: format!("capture command exited with {status}"),
            },
        ))
    }
}

impl CaptureHandle for CommandCapture {
    fn link_type(&self) -> u32 {
        self.reader.link_type()
    }

    fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        if self.stopped.load(Ordering::Acquire) {
            return Ok(None);
        }
        match self.reader.next_frame() {
            Ok(Some(frame)) => Ok(Some(frame)),
            // Killing the child may cut a record short
            Ok(None) | Err(_) if self.stopped.load(Ordering::Acquire) => Ok(None),
            Ok(None) => match self.exit_error() {
                Some(err) => Err(err),
                None => Ok(None),
            },
            Err(err) => {
                warn!(interface = %self.interface, error = %err, "Capture stream failed");
                Err(self.exit_error().unwrap_or(err))
            }
        }
    }

    fn interrupter(&self) -> Interrupter {
        let stopped = Arc::clone(&self.stopped);
        let child = Arc::clone(&self.child);
        Arc::new(move || {
            stopped.store(true, Ordering::Release);
            let _ = child.lock().unwrap_or_else(PoisonError::into_inner).kill();
        })
    }

    fn close(&mut self) {
        self.stop();
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = child.wait();
    }
}

impl Drop for CommandCapture {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(filter: Option<&str>, promiscuous: bool) -> OpenOptions {
        OpenOptions {
            filter: filter.map(str::to_string),
            promiscuous,
            snaplen: 65535,
        }
    }

    #[test]
    fn test_dumpcap_args() {
        let command = CaptureCommand::dumpcap();
        assert_eq!(
            command.args("eth0", &options(None, true)),
            vec!["-i", "eth0", "-w", "-", "-F", "pcap", "-q", "-s", "65535"]
        );
        let args = command.args("eth0", &options(Some("tcp port 80"), false));
        assert!(args.contains(&"-p".to_string()));
        assert_eq!(&args[args.len() - 2..], ["-f", "tcp port 80"]);
    }

    #[test]
    fn test_template_args() {
        let command = CaptureCommand::parse("tcpdump -i {interface} -s {snaplen} -w - -f {filter}").unwrap();
        assert_eq!(command.program(), "tcpdump");
        assert_eq!(
            command.args("lo", &options(None, false)),
            vec!["-i", "lo", "-s", "65535", "-w", "-"]
        );
        assert_eq!(
            command.args("lo", &options(Some("udp"), false)),
            vec!["-i", "lo", "-s", "65535", "-w", "-", "-f", "udp"]
        );
        assert!(CaptureCommand::parse("   ").is_err());
    }

    #[test]
    fn test_missing_tool() {
        let command = CaptureCommand::parse("layerscope-no-such-capture-tool {interface}").unwrap();
        let err = command.spawn("eth0", &OpenOptions::default()).err().unwrap();
        assert!(matches!(err, Error::DeviceUnavailable { ref device, .. } if device == "eth0"));
    }

    #[test]
    fn test_classify_permission() {
        let err = classify(
            "eth0",
            "You don't have permission to capture on that device",
            Error::Cancelled,
        );
        assert!(matches!(err, Error::PermissionDenied { .. }));
        let err = classify("eth0", "", Error::Cancelled);
        assert!(matches!(err, Error::DeviceUnavailable { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_tool_exits_without_output() {
        let command = CaptureCommand::parse("true {interface}").unwrap();
        let err = command.spawn("eth0", &OpenOptions::default()).err().unwrap();
        assert!(matches!(err, Error::DeviceUnavailable { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_reads_tool_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.pcap");
        let data = crate::test_utils::pcap_file(1, &[(1, 0, vec![0u8; 14]), (2, 0, vec![0u8; 14])]);
        std::fs::write(&path, data).unwrap();

        let command = CaptureCommand::parse(&format!("cat {}", path.display())).unwrap();
        let mut capture = command.spawn("eth0", &OpenOptions::default()).unwrap();
        assert_eq!(capture.link_type(), 1);
        assert_eq!(capture.next_frame().unwrap().unwrap().index, 1);
        assert_eq!(capture.next_frame().unwrap().unwrap().index, 2);
        assert!(capture.next_frame().unwrap().is_none());
        capture.close();
    }
}
