//! Command-line argument definitions.

use std::path::PathBuf;

use clap::Parser;
use layerscope_core::{CaptureParameters, SessionConfig, DEFAULT_QUEUE_CAPACITY};

use crate::output::OutputFormat;

/// Decode packets into layer stacks, from a capture file or a live interface.
#[derive(Parser, Debug)]
#[command(name = "layerscope")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Capture file to replay (pcap or pcapng)
    #[arg(value_name = "FILE", conflicts_with = "interface")]
    pub file: Option<PathBuf>,

    /// Capture live from this interface
    #[arg(short = 'i', long = "interface", value_name = "IFACE")]
    pub interface: Option<String>,

    /// Capture filter; packets that do not match are counted and discarded
    #[arg(short = 'f', long = "filter", value_name = "EXPR")]
    pub filter: Option<String>,

    /// Display filter; only matching packets are printed, matching fields marked
    #[arg(short = 'Y', long = "display-filter", value_name = "EXPR")]
    pub display_filter: Option<String>,

    /// BPF filter handed to the capture command
    #[arg(long = "bpf", value_name = "BPF", requires = "interface")]
    pub bpf: Option<String>,

    /// Put the interface into promiscuous mode
    #[arg(long = "promisc", requires = "interface")]
    pub promiscuous: bool,

    /// Snapshot length for live capture
    #[arg(short = 's', long = "snaplen", value_name = "BYTES", requires = "interface")]
    pub snaplen: Option<u32>,

    /// Packets buffered between capture and dissection
    #[arg(long = "queue-capacity", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Capture tool command line, e.g. "tcpdump -i {interface} -w - -U"
    #[arg(long = "capture-command", value_name = "COMMAND")]
    pub capture_command: Option<String>,

    /// Stop after printing this many packets
    #[arg(short = 'c', long = "count", value_name = "N")]
    pub count: Option<u64>,

    /// Output format
    #[arg(long = "format", value_enum, default_value = "summary")]
    pub format: OutputFormat,

    /// List registered tokens and exit
    #[arg(long = "tokens")]
    pub tokens: bool,

    /// Report live capture permissions and exit
    #[arg(long = "permission")]
    pub permission: bool,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Check if this is an info-only command (no capture source needed).
    pub fn is_info_only(&self) -> bool {
        self.tokens || self.permission
    }

    /// Session parameters for the requested source.
    pub fn capture_parameters(&self) -> CaptureParameters {
        let mut params = CaptureParameters::new()
            .promiscuous(self.promiscuous)
            .config(SessionConfig {
                queue_capacity: self.queue_capacity,
                ..Default::default()
            });
        if let Some(file) = &self.file {
            params = params.file(file);
        }
        if let Some(interface) = &self.interface {
            params = params.interface(interface);
        }
        if let Some(filter) = &self.filter {
            params = params.filter(filter);
        }
        if let Some(bpf) = &self.bpf {
            params = params.native_filter(bpf);
        }
        if let Some(snaplen) = self.snaplen {
            params = params.snaplen(snaplen);
        }
        params
    }
}
