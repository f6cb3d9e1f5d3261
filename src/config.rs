//! Command-line configuration.

use std::path::PathBuf;

use clap::Parser;

use crate::discover::DeviceFilter;

fn parse_hex16(s: &str) -> Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("not a hex id: {}", e))
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "canbridge",
    version,
    about = "TCP command server bridging a USB-serial CAN adapter"
)]
pub struct Config {
    /// Serial device path (default: autodiscover)
    #[arg(long)]
    pub device: Option<String>,

    /// USB vendor ID of the adapter, hex
    #[arg(long, value_parser = parse_hex16)]
    pub vid: Option<u16>,

    /// USB product ID of the adapter, hex
    #[arg(long, value_parser = parse_hex16)]
    pub pid: Option<u16>,

    /// TCP port to listen on (loopback only)
    #[arg(long, default_value_t = 4444)]
    pub port: u16,

    /// Append log output to this file
    #[arg(long)]
    pub logfile: Option<PathBuf>,

    /// Raise the log level (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Single-instance lock file
    #[arg(long, default_value = "/tmp/canserver.pid")]
    pub pidfile: PathBuf,

    /// Initial CAN bus bitrate in kbaud (required to run the server)
    #[arg(long)]
    pub speed: Option<u32>,

    /// Mirror client input back to its own socket before processing
    #[arg(long)]
    pub echo: bool,

    /// Maximum simultaneous TCP clients
    #[arg(long, default_value_t = 16)]
    pub max_clients: usize,

    /// Validate a data file against the object dictionary and exit
    #[arg(long, value_name = "FILE")]
    pub check: Option<PathBuf>,
}

impl Config {
    pub fn device_filter(&self) -> DeviceFilter {
        DeviceFilter {
            device: self.device.clone(),
            vid: self.vid,
            pid: self.pid,
        }
    }

    /// Default level is `Error`; each `-v` raises it one step.
    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Warn,
            2 => log::LevelFilter::Info,
            3 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::try_parse_from(["canbridge", "--speed", "500"]).unwrap();
        assert_eq!(config.port, 4444);
        assert_eq!(config.speed, Some(500));
        assert_eq!(config.max_clients, 16);
        assert_eq!(config.pidfile, PathBuf::from("/tmp/canserver.pid"));
        assert!(!config.echo);
        assert_eq!(config.log_level(), log::LevelFilter::Error);
    }

    #[test]
    fn hex_ids_accept_optional_prefix() {
        let config =
            Config::try_parse_from(["canbridge", "--vid", "0x0403", "--pid", "6001"]).unwrap();
        assert_eq!(config.vid, Some(0x0403));
        assert_eq!(config.pid, Some(0x6001));

        assert!(Config::try_parse_from(["canbridge", "--vid", "xyzq"]).is_err());
    }

    #[test]
    fn verbosity_accumulates() {
        let config = Config::try_parse_from(["canbridge", "-vvv"]).unwrap();
        assert_eq!(config.log_level(), log::LevelFilter::Debug);
        let config = Config::try_parse_from(["canbridge", "-vvvvv"]).unwrap();
        assert_eq!(config.log_level(), log::LevelFilter::Trace);
    }
}
