use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use log::LevelFilter;
use simple_logger::SimpleLogger;

use phantom_usb::app::{self, AppConfig};
use phantom_usb::dev::{DeviceOptions, CLASSES, UNAVAILABLE_CLASSES};

#[derive(Parser)]
#[command(
    name = "phantom-usb",
    version,
    about = "Emulate USB peripherals in software for host-side security assessment"
)]
struct Cli {
    /// Verbosity; repeat for more detail
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Only print warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Target {
    /// Physical layer: fd:<serial_device> or gadgetfs
    #[arg(short = 'P', long = "phy")]
    phy: String,
    /// Device class name (see list-classes)
    #[arg(short = 'C', long = "class")]
    class: String,
    /// Override the vendor id (hex with 0x prefix, or decimal)
    #[arg(long, value_parser = parse_u16)]
    vid: Option<u16>,
    /// Override the product id
    #[arg(long, value_parser = parse_u16)]
    pid: Option<u16>,
    /// Backing image for the mass storage class
    #[arg(long)]
    disk_image: Option<PathBuf>,
}

impl Target {
    fn options(&self) -> DeviceOptions {
        DeviceOptions {
            vid: self.vid,
            pid: self.pid,
            disk_image: self.disk_image.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Emulate a USB device
    Emulate {
        #[command(flatten)]
        target: Target,
    },
    /// Emulate a USB device with a remote fuzzer attached
    Fuzz {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value = "127.0.0.1")]
        fuzzer_ip: String,
        #[arg(long, default_value_t = 26007)]
        fuzzer_port: u16,
        /// Record the stage trace to this file
        #[arg(short = 's', long = "stage-file")]
        stage_file: Option<PathBuf>,
    },
    /// Emulate every known class and report which ones the host drives
    Scan {
        /// Physical layer: fd:<serial_device> or gadgetfs
        #[arg(short = 'P', long = "phy")]
        phy: String,
        /// Per-class scan window in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,
        /// Backing image for the mass storage class
        #[arg(long)]
        disk_image: Option<PathBuf>,
    },
    /// Scan host drivers for vendor-specific VID/PID support
    Vsscan {
        /// Physical layer: fd:<serial_device> or gadgetfs
        #[arg(short = 'P', long = "phy")]
        phy: String,
        /// JSON database of {vid, pid, vendor, driver} rows
        #[arg(short, long)]
        db: Option<PathBuf>,
        /// Session file; an existing one resumes the scan
        #[arg(long)]
        session: Option<PathBuf>,
        /// Per-test timeout in seconds
        #[arg(long, default_value_t = 5.0)]
        timeout: f64,
    },
    /// List the available device classes
    ListClasses,
    /// Emulate while recording the stage trace for corpus replay
    Makestages {
        #[command(flatten)]
        target: Target,
        /// File to store the list of stages in
        #[arg(short = 's', long = "stage-file")]
        stage_file: PathBuf,
    },
    /// Detect the host operating system
    DetectOs,
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| format!("invalid 16-bit value {s:?}: {e}"))
}

fn log_level(cli: &Cli) -> LevelFilter {
    if cli.quiet {
        return LevelFilter::Warn;
    }
    match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn main() {
    let cli = Cli::parse();
    SimpleLogger::new().with_level(log_level(&cli)).init().unwrap();

    let result = match cli.command {
        Command::Emulate { target } => app::emulate(&AppConfig {
            phy_spec: target.phy.clone(),
            class_name: target.class.clone(),
            options: target.options(),
            fuzzer: None,
            stage_file: None,
        }),
        Command::Fuzz {
            target,
            fuzzer_ip,
            fuzzer_port,
            stage_file,
        } => app::fuzz(&AppConfig {
            phy_spec: target.phy.clone(),
            class_name: target.class.clone(),
            options: target.options(),
            fuzzer: Some((fuzzer_ip, fuzzer_port)),
            stage_file,
        }),
        Command::Scan {
            phy,
            timeout,
            disk_image,
        } => app::scan(
            &phy,
            &DeviceOptions {
                vid: None,
                pid: None,
                disk_image,
            },
            Duration::from_secs(timeout),
        ),
        Command::Vsscan {
            phy,
            db,
            session,
            timeout,
        } => app::vsscan(&phy, db.as_deref(), session.as_deref(), timeout),
        Command::ListClasses => {
            println!("available device classes:");
            for (name, description) in CLASSES {
                println!("  {name:<16} {description}");
            }
            println!("not carried in this emulator:");
            for (name, description) in UNAVAILABLE_CLASSES {
                println!("  {name:<16} {description}");
            }
            Ok(())
        }
        Command::Makestages { target, stage_file } => app::makestages(&AppConfig {
            phy_spec: target.phy.clone(),
            class_name: target.class.clone(),
            options: target.options(),
            fuzzer: None,
            stage_file: Some(stage_file),
        }),
        Command::DetectOs => {
            eprintln!("detect-os is not implemented");
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }
}
