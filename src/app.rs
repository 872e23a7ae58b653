//! Application loop: owns a device and a PHY, drives emulation runs, and
//! implements the scan policies (packet-count cap, wall-clock window,
//! host-supports-this-function signal).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::class::FunctionSignal;
use crate::dev::{self, DeviceOptions};
use crate::device::Device;
use crate::fuzz::client::FuzzerClient;
use crate::fuzz::{MutationBroker, StageLogger};
use crate::phy::gadgetfs::GadgetFsPhy;
use crate::phy::max342x::Max342xPhy;
use crate::phy::{Phy, RunPolicy};
use crate::{Error, Result};

/// Default packet-count cap for bounded runs.
pub const DEFAULT_MAX_PACKETS: usize = 3000;
/// Default wall-clock window for scan runs.
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(5);

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install a SIGINT handler so a run loop can wind down with a clean
/// disconnect instead of dying mid-transfer.
pub fn install_interrupt_handler() -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    let action = SigAction::new(
        SigHandler::Handler(handle_sigint),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGINT, &action) }.map_err(Error::from)?;
    Ok(())
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// The application's stop predicate: any configured bound ends the run.
pub struct StopConditions {
    max_packets: Option<usize>,
    window: Option<Duration>,
    supported: Option<FunctionSignal>,
    started: Instant,
    num_processed: usize,
}

impl StopConditions {
    /// No bounds; stops only on user interrupt.
    pub fn new() -> Self {
        Self {
            max_packets: None,
            window: None,
            supported: None,
            started: Instant::now(),
            num_processed: 0,
        }
    }

    pub fn with_packet_cap(mut self, cap: usize) -> Self {
        self.max_packets = Some(cap);
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    /// Stop as soon as the host demonstrates it drives this function.
    pub fn with_supported_signal(mut self, signal: FunctionSignal) -> Self {
        self.supported = Some(signal);
        self
    }

    /// Restart the wall clock (call right before the run).
    pub fn rearm(mut self) -> Self {
        self.started = Instant::now();
        self.num_processed = 0;
        self
    }
}

impl Default for StopConditions {
    fn default() -> Self {
        Self::new()
    }
}

impl RunPolicy for StopConditions {
    fn packet_processed(&mut self) -> bool {
        self.num_processed += 1;
        if interrupted() {
            log::info!("user terminated the run");
            return true;
        }
        if let Some(cap) = self.max_packets {
            if self.num_processed >= cap {
                log::info!("reached {cap:#x} packets, stopping phy");
                return true;
            }
        }
        if let Some(window) = self.window {
            if self.started.elapsed() > window {
                log::info!(
                    "have been waiting long enough (over {} secs), disconnect",
                    self.started.elapsed().as_secs()
                );
                return true;
            }
        }
        if let Some(signal) = &self.supported {
            if signal.is_supported() {
                log::info!("host drives this function, stopping phy");
                return true;
            }
        }
        false
    }
}

/// Parse the physical-layer spec: `fd:<serial_device>` or `gadgetfs`.
pub fn load_phy(spec: &str, fuzzing: bool) -> Result<Box<dyn Phy>> {
    log::info!("loading physical interface: {spec}");
    if let Some(serial_device) = spec.strip_prefix("fd:") {
        let phy = Max342xPhy::open(Path::new(serial_device), fuzzing)?;
        return Ok(Box::new(phy));
    }
    match spec {
        "gadgetfs" => Ok(Box::new(GadgetFsPhy::new(Path::new(
            GadgetFsPhy::DEFAULT_GADGET_DIR,
        )))),
        "rd" => Err(Error::Config(
            "raspdancer support is not built into this binary".to_string(),
        )),
        other => Err(Error::Config(format!("phy type not supported: {other}"))),
    }
}

/// Connect, run to the stop predicate, and disconnect cleanly. Transport
/// errors end the run and are logged; they do not propagate further.
pub fn run_device(
    phy: &mut dyn Phy,
    device: &mut Device,
    policy: &mut dyn RunPolicy,
) -> Result<()> {
    phy.connect(device)?;
    if let Err(e) = phy.run(device, policy) {
        log::error!("error while running device: {e}");
    }
    if phy.is_connected() {
        phy.disconnect()?;
    }
    device.detach();
    Ok(())
}

/// Shared application parameters for the emulation-shaped subcommands.
pub struct AppConfig {
    pub phy_spec: String,
    pub class_name: String,
    pub options: DeviceOptions,
    pub fuzzer: Option<(String, u16)>,
    pub stage_file: Option<PathBuf>,
}

fn build_broker(cfg: &AppConfig) -> Result<Arc<MutationBroker>> {
    let mut broker = match &cfg.fuzzer {
        Some((host, port)) => match FuzzerClient::connect(host, *port) {
            Ok(client) => MutationBroker::with_source(Box::new(client)),
            Err(e) => {
                log::warn!("fuzzer unavailable, degrading to pass-through: {e}");
                MutationBroker::passthrough()
            }
        },
        None => MutationBroker::passthrough(),
    };
    if let Some(path) = &cfg.stage_file {
        broker.set_stage_logger(StageLogger::create(path)?);
    }
    Ok(Arc::new(broker))
}

/// Emulate one device until interrupted.
pub fn emulate(cfg: &AppConfig) -> Result<()> {
    let broker = build_broker(cfg)?;
    let mut phy = load_phy(&cfg.phy_spec, cfg.fuzzer.is_some())?;
    let mut device = dev::build(&cfg.class_name, &cfg.options, broker)?;
    install_interrupt_handler()?;
    let mut policy = StopConditions::new();
    run_device(phy.as_mut(), &mut device, &mut policy)
}

/// Emulate while recording the stage trace; bounded like a scan run so the
/// trace covers one enumeration.
pub fn makestages(cfg: &AppConfig) -> Result<()> {
    if cfg.stage_file.is_none() {
        return Err(Error::Config("makestages needs a stage file".to_string()));
    }
    let broker = build_broker(cfg)?;
    let mut phy = load_phy(&cfg.phy_spec, false)?;
    let mut device = dev::build(&cfg.class_name, &cfg.options, broker)?;
    install_interrupt_handler()?;
    let mut policy = StopConditions::new()
        .with_packet_cap(DEFAULT_MAX_PACKETS)
        .with_window(DEFAULT_SCAN_WINDOW)
        .rearm();
    run_device(phy.as_mut(), &mut device, &mut policy)
}

/// Emulate with the remote fuzzer attached.
pub fn fuzz(cfg: &AppConfig) -> Result<()> {
    if cfg.fuzzer.is_none() {
        return Err(Error::Config(
            "fuzzing needs a fuzzer ip/port".to_string(),
        ));
    }
    emulate(cfg)
}

/// Emulate every known class in turn and report which ones the host drives.
pub fn scan(phy_spec: &str, options: &DeviceOptions, window: Duration) -> Result<()> {
    log::warn!("scanning host for supported device classes");
    let mut phy = load_phy(phy_spec, false)?;
    install_interrupt_handler()?;
    let mut supported = Vec::new();
    for (name, _) in dev::CLASSES {
        if interrupted() {
            break;
        }
        log::warn!("testing support for {name}");
        let broker = Arc::new(MutationBroker::passthrough());
        let mut device = match dev::build(name, options, broker) {
            Ok(device) => device,
            Err(e) => {
                log::error!("skipping {name}: {e}");
                continue;
            }
        };
        let signal = device.signal();
        let mut policy = StopConditions::new()
            .with_packet_cap(DEFAULT_MAX_PACKETS)
            .with_window(window)
            .with_supported_signal(signal.clone())
            .rearm();
        run_device(phy.as_mut(), &mut device, &mut policy)?;
        if signal.is_supported() {
            log::warn!("{name} is SUPPORTED");
            supported.push(*name);
        }
        thread::sleep(Duration::from_secs(2));
    }
    log::warn!("---------------------------------");
    log::warn!("found {} supported class(es):", supported.len());
    for (i, name) in supported.iter().enumerate() {
        log::warn!("{}. {name}", i + 1);
    }
    Ok(())
}

/// One row of the vendor-specific scan database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DbEntry {
    pub vid: u16,
    pub pid: u16,
    pub vendor: String,
    pub driver: String,
}

/// A resumable vendor-specific scan session, persisted as JSON after every
/// test.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ScanSession {
    pub timeout: f64,
    pub db: Vec<DbEntry>,
    pub supported: Vec<(u16, u16)>,
    pub unsupported: Vec<(u16, u16)>,
    pub current: usize,
}

impl ScanSession {
    pub fn new(db: Vec<DbEntry>, timeout: f64) -> Self {
        Self {
            timeout,
            db,
            supported: Vec::new(),
            unsupported: Vec::new(),
            current: 0,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read session file {path:?}: {e}")))?;
        serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("cannot parse session file {path:?}: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("cannot encode session: {e}")))?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

fn builtin_db() -> Vec<DbEntry> {
    vec![
        DbEntry {
            vid: 0x05ac,
            pid: 0x1402,
            vendor: "Apple, Inc.".to_string(),
            driver: "drivers/net/usb/asix_devices.c".to_string(),
        },
        DbEntry {
            vid: 0x0a5c,
            pid: 0x21e6,
            vendor: "Broadcom Corp.".to_string(),
            driver: "bt usb".to_string(),
        },
    ]
}

fn load_db(path: &Path) -> Result<Vec<DbEntry>> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read db file {path:?}: {e}")))?;
    serde_json::from_str(&data)
        .map_err(|e| Error::Config(format!("cannot parse db file {path:?}: {e}")))
}

/// Present a vendor-specific device for each (vid, pid) in the database and
/// record which ones the host has a driver for. The session file makes the
/// scan resumable across invocations.
pub fn vsscan(
    phy_spec: &str,
    db_file: Option<&Path>,
    session_file: Option<&Path>,
    timeout: f64,
) -> Result<()> {
    log::warn!("scanning host for supported vendor specific devices");
    let mut session = match session_file {
        Some(path) if path.exists() => {
            let session = ScanSession::load(path)?;
            log::warn!(
                "resuming session at {}/{}",
                session.current,
                session.db.len()
            );
            session
        }
        _ => {
            let db = match db_file {
                Some(path) => load_db(path)?,
                None => builtin_db(),
            };
            ScanSession::new(db, timeout)
        }
    };

    let mut phy = load_phy(phy_spec, false)?;
    install_interrupt_handler()?;
    while session.current < session.db.len() {
        if interrupted() {
            log::warn!("interrupted, session saved at {}", session.current);
            break;
        }
        let entry = session.db[session.current].clone();
        log::warn!(
            "testing support for vid {:04x} pid {:04x} ({})",
            entry.vid,
            entry.pid,
            entry.vendor
        );
        let options = DeviceOptions {
            vid: Some(entry.vid),
            pid: Some(entry.pid),
            disk_image: None,
        };
        let broker = Arc::new(MutationBroker::passthrough());
        let mut device = dev::build("vendor_specific", &options, broker)?;
        let signal = device.signal();
        let mut policy = StopConditions::new()
            .with_packet_cap(DEFAULT_MAX_PACKETS)
            .with_window(Duration::from_secs_f64(session.timeout))
            .with_supported_signal(signal.clone())
            .rearm();
        if let Err(e) = run_device(phy.as_mut(), &mut device, &mut policy) {
            log::error!("test failed for {:04x}:{:04x}: {e}", entry.vid, entry.pid);
        }
        if signal.is_supported() {
            log::warn!("device is SUPPORTED ({})", entry.driver);
            session.supported.push((entry.vid, entry.pid));
        } else {
            session.unsupported.push((entry.vid, entry.pid));
        }
        session.current += 1;
        if let Some(path) = session_file {
            session.save(path)?;
        }
        thread::sleep(Duration::from_secs(2));
    }

    if !session.supported.is_empty() {
        log::warn!("---------------------------------");
        log::warn!("found {} supported device(s):", session.supported.len());
        for (i, (vid, pid)) in session.supported.iter().enumerate() {
            log::warn!("{}. vid: {vid:04x}, pid: {pid:04x}", i + 1);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_cap_stops_the_run() {
        let mut policy = StopConditions::new().with_packet_cap(3).rearm();
        assert!(!policy.packet_processed());
        assert!(!policy.packet_processed());
        assert!(policy.packet_processed());
    }

    #[test]
    fn window_stops_the_run() {
        let mut policy = StopConditions::new()
            .with_window(Duration::from_millis(0))
            .rearm();
        thread::sleep(Duration::from_millis(2));
        assert!(policy.packet_processed());
    }

    #[test]
    fn supported_signal_stops_the_run() {
        let signal = FunctionSignal::new();
        let mut policy = StopConditions::new()
            .with_supported_signal(signal.clone())
            .rearm();
        assert!(!policy.packet_processed());
        signal.mark("test");
        assert!(policy.packet_processed());
    }

    #[test]
    fn unknown_phy_spec_is_a_config_error() {
        assert!(matches!(load_phy("tcp:1234", false), Err(Error::Config(_))));
        assert!(matches!(load_phy("rd", false), Err(Error::Config(_))));
    }

    #[test]
    fn scan_session_round_trips_through_json() {
        let dir = std::env::temp_dir().join("phantom-usb-session-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("session.json");
        let mut session = ScanSession::new(builtin_db(), 5.0);
        session.supported.push((0x05ac, 0x1402));
        session.current = 1;
        session.save(&path).unwrap();
        let loaded = ScanSession::load(&path).unwrap();
        assert_eq!(loaded, session);
    }
}
