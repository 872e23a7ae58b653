//! File-per-endpoint PHY back-end: drives the Linux gadgetfs kernel
//! interface.
//!
//! The kernel exposes one control file (named after the UDC driver) plus one
//! file per endpoint once a configuration is live. The control file is
//! programmed with a tagged block of device/configuration descriptors and
//! then read for 12-byte event records; endpoint files are programmed with
//! a tagged block of endpoint descriptors and then read/written for bulk
//! data. Each endpoint gets its own thread: IN threads drain a send queue
//! into the endpoint file, OUT threads read the file and post buffers to a
//! mailbox drained on the run-loop thread.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::libc;
use nix::poll::{poll, PollFd, PollFlags};

use crate::device::Device;
use crate::phy::{EndpointInit, Phy, PhyIo, RunPolicy};
use crate::usb::{DeviceState, Direction, Speed};
use crate::{Error, Result};

const INIT_DEVICE: u32 = 0;
const INIT_EP: u32 = 1;

const EVENT_NOP: u32 = 0;
const EVENT_CONNECT: u32 = 1;
const EVENT_DISCONNECT: u32 = 2;
const EVENT_SETUP: u32 = 3;
const EVENT_SUSPEND: u32 = 4;

const EVENT_SIZE: usize = 12;

/// The stall acknowledgement errno (level two halted).
const EL2HLT: i32 = 51;

/// Control file names, one per known UDC driver.
const CONTROL_FILENAMES: &[&str] = &[
    "net2280",
    "gfs_udc",
    "pxa2xx_udc",
    "goku_udc",
    "sh_udc",
    "omap_udc",
    "musb-hdrc",
    "at91_udc",
    "lh740x_udc",
    "atmel_usba_udc",
    "20980000.usb",
];

/// Depth of each IN endpoint's send queue.
const IN_QUEUE_DEPTH: usize = 64;

/// Find the control file in the gadget directory. With more than one
/// candidate, the first match alphabetically wins.
fn find_control_file(dir: &Path) -> Result<PathBuf> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map_err(|e| Error::Config(format!("cannot list {dir:?}: {e}")))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    for name in names {
        if CONTROL_FILENAMES.contains(&name.as_str()) {
            let path = dir.join(&name);
            log::info!("found a control file: {path:?}");
            return Ok(path);
        }
    }
    Err(Error::Config(format!(
        "no known control file in {dir:?}; is the gadgetfs driver loaded?"
    )))
}

/// The INIT_DEVICE block: tag, full- and high-speed configuration blocks,
/// then the device descriptor, all canonical.
fn device_init_block(device: &Device) -> Vec<u8> {
    let broker = device.broker();
    let mut block = INIT_DEVICE.to_le_bytes().to_vec();
    for config in &device.configurations {
        block.extend_from_slice(&config.descriptor(Speed::Full, true, &broker));
        block.extend_from_slice(&config.descriptor(Speed::High, true, &broker));
    }
    block.extend_from_slice(&device.descriptor(true));
    block
}

/// The INIT_EP block: tag, then the endpoint descriptor at both speeds.
fn endpoint_init_block(init: &EndpointInit) -> Vec<u8> {
    let mut block = INIT_EP.to_le_bytes().to_vec();
    block.extend_from_slice(&init.fs_descriptor);
    block.extend_from_slice(&init.hs_descriptor);
    block
}

fn endpoint_file_name(init: &EndpointInit) -> String {
    let dir = match init.direction {
        Direction::Out => "out",
        Direction::In => "in",
    };
    format!("ep{}{}", init.number, dir)
}

/// Max packet size from a serialized endpoint descriptor; OUT threads read
/// in chunks of the high-speed value.
fn descriptor_max_packet(desc: &[u8]) -> usize {
    u16::from_le_bytes([desc[4], desc[5]]) as usize
}

fn open_gadget_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|e| Error::Config(format!("cannot open {path:?}: {e}")))
}

/// Write everything, retrying when the non-blocking fd pushes back.
fn write_retry(file: &mut File, mut data: &[u8], stop: &AtomicBool) -> Result<()> {
    while !data.is_empty() {
        match file.write(data) {
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if stop.load(Ordering::SeqCst) {
                    return Err(Error::Transport(io::Error::new(
                        io::ErrorKind::Interrupted,
                        "stopped while writing endpoint data",
                    )));
                }
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(Error::Transport(e)),
        }
    }
    Ok(())
}

/// Zero-length read on the control file: acks an IN status stage, or
/// acknowledges a stall (errno 51).
fn zero_read(file: &File) -> Result<()> {
    let r = unsafe { libc::read(file.as_raw_fd(), std::ptr::null_mut(), 0) };
    if r < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(EL2HLT) {
            log::debug!("kernel acknowledged the stall");
            return Ok(());
        }
        return Err(Error::Transport(err));
    }
    Ok(())
}

fn zero_write(file: &File) -> Result<()> {
    let r = unsafe { libc::write(file.as_raw_fd(), std::ptr::null(), 0) };
    if r < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(EL2HLT) {
            log::debug!("kernel acknowledged the stall");
            return Ok(());
        }
        return Err(Error::Transport(err));
    }
    Ok(())
}

/// Engine-facing side: the control file, IN endpoint queues, and the
/// endpoint set pending bring-up.
pub struct GadgetIo {
    control: Option<File>,
    in_queues: HashMap<u8, SyncSender<Vec<u8>>>,
    pending_endpoints: Vec<EndpointInit>,
    endpoints_ready: bool,
    /// Direction of the setup currently being serviced; selects the stall
    /// flavor (read for IN setups, write for OUT setups).
    last_setup_was_out: bool,
    gadget_dir: PathBuf,
    mailbox: Sender<(u8, Vec<u8>)>,
    threads: Vec<JoinHandle<()>>,
    in_ep_numbers: Vec<u8>,
    stop: Arc<AtomicBool>,
}

impl GadgetIo {
    fn control(&self) -> Result<&File> {
        self.control.as_ref().ok_or_else(|| {
            Error::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "control file is not open",
            ))
        })
    }

    /// Open the per-endpoint files, program them, and spawn their threads.
    fn setup_endpoints(&mut self) -> Result<()> {
        let inits = std::mem::take(&mut self.pending_endpoints);
        for init in &inits {
            let name = endpoint_file_name(init);
            let path = self.gadget_dir.join(&name);
            let mut file = open_gadget_file(&path)?;
            write_retry(&mut file, &endpoint_init_block(init), &self.stop)?;
            log::debug!("programmed endpoint file {name}");
            match init.direction {
                Direction::Out => {
                    let reader = OutEndpointReader {
                        file,
                        ep_num: init.number,
                        read_size: descriptor_max_packet(&init.hs_descriptor),
                        mailbox: self.mailbox.clone(),
                        stop: self.stop.clone(),
                    };
                    self.threads.push(thread::spawn(move || {
                        log::debug!("spawning out endpoint reader");
                        reader.run();
                    }));
                }
                Direction::In => {
                    let (tx, rx) = sync_channel(IN_QUEUE_DEPTH);
                    self.in_queues.insert(init.number, tx);
                    self.in_ep_numbers.push(init.number);
                    let writer = InEndpointWriter {
                        file,
                        ep_num: init.number,
                        queue: rx,
                        stop: self.stop.clone(),
                    };
                    self.threads.push(thread::spawn(move || {
                        log::debug!("spawning in endpoint writer");
                        writer.run();
                    }));
                }
            }
        }
        self.endpoints_ready = true;
        Ok(())
    }
}

impl PhyIo for GadgetIo {
    fn send_on_endpoint(&mut self, ep_num: u8, data: &[u8]) -> Result<()> {
        log::trace!("send_on_endpoint {ep_num} ({} bytes)", data.len());
        if ep_num == 0 {
            if data.is_empty() {
                // a zero-length EP0 response is the status-stage ack
                return zero_read(self.control()?);
            }
            let stop = self.stop.clone();
            let mut control = self.control()?.try_clone().map_err(Error::Transport)?;
            return write_retry(&mut control, data, &stop);
        }
        let Some(queue) = self.in_queues.get(&ep_num) else {
            return Err(Error::Protocol(format!(
                "no open IN endpoint {ep_num} to send on"
            )));
        };
        queue.send(data.to_vec()).map_err(|_| {
            Error::Transport(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("endpoint {ep_num} writer is gone"),
            ))
        })
    }

    fn stall_ep0(&mut self) -> Result<()> {
        log::info!("stalling EP0");
        let control = self.control()?;
        if self.last_setup_was_out {
            zero_write(control)
        } else {
            zero_read(control)
        }
    }

    fn ack_status_stage(&mut self) -> Result<()> {
        if !self.pending_endpoints.is_empty() && !self.endpoints_ready {
            self.setup_endpoints()?;
        }
        zero_read(self.control()?)
    }

    fn configure_endpoints(&mut self, endpoints: &[EndpointInit]) -> Result<()> {
        if !self.endpoints_ready {
            self.pending_endpoints = endpoints.to_vec();
        }
        Ok(())
    }
}

/// The gadgetfs PHY back-end.
pub struct GadgetFsPhy {
    io: GadgetIo,
    mailbox_rx: Receiver<(u8, Vec<u8>)>,
    connected: bool,
}

impl GadgetFsPhy {
    pub const DEFAULT_GADGET_DIR: &'static str = "/dev/gadget";

    pub fn new(gadget_dir: &Path) -> Self {
        let (mailbox, mailbox_rx) = channel();
        Self {
            io: GadgetIo {
                control: None,
                in_queues: HashMap::new(),
                pending_endpoints: Vec::new(),
                endpoints_ready: false,
                last_setup_was_out: false,
                gadget_dir: gadget_dir.to_path_buf(),
                mailbox,
                threads: Vec::new(),
                in_ep_numbers: Vec::new(),
                stop: Arc::new(AtomicBool::new(false)),
            },
            mailbox_rx,
            connected: false,
        }
    }

    fn handle_ep0(&mut self, device: &mut Device) -> Result<()> {
        let mut event = [0u8; EVENT_SIZE];
        let n = self.io.control()?.try_clone().map_err(Error::Transport)?.read(&mut event)?;
        if n != EVENT_SIZE {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("did not read a full event ({n}/{EVENT_SIZE})"),
            )));
        }
        let event_type = u32::from_le_bytes([event[8], event[9], event[10], event[11]]);
        match event_type {
            EVENT_NOP => log::debug!("EP0 event NOP"),
            EVENT_CONNECT => log::debug!("EP0 event CONNECT"),
            EVENT_DISCONNECT => log::debug!("EP0 event DISCONNECT"),
            EVENT_SUSPEND => log::debug!("EP0 event SUSPEND"),
            EVENT_SETUP => {
                log::debug!("EP0 event SETUP");
                let mut buf = event[..8].to_vec();
                let is_out = buf[0] & 0x80 == 0;
                let w_length = u16::from_le_bytes([buf[6], buf[7]]) as usize;
                if is_out && w_length > 0 {
                    // the data stage follows on the control file
                    let mut data = vec![0u8; w_length];
                    self.read_control_exact(&mut data)?;
                    buf.extend_from_slice(&data);
                }
                self.io.last_setup_was_out = is_out;
                device.handle_request(&buf, &mut self.io)?;
            }
            other => log::warn!("unknown EP0 event type {other:#x}"),
        }
        Ok(())
    }

    fn read_control_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut control = self.io.control()?.try_clone().map_err(Error::Transport)?;
        let mut filled = 0;
        while filled < buf.len() {
            match control.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(Error::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "control file closed mid data stage",
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(Error::Transport(e)),
            }
        }
        Ok(())
    }

    fn control_readable(&self) -> Result<bool> {
        let control = self.io.control()?;
        let mut fds = [PollFd::new(control, PollFlags::POLLIN)];
        // 1 ms timeout so IN endpoint readiness is polled between events
        let n = poll(&mut fds, 1)?;
        if n == 0 {
            return Ok(false);
        }
        Ok(fds[0]
            .revents()
            .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
            .unwrap_or(false))
    }
}

impl PhyIo for GadgetFsPhy {
    fn send_on_endpoint(&mut self, ep_num: u8, data: &[u8]) -> Result<()> {
        self.io.send_on_endpoint(ep_num, data)
    }

    fn stall_ep0(&mut self) -> Result<()> {
        self.io.stall_ep0()
    }

    fn ack_status_stage(&mut self) -> Result<()> {
        self.io.ack_status_stage()
    }

    fn configure_endpoints(&mut self, endpoints: &[EndpointInit]) -> Result<()> {
        self.io.configure_endpoints(endpoints)
    }
}

impl Phy for GadgetFsPhy {
    fn connect(&mut self, device: &mut Device) -> Result<()> {
        let path = find_control_file(&self.io.gadget_dir)?;
        let mut control = open_gadget_file(&path)?;
        let block = device_init_block(device);
        log::debug!(
            "writing {:#x} configuration bytes to the control file",
            block.len()
        );
        write_retry(&mut control, &block, &self.io.stop)?;
        self.io.control = Some(control);
        self.io.stop.store(false, Ordering::SeqCst);
        self.connected = true;
        device.set_speed(Speed::High);
        device.set_state(DeviceState::Powered);
        log::info!("connected device {}", device.name());
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.io.stop.store(true, Ordering::SeqCst);
        // dropping the queues unblocks the IN writers
        self.io.in_queues.clear();
        for handle in self.io.threads.drain(..) {
            let _ = handle.join();
        }
        self.io.in_ep_numbers.clear();
        self.io.endpoints_ready = false;
        self.io.pending_endpoints.clear();
        // control file closes last
        self.io.control = None;
        self.connected = false;
        log::info!("gadget torn down");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn run(&mut self, device: &mut Device, policy: &mut dyn RunPolicy) -> Result<()> {
        log::debug!("started run loop");
        'outer: loop {
            if self.control_readable()? {
                self.handle_ep0(device)?;
                if policy.packet_processed() {
                    break;
                }
            }
            // OUT data posted by endpoint threads
            while let Ok((ep_num, data)) = self.mailbox_rx.try_recv() {
                device.handle_data_available(ep_num, &data, &mut self.io);
                if policy.packet_processed() {
                    break 'outer;
                }
            }
            // IN endpoints are polled for buffer space every tick
            for ep_num in self.io.in_ep_numbers.clone() {
                device.handle_buffer_available(ep_num, &mut self.io);
            }
        }
        log::debug!("done with run loop");
        Ok(())
    }
}

/// Reads host data from an OUT endpoint file and posts it to the run-loop
/// mailbox.
struct OutEndpointReader {
    file: File,
    ep_num: u8,
    read_size: usize,
    mailbox: Sender<(u8, Vec<u8>)>,
    stop: Arc<AtomicBool>,
}

impl OutEndpointReader {
    fn run(self) {
        let mut file = self.file;
        let mut buf = vec![0u8; self.read_size];
        while !self.stop.load(Ordering::SeqCst) {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if self.mailbox.send((self.ep_num, buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    log::error!("error in EP{} reader thread: {e}", self.ep_num);
                    break;
                }
            }
        }
        log::debug!("EP{} reader stopped", self.ep_num);
    }
}

/// Drains the send queue of an IN endpoint into its endpoint file.
struct InEndpointWriter {
    file: File,
    ep_num: u8,
    queue: Receiver<Vec<u8>>,
    stop: Arc<AtomicBool>,
}

impl InEndpointWriter {
    fn run(mut self) {
        while let Ok(blob) = self.queue.recv() {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = write_retry(&mut self.file, &blob, &self.stop) {
                log::error!("error in EP{} writer thread: {e}", self.ep_num);
                break;
            }
        }
        log::debug!("EP{} writer stopped", self.ep_num);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::configuration::Configuration;
    use crate::device::DeviceBuilder;
    use crate::endpoint::{Endpoint, EndpointHandler};
    use crate::fuzz::MutationBroker;
    use crate::interface::Interface;
    use crate::usb::TransferType;

    fn sample_device() -> Device {
        let iface = Interface::new(0, 0x08, 0x06, 0x50)
            .with_endpoint(Endpoint::new(
                1,
                Direction::Out,
                TransferType::Bulk,
                0x40,
                0,
                EndpointHandler::Idle,
            ))
            .with_endpoint(Endpoint::new(
                3,
                Direction::In,
                TransferType::Bulk,
                0x40,
                0,
                EndpointHandler::Idle,
            ));
        DeviceBuilder::new(
            "gadget test",
            0x154b,
            0x6545,
            Arc::new(MutationBroker::passthrough()),
        )
        .configuration(Configuration::new(1, "cfg", vec![iface]))
        .build()
    }

    #[test]
    fn init_device_block_layout() {
        let device = sample_device();
        let block = device_init_block(&device);
        // tag
        assert_eq!(&block[..4], &[0, 0, 0, 0]);
        // fullspeed configuration header follows the tag
        assert_eq!(block[4], 9);
        assert_eq!(block[5], 0x02);
        let fs_total = u16::from_le_bytes([block[6], block[7]]) as usize;
        // highspeed configuration block follows the fullspeed one
        let hs_off = 4 + fs_total;
        assert_eq!(block[hs_off], 9);
        assert_eq!(block[hs_off + 1], 0x02);
        let hs_total = u16::from_le_bytes([block[hs_off + 2], block[hs_off + 3]]) as usize;
        // the device descriptor closes the block
        let dev_off = hs_off + hs_total;
        assert_eq!(block[dev_off], 18);
        assert_eq!(block[dev_off + 1], 0x01);
        assert_eq!(block.len(), dev_off + 18);
    }

    #[test]
    fn init_device_block_sizes_bulk_for_high_speed() {
        let device = sample_device();
        let block = device_init_block(&device);
        let fs_total = u16::from_le_bytes([block[6], block[7]]) as usize;
        let hs = &block[4 + fs_total..];
        // walk the high-speed block's endpoint descriptors
        let mut i = 9;
        let hs_total = u16::from_le_bytes([hs[2], hs[3]]) as usize;
        let mut bulk_sizes = Vec::new();
        while i + 1 < hs_total {
            let len = hs[i] as usize;
            if hs[i + 1] == 0x05 {
                bulk_sizes.push(u16::from_le_bytes([hs[i + 4], hs[i + 5]]));
            }
            i += len;
        }
        assert_eq!(bulk_sizes, vec![512, 512]);
    }

    #[test]
    fn init_ep_block_layout() {
        let init = EndpointInit {
            number: 1,
            direction: Direction::Out,
            fs_descriptor: vec![7, 5, 0x01, 0x02, 0x40, 0x00, 0],
            hs_descriptor: vec![7, 5, 0x01, 0x02, 0x00, 0x02, 0],
        };
        let block = endpoint_init_block(&init);
        assert_eq!(&block[..4], &[1, 0, 0, 0]);
        assert_eq!(block.len(), 4 + 7 + 7);
        assert_eq!(endpoint_file_name(&init), "ep1out");
        assert_eq!(descriptor_max_packet(&init.hs_descriptor), 512);
    }

    #[test]
    fn control_file_discovery() {
        let dir = std::env::temp_dir().join("phantom-usb-gadget-test");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        assert!(find_control_file(&dir).is_err());
        std::fs::write(dir.join("unrelated"), b"").unwrap();
        assert!(find_control_file(&dir).is_err());
        std::fs::write(dir.join("net2280"), b"").unwrap();
        let found = find_control_file(&dir).unwrap();
        assert_eq!(found.file_name().unwrap(), "net2280");
    }

    #[test]
    fn configure_then_ack_is_deferred_until_status_stage() {
        let phy = GadgetFsPhy::new(Path::new("/nonexistent"));
        let mut io = phy.io;
        let inits = vec![EndpointInit {
            number: 1,
            direction: Direction::Out,
            fs_descriptor: vec![7, 5, 1, 2, 0x40, 0, 0],
            hs_descriptor: vec![7, 5, 1, 2, 0, 2, 0],
        }];
        io.configure_endpoints(&inits).unwrap();
        assert_eq!(io.pending_endpoints.len(), 1);
        assert!(!io.endpoints_ready);
    }
}
