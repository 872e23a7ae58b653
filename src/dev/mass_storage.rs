//! Mass-storage device: bulk-only transport with a SCSI command set backed
//! by a disk-image file.
//!
//! The bulk OUT endpoint queues raw transport data to a worker thread that
//! parses command block wrappers and produces responses; the bulk IN
//! endpoint drains the worker's response queue. Decoupling through the two
//! queues keeps the control-transfer engine single-threaded while SCSI
//! commands (and their disk I/O) run off the PHY loop.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::class::UsbClass;
use crate::configuration::Configuration;
use crate::device::{Device, DeviceBuilder};
use crate::dev::DeviceOptions;
use crate::endpoint::{Endpoint, EndpointHandler};
use crate::fuzz::{MutationBroker, SessionData};
use crate::interface::Interface;
use crate::usb::{ControlRequest, Direction, TransferType, UsbClassCode};
use crate::{Error, Result};

/// SCSI operation codes serviced by the worker.
mod op {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const INQUIRY: u8 = 0x12;
    pub const MODE_SENSE_6: u8 = 0x1a;
    pub const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1e;
    pub const READ_FORMAT_CAPACITIES: u8 = 0x23;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2a;
    pub const SYNCHRONIZE_CACHE: u8 = 0x35;
    pub const MODE_SENSE_10: u8 = 0x5a;
}

const BLOCK_SIZE: usize = 0x200;

/// The bulk-only transport control requests.
pub struct MassStorageClass;

impl UsbClass for MassStorageClass {
    fn name(&self) -> &'static str {
        "mass storage class"
    }

    fn request_codes(&self) -> Vec<u8> {
        vec![0xfe, 0xff]
    }

    fn handle(&mut self, fuzz: &MutationBroker, req: &ControlRequest) -> Option<Vec<u8>> {
        let session = SessionData::new();
        match req.setup.b_request {
            0xff => fuzz.wrap("msc_bulk_only_mass_storage_reset_response", &session, || {
                Some(Vec::new())
            }),
            0xfe => fuzz.wrap("msc_get_max_lun_response", &session, || Some(vec![0x00])),
            _ => None,
        }
    }
}

/// A memory-mapped-style view of the backing image file.
pub struct DiskImage {
    file: std::fs::File,
    block_size: usize,
    size: u64,
}

impl DiskImage {
    pub fn open(path: &Path, block_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::Config(format!("cannot open disk image {path:?}: {e}")))?;
        let size = file
            .metadata()
            .map_err(|e| Error::Config(format!("cannot stat disk image {path:?}: {e}")))?
            .len();
        Ok(Self {
            file,
            block_size,
            size,
        })
    }

    pub fn sector_count(&self) -> u32 {
        (self.size as usize / self.block_size).saturating_sub(1) as u32
    }

    pub fn read_sector(&self, lba: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size];
        self.file
            .read_exact_at(&mut buf, lba as u64 * self.block_size as u64)?;
        Ok(buf)
    }

    pub fn write_sectors(&self, lba: u32, data: &[u8]) -> Result<()> {
        self.file
            .write_all_at(data, lba as u64 * self.block_size as u64)?;
        Ok(())
    }
}

/// A parsed command block wrapper.
pub struct CommandBlockWrapper {
    pub tag: [u8; 4],
    pub data_transfer_length: u32,
    pub flags: u8,
    pub lun: u8,
    pub cb: Vec<u8>,
    pub opcode: u8,
}

impl CommandBlockWrapper {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 16 {
            return Err(Error::Protocol(format!(
                "short command block wrapper: {} bytes",
                data.len()
            )));
        }
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&data[4..8]);
        Ok(Self {
            tag,
            data_transfer_length: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            flags: data[12],
            lun: data[13] & 0x0f,
            cb: data[15..].to_vec(),
            opcode: data[15],
        })
    }
}

/// A command status wrapper with the given status byte.
pub fn csw(tag: &[u8; 4], status: u8) -> Vec<u8> {
    let mut w = b"USBS".to_vec();
    w.extend_from_slice(tag);
    w.extend_from_slice(&0u32.to_le_bytes());
    w.push(status);
    w
}

struct PendingWrite {
    tag: [u8; 4],
    base_lba: u32,
    length: usize,
    data: Vec<u8>,
}

/// The SCSI worker: receives transport data from the OUT endpoint, queues
/// responses for the IN endpoint.
struct ScsiWorker {
    disk: DiskImage,
    broker: Arc<MutationBroker>,
    commands: Receiver<Vec<u8>>,
    responses: Sender<Vec<u8>>,
    stop: Arc<AtomicBool>,
    pending_write: Option<PendingWrite>,
}

impl ScsiWorker {
    fn run(mut self) {
        while !self.stop.load(Ordering::SeqCst) {
            match self.commands.recv_timeout(Duration::from_millis(100)) {
                Ok(data) => self.service(data),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        log::debug!("scsi worker stopped");
    }

    fn push(&self, data: Vec<u8>) {
        if self.responses.send(data).is_err() {
            log::debug!("response queue is gone");
        }
    }

    fn service(&mut self, data: Vec<u8>) {
        if self.pending_write.is_some() {
            self.continue_write(&data);
            return;
        }
        let cbw = match CommandBlockWrapper::parse(&data) {
            Ok(cbw) => cbw,
            Err(e) => {
                log::warn!("dropping unparseable transport data: {e}");
                return;
            }
        };
        let mut session = SessionData::new();
        session.insert("opcode".to_string(), vec![cbw.opcode]);
        session.insert("transaction_id".to_string(), cbw.tag.to_vec());
        let broker = self.broker.clone();

        let response = match cbw.opcode {
            op::INQUIRY => broker.wrap("scsi_inquiry_response", &session, || {
                log::debug!("SCSI Inquiry");
                Some(inquiry_response())
            }),
            op::REQUEST_SENSE => broker.wrap("scsi_request_sense_response", &session, || {
                log::debug!("SCSI Request Sense");
                Some(request_sense_response())
            }),
            op::TEST_UNIT_READY => broker.wrap("scsi_test_unit_ready_response", &session, || {
                log::debug!("SCSI Test Unit Ready, lun {}", cbw.lun);
                None
            }),
            op::READ_CAPACITY_10 => {
                broker.wrap("scsi_read_capacity_10_response", &session, || {
                    log::debug!("SCSI Read Capacity");
                    let mut r = self.disk.sector_count().to_be_bytes().to_vec();
                    r.extend_from_slice(&(BLOCK_SIZE as u32).to_be_bytes());
                    Some(r)
                })
            }
            op::PREVENT_ALLOW_MEDIUM_REMOVAL => broker.wrap(
                "scsi_prevent_allow_medium_removal_response",
                &session,
                || {
                    log::debug!("SCSI Prevent/Allow Removal");
                    None
                },
            ),
            op::MODE_SENSE_6 => broker.wrap("scsi_mode_sense_6_response", &session, || {
                Some(mode_sense_response(&cbw))
            }),
            op::MODE_SENSE_10 => broker.wrap("scsi_mode_sense_10_response", &session, || {
                Some(mode_sense_response(&cbw))
            }),
            op::READ_FORMAT_CAPACITIES => {
                broker.wrap("scsi_read_format_capacities", &session, || {
                    log::debug!("SCSI Read Format Capacity");
                    Some(read_format_capacities_response())
                })
            }
            op::SYNCHRONIZE_CACHE => {
                broker.wrap("scsi_synchronize_cache_response", &session, || {
                    log::debug!("SCSI Synchronize Cache");
                    None
                })
            }
            op::READ_10 => {
                let base_lba = u32::from_be_bytes([cbw.cb[2], cbw.cb[3], cbw.cb[4], cbw.cb[5]]);
                let num_blocks = u16::from_be_bytes([cbw.cb[7], cbw.cb[8]]);
                log::debug!("SCSI Read (10), lba {base_lba:#x} + {num_blocks:#x} block(s)");
                for block in 0..num_blocks as u32 {
                    match self.disk.read_sector(base_lba + block) {
                        Ok(sector) => self.push(sector),
                        Err(e) => {
                            log::warn!("read beyond the image: {e}");
                            self.push(csw(&cbw.tag, 2));
                            return;
                        }
                    }
                }
                None
            }
            op::WRITE_10 => {
                let armed = broker.wrap("scsi_write_10_response", &session, || {
                    let base_lba =
                        u32::from_be_bytes([cbw.cb[2], cbw.cb[3], cbw.cb[4], cbw.cb[5]]);
                    let num_blocks = u16::from_be_bytes([cbw.cb[7], cbw.cb[8]]);
                    log::debug!("SCSI Write (10), lba {base_lba:#x} + {num_blocks:#x} block(s)");
                    self.pending_write = Some(PendingWrite {
                        tag: cbw.tag,
                        base_lba,
                        length: num_blocks as usize * BLOCK_SIZE,
                        data: Vec::new(),
                    });
                    None
                });
                if self.pending_write.is_some() {
                    // status follows once the data stage lands
                    return;
                }
                armed
            }
            other => {
                log::warn!("no handler for SCSI opcode {other:#x}");
                self.push(csw(&cbw.tag, 1));
                return;
            }
        };
        if let Some(response) = response {
            if !response.is_empty() {
                self.push(response);
            }
        }
        self.push(csw(&cbw.tag, 0));
    }

    fn continue_write(&mut self, data: &[u8]) {
        let done = {
            let write = self.pending_write.as_mut().unwrap();
            log::debug!("got {:#x} bytes of SCSI write data", data.len());
            write.data.extend_from_slice(data);
            write.data.len() >= write.length
        };
        if done {
            let write = self.pending_write.take().unwrap();
            let status = match self.disk.write_sectors(write.base_lba, &write.data) {
                Ok(()) => 0,
                Err(e) => {
                    log::warn!("write beyond the image: {e}");
                    2
                }
            };
            self.push(csw(&write.tag, status));
        }
    }
}

fn inquiry_response() -> Vec<u8> {
    let peripheral = 0x00u8; // direct access block device
    let rmb = 0x80u8; // removable
    let version = 0x00u8;
    let response_data_format = 0x01u8;
    let mut rest = vec![0x00, 0x00, 0x00];
    rest.extend_from_slice(b"PNY     ");
    rest.extend_from_slice(b"USB 2.0 FD      ");
    rest.extend_from_slice(b"8.02");
    let mut response = vec![peripheral, rmb, version, response_data_format, rest.len() as u8];
    response.extend_from_slice(&rest);
    response
}

fn request_sense_response() -> Vec<u8> {
    let mut rest = Vec::new();
    rest.extend_from_slice(&0u32.to_le_bytes()); // command specific information
    rest.push(0x3a); // additional sense code: medium not present
    rest.push(0x00);
    rest.push(0x00);
    rest.extend_from_slice(&[0x00, 0x00, 0x00]); // sense key specific
    let mut response = vec![0x70, 0x00, 0x06];
    response.extend_from_slice(&0u32.to_le_bytes()); // information
    response.push(rest.len() as u8);
    response.extend_from_slice(&rest);
    response
}

fn mode_sense_response(cbw: &CommandBlockWrapper) -> Vec<u8> {
    let page = cbw.cb[2] & 0x3f;
    log::debug!("SCSI Mode Sense, page code {page:#04x}");
    match page {
        0x1c => {
            let mut body = vec![0x00, 0x00, 0x00];
            body.extend_from_slice(&[0x1c, 0x06, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00]);
            let mut response = vec![body.len() as u8];
            response.extend_from_slice(&body);
            response
        }
        0x3f => vec![0x45, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00],
        _ => vec![0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    }
}

fn read_format_capacities_response() -> Vec<u8> {
    let mut response = 8u32.to_be_bytes().to_vec();
    response.extend_from_slice(&0x1000u32.to_be_bytes()); // sectors
    response.extend_from_slice(&0x1000u16.to_be_bytes()); // reserved
    response.extend_from_slice(&(BLOCK_SIZE as u16).to_be_bytes());
    response
}

pub fn device(opts: &DeviceOptions, broker: Arc<MutationBroker>) -> Result<Device> {
    let image_path = opts
        .disk_image
        .clone()
        .unwrap_or_else(|| Path::new("stick.img").to_path_buf());
    let disk = DiskImage::open(&image_path, BLOCK_SIZE)?;

    let (cmd_tx, cmd_rx) = channel::<Vec<u8>>();
    let (resp_tx, resp_rx) = channel::<Vec<u8>>();
    let stop = Arc::new(AtomicBool::new(false));

    let worker = ScsiWorker {
        disk,
        broker: broker.clone(),
        commands: cmd_rx,
        responses: resp_tx,
        stop: stop.clone(),
        pending_write: None,
    };
    thread::spawn(move || {
        log::debug!("spawning scsi worker");
        worker.run();
    });

    let out_handler = EndpointHandler::Out(Box::new(move |_phy, data| {
        log::debug!("handling {} bytes of SCSI data", data.len());
        if cmd_tx.send(data.to_vec()).is_err() {
            log::error!("scsi worker is gone");
        }
    }));
    let in_handler = EndpointHandler::In(Box::new(move |phy| {
        if let Ok(response) = resp_rx.try_recv() {
            if let Err(e) = phy.send_on_endpoint(3, &response) {
                log::error!("failed to send SCSI response: {e}");
            }
        }
    }));

    let iface = Interface::new(0, UsbClassCode::MassStorage as u8, 0x06, 0x50)
        .with_endpoint(Endpoint::new(
            1,
            Direction::Out,
            TransferType::Bulk,
            0x40,
            0,
            out_handler,
        ))
        .with_endpoint(Endpoint::new(
            3,
            Direction::In,
            TransferType::Bulk,
            0x40,
            0,
            in_handler,
        ));

    let mut device = DeviceBuilder::new(
        "mass storage device",
        opts.vid.unwrap_or(0x154b),
        opts.pid.unwrap_or(0x6545),
        broker,
    )
    .revision(0x0002)
    .manufacturer("PNY")
    .product("USB 2.0 FD")
    .serial("4731020ef1914da9")
    .configuration(Configuration::new(1, "MassStorage config", vec![iface]))
    .usb_class(Box::new(MassStorageClass))
    .build();

    device.add_teardown(Box::new(move || {
        stop.store(true, Ordering::SeqCst);
    }));
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::mock::MockPhy;
    use std::io::Write;

    fn temp_image(sectors: usize) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("phantom-usb-msc-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("img-{}-{sectors}.img", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![0u8; sectors * BLOCK_SIZE]).unwrap();
        path
    }

    fn build_cbw(opcode: u8, cb_rest: &[u8]) -> Vec<u8> {
        let mut cbw = b"USBC".to_vec();
        cbw.extend_from_slice(&[0x11, 0x22, 0x33, 0x44]); // tag
        cbw.extend_from_slice(&0u32.to_le_bytes());
        cbw.push(0x80);
        cbw.push(0x00);
        cbw.push((cb_rest.len() + 1) as u8);
        cbw.push(opcode);
        cbw.extend_from_slice(cb_rest);
        cbw
    }

    fn configured() -> (Device, MockPhy) {
        let opts = DeviceOptions {
            vid: None,
            pid: None,
            disk_image: Some(temp_image(64)),
        };
        let mut dev = device(&opts, Arc::new(MutationBroker::passthrough())).unwrap();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00], &mut phy)
            .unwrap();
        (dev, phy)
    }

    fn drain_responses(dev: &mut Device, phy: &mut MockPhy, expected: usize) {
        for _ in 0..200 {
            dev.handle_buffer_available(3, phy);
            if phy.sent.iter().filter(|(ep, _)| *ep == 3).count() >= expected {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("scsi worker produced no response");
    }

    #[test]
    fn cbw_parses_fields() {
        let raw = build_cbw(op::INQUIRY, &[0, 0, 0, 36, 0]);
        let cbw = CommandBlockWrapper::parse(&raw).unwrap();
        assert_eq!(cbw.tag, [0x11, 0x22, 0x33, 0x44]);
        assert_eq!(cbw.opcode, op::INQUIRY);
        assert_eq!(cbw.lun, 0);
    }

    #[test]
    fn csw_is_13_bytes() {
        let w = csw(&[1, 2, 3, 4], 0);
        assert_eq!(w.len(), 13);
        assert_eq!(&w[..4], b"USBS");
        assert_eq!(&w[4..8], &[1, 2, 3, 4]);
        assert_eq!(w[12], 0);
    }

    #[test]
    fn inquiry_response_is_standard_length() {
        let r = inquiry_response();
        assert_eq!(r.len(), 36);
        assert_eq!(r[1], 0x80);
        assert_eq!(r[4] as usize, r.len() - 5);
        assert_eq!(&r[8..16], b"PNY     ");
    }

    #[test]
    fn request_sense_response_is_18_bytes() {
        let r = request_sense_response();
        assert_eq!(r.len(), 18);
        assert_eq!(r[0], 0x70);
        assert_eq!(r[12], 0x3a);
    }

    #[test]
    fn get_max_lun_is_zero() {
        let (mut dev, mut phy) = configured();
        dev.handle_request(&[0xa1, 0xfe, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00], &mut phy)
            .unwrap();
        assert_eq!(phy.last_ep0().unwrap(), &[0x00]);
    }

    #[test]
    fn inquiry_round_trip_through_the_worker() {
        let (mut dev, mut phy) = configured();
        let cbw = build_cbw(op::INQUIRY, &[0, 0, 0, 36, 0]);
        dev.handle_data_available(1, &cbw, &mut phy);
        // expect the data stage and the status stage
        drain_responses(&mut dev, &mut phy, 2);
        let responses: Vec<_> = phy.sent.iter().filter(|(ep, _)| *ep == 3).collect();
        assert_eq!(responses[0].1.len(), 36);
        assert_eq!(&responses[1].1[..4], b"USBS");
        assert_eq!(responses[1].1[12], 0);
        assert!(dev.signal().is_supported());
    }

    #[test]
    fn read_10_streams_sectors_then_status() {
        let (mut dev, mut phy) = configured();
        // read 2 blocks from lba 0
        let cbw = build_cbw(op::READ_10, &[0, 0, 0, 0, 0, 0, 0, 2, 0]);
        dev.handle_data_available(1, &cbw, &mut phy);
        drain_responses(&mut dev, &mut phy, 3);
        let responses: Vec<_> = phy.sent.iter().filter(|(ep, _)| *ep == 3).collect();
        assert_eq!(responses[0].1.len(), BLOCK_SIZE);
        assert_eq!(responses[1].1.len(), BLOCK_SIZE);
        assert_eq!(&responses[2].1[..4], b"USBS");
    }

    #[test]
    fn write_10_defers_status_until_data_lands() {
        let (mut dev, mut phy) = configured();
        let cbw = build_cbw(op::WRITE_10, &[0, 0, 0, 0, 1, 0, 0, 1, 0]);
        dev.handle_data_available(1, &cbw, &mut phy);
        // no status yet; the data stage follows
        dev.handle_data_available(1, &vec![0xabu8; BLOCK_SIZE], &mut phy);
        drain_responses(&mut dev, &mut phy, 1);
        let responses: Vec<_> = phy.sent.iter().filter(|(ep, _)| *ep == 3).collect();
        assert_eq!(responses.len(), 1);
        assert_eq!(&responses[0].1[..4], b"USBS");
        assert_eq!(responses[0].1[12], 0);
    }

    #[test]
    fn missing_disk_image_is_a_config_error() {
        let opts = DeviceOptions {
            vid: None,
            pid: None,
            disk_image: Some("/nonexistent/image.img".into()),
        };
        assert!(matches!(
            device(&opts, Arc::new(MutationBroker::passthrough())),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn mutated_inquiry_replaces_the_producer() {
        let mut map = std::collections::BTreeMap::new();
        map.insert("scsi_inquiry_response".to_string(), vec![0xde, 0xad]);
        let broker = Arc::new(MutationBroker::with_source(Box::new(
            crate::fuzz::StaticMutations(map),
        )));
        let opts = DeviceOptions {
            vid: None,
            pid: None,
            disk_image: Some(temp_image(16)),
        };
        let mut dev = device(&opts, broker).unwrap();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00], &mut phy)
            .unwrap();
        let cbw = build_cbw(op::INQUIRY, &[0, 0, 0, 36, 0]);
        dev.handle_data_available(1, &cbw, &mut phy);
        drain_responses(&mut dev, &mut phy, 2);
        let responses: Vec<_> = phy.sent.iter().filter(|(ep, _)| *ep == 3).collect();
        assert_eq!(responses[0].1, vec![0xde, 0xad]);
    }
}
