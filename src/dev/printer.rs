//! Printer device: answers GET_DEVICE_ID with an IEEE 1284 device id and
//! sinks print jobs arriving on the bulk OUT endpoint into a .pcl file.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::class::UsbClass;
use crate::configuration::Configuration;
use crate::device::{Device, DeviceBuilder};
use crate::dev::DeviceOptions;
use crate::endpoint::{Endpoint, EndpointHandler};
use crate::fuzz::{MutationBroker, SessionData};
use crate::interface::Interface;
use crate::usb::{ControlRequest, Direction, TransferType, UsbClassCode};
use crate::Result;

pub struct PrinterClass;

impl UsbClass for PrinterClass {
    fn name(&self) -> &'static str {
        "printer class"
    }

    fn request_codes(&self) -> Vec<u8> {
        vec![0x00]
    }

    fn handle(&mut self, fuzz: &MutationBroker, req: &ControlRequest) -> Option<Vec<u8>> {
        match req.setup.b_request {
            0x00 => fuzz.wrap("get_device_id_response", &SessionData::new(), || {
                let device_id = [
                    ("MFG", "Hewlett-Packard"),
                    ("CMD", "PJL,PML,PCLXL,POSTSCRIPT,PCL"),
                    ("MDL", "HP Color LaserJet CP1515n"),
                    ("CLS", "PRINTER"),
                    ("DES", "Hewlett-Packard Color LaserJet CP1515n"),
                    ("MEM", "MEM=55MB"),
                    ("COMMENT", "RES=600x8"),
                ]
                .iter()
                .map(|(k, v)| format!("{k}:{v};"))
                .collect::<String>();
                // length prefix is big-endian per IEEE 1284
                let mut response = (device_id.len() as u16).to_be_bytes().to_vec();
                response.extend_from_slice(device_id.as_bytes());
                Some(response)
            }),
            _ => None,
        }
    }
}

pub fn device(opts: &DeviceOptions, broker: Arc<MutationBroker>) -> Result<Device> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let filename = format!("print-job-{secs}.pcl");
    let mut writing = false;

    let out_handler = EndpointHandler::Out(Box::new(move |_phy, data| {
        if !writing {
            log::info!("writing PCL file: {filename}");
            writing = true;
        }
        let write = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&filename)
            .and_then(|mut f| f.write_all(data));
        if let Err(e) = write {
            log::error!("failed to sink print data: {e}");
        }
        if data.windows(4).any(|w| w == b"EOJ\n") {
            log::info!("file write complete");
            writing = false;
        }
    }));

    let iface = Interface::new(0, UsbClassCode::Printer as u8, 0x01, 0x02)
        .with_endpoint(Endpoint::new(
            1,
            Direction::Out,
            TransferType::Bulk,
            0x40,
            0,
            out_handler,
        ))
        .with_endpoint(Endpoint::new(
            2,
            Direction::In,
            TransferType::Bulk,
            0x40,
            0,
            EndpointHandler::Idle,
        ));

    Ok(DeviceBuilder::new(
        "printer device",
        opts.vid.unwrap_or(0x03f0),
        opts.pid.unwrap_or(0x4417),
        broker,
    )
    .revision(0x0001)
    .manufacturer("Hewlett-Packard")
    .product("HP Color LaserJet CP1515n")
    .serial("00CNC2618971")
    .configuration(Configuration::new(1, "Printer", vec![iface]))
    .usb_class(Box::new(PrinterClass))
    .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::mock::MockPhy;

    #[test]
    fn device_id_has_big_endian_length_prefix() {
        let mut dev = device(
            &DeviceOptions::default(),
            Arc::new(MutationBroker::passthrough()),
        )
        .unwrap();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0xa1, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x00], &mut phy)
            .unwrap();
        let d = phy.last_ep0().unwrap();
        let len = u16::from_be_bytes([d[0], d[1]]) as usize;
        assert_eq!(len, d.len() - 2);
        let text = std::str::from_utf8(&d[2..]).unwrap();
        assert!(text.starts_with("MFG:Hewlett-Packard;"));
        assert!(text.ends_with(';'));
    }
}
