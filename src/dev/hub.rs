//! USB hub: hub class requests plus the hub descriptor served through the
//! device-level descriptor map. Port emulation stays at the descriptor
//! level; the status-change interrupt endpoint idles.

use std::sync::Arc;

use crate::class::UsbClass;
use crate::configuration::Configuration;
use crate::device::{Device, DeviceBuilder};
use crate::dev::DeviceOptions;
use crate::endpoint::{Endpoint, EndpointHandler};
use crate::fuzz::{MutationBroker, SessionData};
use crate::interface::Interface;
use crate::usb::{ControlRequest, Direction, TransferType, UsbClassCode};
use crate::Result;

pub struct HubClass;

impl UsbClass for HubClass {
    fn name(&self) -> &'static str {
        "hub class"
    }

    fn request_codes(&self) -> Vec<u8> {
        vec![0x00, 0x03]
    }

    fn handle(&mut self, fuzz: &MutationBroker, req: &ControlRequest) -> Option<Vec<u8>> {
        let session = SessionData::new();
        match req.setup.b_request {
            0x00 => fuzz.wrap("hub_get_hub_status_response", &session, || {
                let port = req.setup.index();
                if port != 0 {
                    log::info!("GetPortStatus ({port})");
                } else {
                    log::info!("GetHubStatus");
                }
                Some(vec![0x00, 0x00, 0x00, 0x00])
            }),
            0x03 => fuzz.wrap("hub_set_port_feature_response", &session, || {
                Some(vec![0x01])
            }),
            _ => None,
        }
    }
}

pub fn device(opts: &DeviceOptions, broker: Arc<MutationBroker>) -> Result<Device> {
    let iface = Interface::new(0, UsbClassCode::Hub as u8, 0, 0).with_endpoint(Endpoint::new(
        2,
        Direction::In,
        TransferType::Interrupt,
        0x40,
        0x40,
        EndpointHandler::In(Box::new(|_phy| {})),
    ));

    Ok(DeviceBuilder::new(
        "hub device",
        opts.vid.unwrap_or(0x05e3),
        opts.pid.unwrap_or(0x0610),
        broker,
    )
    .device_class(UsbClassCode::Hub as u8, 0, 1)
    .revision(0x7732)
    .manufacturer("Genesys Logic, Inc")
    .product("USB2.0 Hub")
    .serial("1234")
    .configuration(
        Configuration::new(1, "Emulated Hub", vec![iface])
            .with_attributes(Configuration::ATTR_SELF_POWERED),
    )
    .usb_class(Box::new(HubClass))
    .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::mock::MockPhy;

    #[test]
    fn hub_descriptor_request_is_served() {
        let mut dev = device(
            &DeviceOptions::default(),
            Arc::new(MutationBroker::passthrough()),
        )
        .unwrap();
        let mut phy = MockPhy::new();
        // GET_DESCRIPTOR(hub) as a class device request
        dev.handle_request(&[0x80, 0x06, 0x00, 0x29, 0x00, 0x00, 0xff, 0x00], &mut phy)
            .unwrap();
        let d = phy.last_ep0().unwrap();
        assert_eq!(d[0], 9);
        assert_eq!(d[1], 0x29);
        assert_eq!(d[2], 4); // ports
    }

    #[test]
    fn hub_status_is_four_zero_bytes() {
        let mut dev = device(
            &DeviceOptions::default(),
            Arc::new(MutationBroker::passthrough()),
        )
        .unwrap();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0xa0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00], &mut phy)
            .unwrap();
        assert_eq!(phy.last_ep0().unwrap(), &[0, 0, 0, 0]);
        assert!(dev.signal().is_supported());
    }
}
