//! Vendor-specific device for driver scanning: every class and vendor
//! request code is acknowledged, so any host driver that binds to the
//! VID/PID and issues a control request trips the supported signal.

use std::sync::Arc;

use crate::class::{UsbClass, UsbVendor};
use crate::configuration::Configuration;
use crate::device::{Device, DeviceBuilder};
use crate::dev::DeviceOptions;
use crate::endpoint::{Endpoint, EndpointHandler};
use crate::fuzz::MutationBroker;
use crate::interface::Interface;
use crate::usb::{ControlRequest, Direction, TransferType, UsbClassCode};
use crate::Result;

pub struct GenericClass;

impl UsbClass for GenericClass {
    fn name(&self) -> &'static str {
        "generic class"
    }

    fn request_codes(&self) -> Vec<u8> {
        (0..=0xff).collect()
    }

    fn handle(&mut self, _fuzz: &MutationBroker, req: &ControlRequest) -> Option<Vec<u8>> {
        log::info!("generic class handler: {}", req.setup.describe());
        Some(Vec::new())
    }
}

pub struct GenericVendor;

impl UsbVendor for GenericVendor {
    fn name(&self) -> &'static str {
        "generic vendor"
    }

    fn request_codes(&self) -> Vec<u8> {
        (0..=0xff).collect()
    }

    fn handle(&mut self, _fuzz: &MutationBroker, req: &ControlRequest) -> Option<Vec<u8>> {
        log::info!("generic vendor handler: {}", req.setup.describe());
        Some(Vec::new())
    }
}

fn endpoint(number: u8, direction: Direction, transfer_type: TransferType) -> Endpoint {
    Endpoint::new(number, direction, transfer_type, 0x40, 1, EndpointHandler::Idle)
}

pub fn device(opts: &DeviceOptions, broker: Arc<MutationBroker>) -> Result<Device> {
    let vid = opts.vid.unwrap_or(0x1234);
    let pid = opts.pid.unwrap_or(0x5678);

    // interface number must stay zero for btusb-style drivers
    let iface = Interface::new(0, UsbClassCode::VendorSpecific as u8, 1, 1)
        .with_endpoint(endpoint(1, Direction::In, TransferType::Interrupt))
        .with_endpoint(endpoint(1, Direction::Out, TransferType::Interrupt))
        .with_endpoint(endpoint(2, Direction::In, TransferType::Bulk))
        .with_endpoint(endpoint(2, Direction::Out, TransferType::Bulk))
        .with_endpoint(endpoint(3, Direction::In, TransferType::Isochronous))
        .with_endpoint(endpoint(3, Direction::Out, TransferType::Isochronous));

    let manufacturer = format!("phantom vendor {vid:04x}");
    let product = format!("phantom product {pid:04x}");
    Ok(DeviceBuilder::new("vendor specific device", vid, pid, broker)
        .device_class(UsbClassCode::VendorSpecific as u8, 1, 1)
        .revision(0x0001)
        .manufacturer(&manufacturer)
        .product(&product)
        .serial("123456")
        .configuration(
            Configuration::new(1, "Vendor Specific Conf", vec![iface])
                .with_attributes(Configuration::ATTR_SELF_POWERED),
        )
        .usb_class(Box::new(GenericClass))
        .usb_vendor(Box::new(GenericVendor))
        .build())
}
