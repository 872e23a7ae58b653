//! HID boot keyboard. The interface carries a HID descriptor in the
//! configuration block and serves the report descriptor on
//! interface-recipient GET_DESCRIPTOR; the interrupt IN endpoint types a
//! short scripted text, one key per poll.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use packed_struct::prelude::*;

use crate::class::UsbClass;
use crate::configuration::Configuration;
use crate::device::{Device, DeviceBuilder};
use crate::dev::DeviceOptions;
use crate::endpoint::{Endpoint, EndpointHandler};
use crate::fuzz::{MutationBroker, SessionData};
use crate::interface::Interface;
use crate::usb::{
    ControlRequest, DescriptorType, Direction, HidDescriptor, TransferType, UsbClassCode,
};
use crate::Result;

/// Boot keyboard report descriptor: 8 modifier bits, 8 reserved bits,
/// 5 LED bits + 3 padding, and six key slots.
const REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x01, // usage page (generic desktop)
    0x09, 0x06, // usage (keyboard)
    0xa1, 0x01, // collection (application)
    0x05, 0x07, //   usage page (key codes)
    0x19, 0xe0, //   usage minimum (224)
    0x29, 0xe7, //   usage maximum (231)
    0x15, 0x00, //   logical minimum (0)
    0x25, 0x01, //   logical maximum (1)
    0x75, 0x01, //   report size (1)
    0x95, 0x08, //   report count (8)
    0x81, 0x02, //   input (data, variable, absolute)
    0x95, 0x01, //   report count (1)
    0x75, 0x08, //   report size (8)
    0x81, 0x01, //   input (constant)
    0x95, 0x05, //   report count (5)
    0x75, 0x01, //   report size (1)
    0x05, 0x08, //   usage page (LEDs)
    0x19, 0x01, //   usage minimum (1)
    0x29, 0x05, //   usage maximum (5)
    0x91, 0x02, //   output (data, variable, absolute)
    0x95, 0x01, //   report count (1)
    0x75, 0x03, //   report size (3)
    0x91, 0x01, //   output (constant)
    0x95, 0x06, //   report count (6)
    0x75, 0x08, //   report size (8)
    0x15, 0x00, //   logical minimum (0)
    0x25, 0x65, //   logical maximum (101)
    0x05, 0x07, //   usage page (key codes)
    0x19, 0x00, //   usage minimum (0)
    0x29, 0x65, //   usage maximum (101)
    0x81, 0x00, //   input (data, array)
    0xc0, // end collection
];

/// The HID descriptor embedded in the configuration block: 6-byte header
/// plus one 3-byte entry for the report descriptor.
fn hid_descriptor() -> Vec<u8> {
    let mut d = HidDescriptor {
        b_length: 9,
        b_descriptor_type: DescriptorType::Hid as u8,
        bcd_hid: Integer::from_primitive(0x0110),
        b_country_code: 0,
        b_num_descriptors: 1,
    }
    .pack()
    .unwrap()
    .to_vec();
    d.push(DescriptorType::Report as u8);
    d.extend_from_slice(&(REPORT_DESCRIPTOR.len() as u16).to_le_bytes());
    d
}

/// HID class requests for the boot keyboard.
pub struct HidClass {
    idle_rate: u8,
    protocol: u8,
}

impl HidClass {
    pub fn new() -> Self {
        Self {
            idle_rate: 0,
            protocol: 1,
        }
    }
}

impl Default for HidClass {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbClass for HidClass {
    fn name(&self) -> &'static str {
        "hid class"
    }

    fn request_codes(&self) -> Vec<u8> {
        vec![0x01, 0x02, 0x03, 0x09, 0x0a, 0x0b]
    }

    fn handle(&mut self, fuzz: &MutationBroker, req: &ControlRequest) -> Option<Vec<u8>> {
        let session = SessionData::new();
        match req.setup.b_request {
            // GET_REPORT: an empty boot report
            0x01 => fuzz.wrap("hid_get_report_response", &session, || Some(vec![0u8; 8])),
            0x02 => fuzz.wrap("hid_get_idle_response", &session, || {
                Some(vec![self.idle_rate])
            }),
            0x03 => fuzz.wrap("hid_get_protocol_response", &session, || {
                Some(vec![self.protocol])
            }),
            0x09 => fuzz.wrap("hid_set_report_response", &session, || Some(Vec::new())),
            0x0a => fuzz.wrap("hid_set_idle_response", &session, || {
                self.idle_rate = (req.setup.value() >> 8) as u8;
                Some(Vec::new())
            }),
            0x0b => fuzz.wrap("hid_set_protocol_response", &session, || {
                self.protocol = (req.setup.value() & 0xff) as u8;
                Some(Vec::new())
            }),
            _ => None,
        }
    }
}

/// Key reports that type the given ASCII text: press and release per
/// character.
fn keystroke_reports(text: &str) -> VecDeque<Vec<u8>> {
    let mut reports = VecDeque::new();
    for c in text.chars() {
        let (modifier, code) = match c {
            'a'..='z' => (0x00, c as u8 - b'a' + 0x04),
            'A'..='Z' => (0x02, c.to_ascii_lowercase() as u8 - b'a' + 0x04),
            '1'..='9' => (0x00, c as u8 - b'1' + 0x1e),
            '0' => (0x00, 0x27),
            ' ' => (0x00, 0x2c),
            '\n' => (0x00, 0x28),
            _ => continue,
        };
        reports.push_back(vec![modifier, 0x00, code, 0x00, 0x00, 0x00, 0x00, 0x00]);
        reports.push_back(vec![0u8; 8]);
    }
    reports
}

pub fn device(opts: &DeviceOptions, broker: Arc<MutationBroker>) -> Result<Device> {
    let reports = Arc::new(Mutex::new(keystroke_reports("phantom usb\n")));
    let in_handler = EndpointHandler::In(Box::new(move |phy| {
        let next = reports.lock().unwrap().pop_front();
        if let Some(report) = next {
            if let Err(e) = phy.send_on_endpoint(2, &report) {
                log::error!("failed to send key report: {e}");
            }
        }
    }));

    let iface = Interface::new(0, UsbClassCode::Hid as u8, 0x01, 0x01)
        .with_embedded_class_descriptor(hid_descriptor())
        .with_descriptor(
            DescriptorType::Hid as u8,
            "hid_descriptor",
            hid_descriptor(),
        )
        .with_descriptor(
            DescriptorType::Report as u8,
            "hid_report_descriptor",
            REPORT_DESCRIPTOR.to_vec(),
        )
        .with_endpoint(Endpoint::new(
            2,
            Direction::In,
            TransferType::Interrupt,
            0x08,
            0x0a,
            in_handler,
        ));

    Ok(DeviceBuilder::new(
        "keyboard device",
        opts.vid.unwrap_or(0x413c),
        opts.pid.unwrap_or(0x2107),
        broker,
    )
    .manufacturer("Dell")
    .product("Dell USB Entry Keyboard")
    .serial("00000000")
    .configuration(Configuration::new(1, "Emulated Keyboard", vec![iface]))
    .usb_class(Box::new(HidClass::new()))
    .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::mock::MockPhy;

    fn configured() -> (Device, MockPhy) {
        let mut dev = device(
            &DeviceOptions::default(),
            Arc::new(MutationBroker::passthrough()),
        )
        .unwrap();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00], &mut phy)
            .unwrap();
        (dev, phy)
    }

    #[test]
    fn hid_descriptor_is_nine_bytes_with_report_entry() {
        let d = hid_descriptor();
        assert_eq!(d.len(), 9);
        assert_eq!(d[0], 9);
        assert_eq!(d[1], 0x21);
        assert_eq!(d[6], 0x22);
        assert_eq!(
            u16::from_le_bytes([d[7], d[8]]),
            REPORT_DESCRIPTOR.len() as u16
        );
    }

    #[test]
    fn report_descriptor_served_at_interface_recipient() {
        let (mut dev, mut phy) = configured();
        // GET_DESCRIPTOR(report) to interface 0
        dev.handle_request(&[0x81, 0x06, 0x00, 0x22, 0x00, 0x00, 0xff, 0x00], &mut phy)
            .unwrap();
        assert_eq!(phy.last_ep0().unwrap(), REPORT_DESCRIPTOR);
    }

    #[test]
    fn set_then_get_idle() {
        let (mut dev, mut phy) = configured();
        // SET_IDLE with duration 0x20 in the high byte of wValue
        dev.handle_request(&[0x21, 0x0a, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00], &mut phy)
            .unwrap();
        dev.handle_request(&[0xa1, 0x02, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00], &mut phy)
            .unwrap();
        assert_eq!(phy.last_ep0().unwrap(), &[0x20]);
    }

    #[test]
    fn interrupt_endpoint_types_keys() {
        let (mut dev, mut phy) = configured();
        dev.handle_buffer_available(2, &mut phy);
        let (ep, report) = phy.sent.last().unwrap();
        assert_eq!(*ep, 2);
        assert_eq!(report.len(), 8);
        // 'p'
        assert_eq!(report[2], b'p' - b'a' + 0x04);
        // key release follows
        dev.handle_buffer_available(2, &mut phy);
        assert_eq!(phy.sent.last().unwrap().1, vec![0u8; 8]);
    }

    #[test]
    fn configuration_embeds_the_hid_descriptor() {
        let dev = device(
            &DeviceOptions::default(),
            Arc::new(MutationBroker::passthrough()),
        )
        .unwrap();
        let d = dev.descriptor_response(0x02, 0).unwrap();
        // interface header at 9, hid descriptor at 18
        assert_eq!(d[18], 9);
        assert_eq!(d[19], 0x21);
    }
}
