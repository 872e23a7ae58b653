//! End-to-end control-transfer scenarios: a device template driven through
//! the engine with a recording PHY, the way a host enumerates it.

use std::collections::BTreeMap;
use std::sync::Arc;

use phantom_usb::dev::{self, DeviceOptions};
use phantom_usb::device::Device;
use phantom_usb::fuzz::{MutationBroker, StaticMutations};
use phantom_usb::phy::mock::MockPhy;
use phantom_usb::usb::DeviceState;

fn ftdi() -> Device {
    dev::build(
        "ftdi",
        &DeviceOptions::default(),
        Arc::new(MutationBroker::passthrough()),
    )
    .unwrap()
}

#[test]
fn get_device_descriptor_18_bytes() {
    let mut device = ftdi();
    let mut phy = MockPhy::new();
    device
        .handle_request(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00], &mut phy)
        .unwrap();
    let d = phy.last_ep0().unwrap();
    assert_eq!(d.len(), 18);
    assert_eq!(&d[..2], &[0x12, 0x01]);
    // bcdUSB, VID, PID, bcdDevice of the configured device
    assert_eq!(&d[2..4], &[0x00, 0x02]);
    assert_eq!(&d[8..10], &[0x03, 0x04]);
    assert_eq!(&d[10..12], &[0x01, 0x60]);
    assert_eq!(&d[12..14], &[0x00, 0x06]);
    // the last byte is the number of configurations
    assert_eq!(d[17], 1);
}

#[test]
fn eight_byte_descriptor_probe() {
    let mut device = ftdi();
    let mut phy = MockPhy::new();
    device
        .handle_request(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00], &mut phy)
        .unwrap();
    device
        .handle_request(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x08, 0x00], &mut phy)
        .unwrap();
    let responses = phy.ep0_responses();
    assert_eq!(responses[1].len(), 8);
    assert_eq!(responses[1], &responses[0][..8]);
}

#[test]
fn string_descriptor_zero_is_the_language_table() {
    let mut device = ftdi();
    let mut phy = MockPhy::new();
    device
        .handle_request(&[0x80, 0x06, 0x00, 0x03, 0x00, 0x00, 0xff, 0x00], &mut phy)
        .unwrap();
    assert_eq!(phy.last_ep0().unwrap(), &[0x04, 0x03, 0x09, 0x04]);
}

#[test]
fn set_configuration_transitions_and_acks() {
    let mut device = ftdi();
    let mut phy = MockPhy::new();
    device
        .handle_request(&[0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00], &mut phy)
        .unwrap();
    assert_eq!(device.state(), DeviceState::Configured);
    assert_eq!(device.endpoint_numbers(), vec![1, 3]);
    // the status stage is acked with zero data bytes
    assert_eq!(phy.acks, 1);
    assert!(phy.sent.is_empty());
}

#[test]
fn get_descriptor_to_other_recipient_stalls_without_hub_interface() {
    let mut device = ftdi();
    let mut phy = MockPhy::new();
    device
        .handle_request(&[0x82, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00], &mut phy)
        .unwrap();
    assert_eq!(phy.stalls, 1);
    assert!(phy.sent.is_empty());
}

#[test]
fn mutation_injection_bypasses_the_serializer() {
    let mut mutations = BTreeMap::new();
    mutations.insert(
        "device_descriptor".to_string(),
        vec![0xde, 0xad, 0xbe, 0xef],
    );
    let broker = Arc::new(MutationBroker::with_source(Box::new(StaticMutations(
        mutations,
    ))));
    let mut device = dev::build("ftdi", &DeviceOptions::default(), broker).unwrap();
    let mut phy = MockPhy::new();
    device
        .handle_request(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00], &mut phy)
        .unwrap();
    assert_eq!(phy.last_ep0().unwrap(), &[0xde, 0xad, 0xbe, 0xef]);
}

#[test]
fn full_enumeration_sequence() {
    // the request order Linux uses when a device appears
    let mut device = dev::build(
        "keyboard",
        &DeviceOptions::default(),
        Arc::new(MutationBroker::passthrough()),
    )
    .unwrap();
    let mut phy = MockPhy::new();

    // 8-byte device descriptor probe, then SET_ADDRESS
    device
        .handle_request(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x08, 0x00], &mut phy)
        .unwrap();
    device
        .handle_request(&[0x00, 0x05, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00], &mut phy)
        .unwrap();
    assert_eq!(device.state(), DeviceState::Address);

    // full device descriptor, configuration header, full configuration
    device
        .handle_request(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00], &mut phy)
        .unwrap();
    device
        .handle_request(&[0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0x09, 0x00], &mut phy)
        .unwrap();
    let header = phy.last_ep0().unwrap();
    assert_eq!(header.len(), 9);
    let total = u16::from_le_bytes([header[2], header[3]]);
    device
        .handle_request(&[0x80, 0x06, 0x00, 0x02, 0x00, 0x00, total as u8, 0x00], &mut phy)
        .unwrap();
    let full = phy.last_ep0().unwrap();
    assert_eq!(full.len(), total as usize);

    // strings, configuration selection, HID report descriptor
    device
        .handle_request(&[0x80, 0x06, 0x00, 0x03, 0x00, 0x00, 0xff, 0x00], &mut phy)
        .unwrap();
    device
        .handle_request(&[0x80, 0x06, 0x02, 0x03, 0x09, 0x04, 0xff, 0x00], &mut phy)
        .unwrap();
    device
        .handle_request(&[0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00], &mut phy)
        .unwrap();
    assert_eq!(device.state(), DeviceState::Configured);
    device
        .handle_request(&[0x81, 0x06, 0x00, 0x22, 0x00, 0x00, 0x40, 0x00], &mut phy)
        .unwrap();
    assert!(!phy.last_ep0().unwrap().is_empty());
    assert_eq!(phy.stalls, 0);
}

#[test]
fn two_enumerations_return_identical_descriptors() {
    let mut device = dev::build(
        "cdc_acm",
        &DeviceOptions::default(),
        Arc::new(MutationBroker::passthrough()),
    )
    .unwrap();
    let mut phy = MockPhy::new();
    for _ in 0..2 {
        device
            .handle_request(&[0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0xff, 0x00], &mut phy)
            .unwrap();
    }
    let responses = phy.ep0_responses();
    assert_eq!(responses[0], responses[1]);
}
