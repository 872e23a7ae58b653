//! CDC Abstract Control Model device (a serial modem). AT commands arriving
//! on the bulk OUT endpoint are split on carriage returns and logged; the
//! notification endpoint raises one network-connection notification.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::dev::cdc::{
    self, build_notification, CdcClass, CdcDeviceParams, CdcEndpointHandlers,
};
use crate::dev::DeviceOptions;
use crate::device::Device;
use crate::fuzz::MutationBroker;
use crate::interface::CsInterfaceDescriptor;
use crate::Result;

pub fn device(opts: &DeviceOptions, broker: Arc<MutationBroker>) -> Result<Device> {
    let bm_capabilities = 0x01u8;
    let cs_interfaces = vec![
        // header functional descriptor, bcdCDC 1.10
        CsInterfaceDescriptor::new(cdc::functional::HEADER, &[0x10, 0x01]),
        // call management functional descriptor
        CsInterfaceDescriptor::new(
            cdc::functional::CALL_MANAGEMENT,
            &[bm_capabilities, cdc::DATA_INTERFACE],
        ),
        // abstract control management functional descriptor
        CsInterfaceDescriptor::new(
            cdc::functional::ABSTRACT_CONTROL_MANAGEMENT,
            &[bm_capabilities],
        ),
        // union functional descriptor
        CsInterfaceDescriptor::new(
            cdc::functional::UNION,
            &[cdc::CONTROL_INTERFACE, cdc::DATA_INTERFACE],
        ),
    ];

    // AT commands are line-buffered; print them only on a full line
    let receive_buffer: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let data_out = Box::new(move |_phy: &mut dyn crate::phy::PhyIo, data: &[u8]| {
        let mut buffer = receive_buffer.lock().unwrap();
        buffer.extend_from_slice(data);
        while let Some(pos) = buffer.iter().position(|&b| b == b'\r') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            log::info!(
                "received line: {}",
                String::from_utf8_lossy(&line[..line.len() - 1])
            );
        }
    });

    let notify_broker = broker.clone();
    let notified = AtomicBool::new(false);
    let notify_in = Box::new(move |phy: &mut dyn crate::phy::PhyIo| {
        if notified.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("sending network connection notification");
        let response = notify_broker.produce_plain("cdc_notification", || {
            build_notification(
                0xa1,
                cdc::notification::NETWORK_CONNECTION,
                1,
                cdc::DATA_INTERFACE as u16,
                &[],
            )
        });
        if let Err(e) = phy.send_on_endpoint(3, &response) {
            log::error!("failed to send cdc notification: {e}");
        }
    });

    cdc::device(
        CdcDeviceParams {
            vid: opts.vid.unwrap_or(0x2548),
            pid: opts.pid.unwrap_or(0x1001),
            rev: 0x0010,
            control_subclass: cdc::subclass::ABSTRACT_CONTROL_MODEL,
            control_protocol: cdc::protocol::AT_COMMANDS_V250,
            data_protocol: cdc::protocol::NONE,
            cs_interfaces,
            handlers: CdcEndpointHandlers {
                data_out,
                data_in: Box::new(|_phy| {}),
                notify_in,
            },
            class: Box::new(CdcClass::new()),
        },
        broker,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phy::mock::MockPhy;
    use crate::usb::DeviceState;

    fn configured() -> (Device, MockPhy) {
        let mut dev = device(
            &DeviceOptions::default(),
            Arc::new(MutationBroker::passthrough()),
        )
        .unwrap();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00], &mut phy)
            .unwrap();
        assert_eq!(dev.state(), DeviceState::Configured);
        (dev, phy)
    }

    #[test]
    fn configuration_carries_functional_descriptors() {
        let dev = device(
            &DeviceOptions::default(),
            Arc::new(MutationBroker::passthrough()),
        )
        .unwrap();
        let d = dev.descriptor_response(0x02, 0).unwrap();
        // four class-specific interface descriptors in the block
        let count = d.windows(2).filter(|w| w[1] == 0x24).count();
        assert_eq!(count, 4);
        // header functional descriptor right after the control interface
        assert_eq!(&d[9 + 9..9 + 9 + 5], &[0x05, 0x24, 0x00, 0x10, 0x01]);
    }

    #[test]
    fn set_line_coding_is_acked() {
        let (mut dev, mut phy) = configured();
        dev.handle_request(
            &[0x21, 0x20, 0x00, 0x00, 0x00, 0x00, 0x07, 0x00, /* line coding */ 0x80, 0x25, 0x00, 0x00, 0x00, 0x00, 0x08],
            &mut phy,
        )
        .unwrap();
        assert_eq!(phy.last_ep0().unwrap(), &[] as &[u8]);
        assert!(dev.signal().is_supported());
    }

    #[test]
    fn notification_endpoint_fires_once() {
        let (mut dev, mut phy) = configured();
        dev.handle_buffer_available(3, &mut phy);
        dev.handle_buffer_available(3, &mut phy);
        let notifications: Vec<_> = phy.sent.iter().filter(|(ep, _)| *ep == 3).collect();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].1[..2], [0xa1, 0x00]);
    }

    #[test]
    fn encapsulated_response_is_empty_by_default() {
        let (mut dev, mut phy) = configured();
        dev.handle_request(&[0xa1, 0x01, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00], &mut phy)
            .unwrap();
        assert_eq!(phy.last_ep0().unwrap(), &[] as &[u8]);
    }
}
