//! FTDI FT232 serial (UART) chip: a vendor-request-driven device. The host
//! driver configures the UART through vendor requests on EP0 and moves data
//! over a bulk pair; we loop received data back with the modem-status
//! prefix.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::class::UsbVendor;
use crate::configuration::Configuration;
use crate::device::{Device, DeviceBuilder};
use crate::dev::DeviceOptions;
use crate::endpoint::{Endpoint, EndpointHandler};
use crate::fuzz::{MutationBroker, SessionData};
use crate::interface::Interface;
use crate::usb::{ControlRequest, Direction, TransferType};
use crate::Result;

/// FTDI vendor request handler: UART line parameters live here.
pub struct FtdiVendor {
    latency_timer: u8,
    data: u16,
    baudrate: u16,
    flow_control: u16,
    dtr: u8,
    rts: u8,
}

impl FtdiVendor {
    pub fn new() -> Self {
        Self {
            latency_timer: 0x01,
            data: 0,
            baudrate: 0,
            flow_control: 0,
            dtr: 0,
            rts: 0,
        }
    }
}

impl Default for FtdiVendor {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbVendor for FtdiVendor {
    fn name(&self) -> &'static str {
        "ftdi vendor"
    }

    fn request_codes(&self) -> Vec<u8> {
        vec![0, 1, 2, 3, 4, 5, 6, 7, 9, 10]
    }

    fn handle(&mut self, fuzz: &MutationBroker, req: &ControlRequest) -> Option<Vec<u8>> {
        let session = SessionData::new();
        let value = req.setup.value();
        match req.setup.b_request {
            0 => fuzz.wrap("ftdi_reset_response", &session, || Some(Vec::new())),
            1 => fuzz.wrap("ftdi_modem_ctrl_response", &session, || {
                self.dtr = (value & 0x0001) as u8;
                self.rts = ((value & 0x0002) >> 1) as u8;
                let dtr_enabled = value & 0x0100 != 0;
                let rts_enabled = value & 0x0200 != 0;
                if dtr_enabled {
                    log::info!("DTR is enabled, value {}", self.dtr);
                }
                if rts_enabled {
                    log::info!("RTS is enabled, value {}", self.rts);
                }
                Some(Vec::new())
            }),
            2 => fuzz.wrap("ftdi_set_flow_ctrl_response", &session, || {
                self.flow_control = value;
                match value {
                    0x0000 => log::info!("SET_FLOW_CTRL to no handshaking"),
                    v => {
                        if v & 0x0001 != 0 {
                            log::info!("SET_FLOW_CTRL for RTS/CTS handshaking");
                        }
                        if v & 0x0002 != 0 {
                            log::info!("SET_FLOW_CTRL for DTR/DSR handshaking");
                        }
                        if v & 0x0004 != 0 {
                            log::info!("SET_FLOW_CTRL for XON/XOFF handshaking");
                        }
                    }
                }
                Some(Vec::new())
            }),
            3 => fuzz.wrap("ftdi_set_baud_rate_response", &session, || {
                self.baudrate = value;
                log::info!("baudrate set to {:#x}", self.baudrate);
                Some(Vec::new())
            }),
            4 => fuzz.wrap("ftdi_set_data_response", &session, || {
                self.data = value;
                Some(Vec::new())
            }),
            5 => fuzz.wrap("ftdi_get_status_response", &session, || Some(Vec::new())),
            6 => fuzz.wrap("ftdi_set_event_char_response", &session, || Some(Vec::new())),
            7 => fuzz.wrap("ftdi_set_error_char_response", &session, || Some(Vec::new())),
            9 => fuzz.wrap("ftdi_set_latency_timer_response", &session, || {
                self.latency_timer = (value & 0xff) as u8;
                Some(Vec::new())
            }),
            10 => fuzz.wrap("ftdi_get_latency_timer_response", &session, || {
                Some(vec![self.latency_timer])
            }),
            _ => None,
        }
    }
}

pub fn device(opts: &DeviceOptions, broker: Arc<MutationBroker>) -> Result<Device> {
    // host data is echoed back on the IN endpoint behind a modem status
    // prefix, through a queue shared by the two endpoint handlers
    let txq: Arc<Mutex<VecDeque<Vec<u8>>>> = Arc::new(Mutex::new(VecDeque::new()));

    let txq_out = txq.clone();
    let out_handler = EndpointHandler::Out(Box::new(move |_phy, data| {
        log::debug!("received {} bytes on the uart bulk endpoint", data.len());
        let mut reply = vec![0x01, 0x00];
        reply.extend_from_slice(data);
        txq_out.lock().unwrap().push_back(reply);
    }));

    let txq_in = txq.clone();
    let in_handler = EndpointHandler::In(Box::new(move |phy| {
        let next = txq_in.lock().unwrap().pop_front();
        if let Some(reply) = next {
            if let Err(e) = phy.send_on_endpoint(3, &reply) {
                log::error!("failed to send uart reply: {e}");
            }
        }
    }));

    let iface = Interface::new(0, 0xff, 0xff, 0xff)
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

    Ok(DeviceBuilder::new(
        "ftdi device",
        opts.vid.unwrap_or(0x0403),
        opts.pid.unwrap_or(0x6001),
        broker,
    )
    .revision(0x0600)
    .manufacturer("Future Technology Devices International, Ltd")
    .product("FT232 Serial (UART) IC")
    .serial("FTGQOTV+")
    .configuration(
        Configuration::new(1, "FTDI", vec![iface])
            .with_attributes(Configuration::ATTR_BASE)
            .with_max_power(0x2d),
    )
    .usb_vendor(Box::new(FtdiVendor::new()))
    .build())
}
