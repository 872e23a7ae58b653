//! Communication Device Class: shared pieces for the concrete CDC devices.
//! The control interface carries the class-specific functional descriptors
//! and an interrupt notification endpoint; the data interface carries the
//! bulk pair.

use std::sync::Arc;

use crate::class::UsbClass;
use crate::configuration::Configuration;
use crate::device::{Device, DeviceBuilder};
use crate::endpoint::{Endpoint, EndpointHandler, InHandler, OutHandler};
use crate::fuzz::{MutationBroker, SessionData};
use crate::interface::{CsInterfaceDescriptor, Interface};
use crate::usb::{ControlRequest, Direction, TransferType, UsbClassCode};
use crate::Result;

/// Communication class subclass codes (CDC120 table 4).
pub mod subclass {
    pub const DIRECT_LINE_CONTROL_MODEL: u8 = 0x01;
    pub const ABSTRACT_CONTROL_MODEL: u8 = 0x02;
}

/// Communication class protocol codes (CDC120 table 5).
pub mod protocol {
    pub const NONE: u8 = 0x00;
    pub const AT_COMMANDS_V250: u8 = 0x01;
}

/// Functional descriptor subtypes (CDC120 table 13).
pub mod functional {
    pub const HEADER: u8 = 0x00;
    pub const CALL_MANAGEMENT: u8 = 0x01;
    pub const ABSTRACT_CONTROL_MANAGEMENT: u8 = 0x02;
    pub const UNION: u8 = 0x06;
}

/// Class-specific notification codes (CDC120 section 6.3).
pub mod notification {
    pub const NETWORK_CONNECTION: u8 = 0x00;
    pub const SERIAL_STATE: u8 = 0x20;
}

pub const CONTROL_INTERFACE: u8 = 0;
pub const DATA_INTERFACE: u8 = 1;

/// A management notification: 8-byte header plus optional data.
pub fn build_notification(
    req_type: u8,
    notification_code: u8,
    value: u16,
    index: u16,
    data: &[u8],
) -> Vec<u8> {
    let mut n = Vec::with_capacity(data.len() + 8);
    n.push(req_type);
    n.push(notification_code);
    n.extend_from_slice(&value.to_le_bytes());
    n.extend_from_slice(&index.to_le_bytes());
    n.extend_from_slice(&(data.len() as u16).to_le_bytes());
    n.extend_from_slice(data);
    n
}

/// The CDC control requests shared by all CDC devices.
pub struct CdcClass {
    encapsulated_command: Vec<u8>,
    encapsulated_response: Vec<u8>,
}

impl CdcClass {
    pub const SEND_ENCAPSULATED_COMMAND: u8 = 0x00;
    pub const GET_ENCAPSULATED_RESPONSE: u8 = 0x01;
    pub const SET_LINE_CODING: u8 = 0x20;
    pub const GET_LINE_CODING: u8 = 0x21;
    pub const SET_CONTROL_LINE_STATE: u8 = 0x22;

    pub fn new() -> Self {
        Self {
            encapsulated_command: Vec::new(),
            encapsulated_response: Vec::new(),
        }
    }
}

impl Default for CdcClass {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbClass for CdcClass {
    fn name(&self) -> &'static str {
        "cdc class"
    }

    fn request_codes(&self) -> Vec<u8> {
        vec![
            Self::SEND_ENCAPSULATED_COMMAND,
            Self::GET_ENCAPSULATED_RESPONSE,
            Self::SET_LINE_CODING,
            Self::GET_LINE_CODING,
            Self::SET_CONTROL_LINE_STATE,
        ]
    }

    fn handle(&mut self, fuzz: &MutationBroker, req: &ControlRequest) -> Option<Vec<u8>> {
        let session = SessionData::new();
        match req.setup.b_request {
            Self::SEND_ENCAPSULATED_COMMAND => {
                self.encapsulated_command = req.data.clone();
                Some(Vec::new())
            }
            Self::GET_ENCAPSULATED_RESPONSE => {
                fuzz.wrap("cdc_get_encapsulated_response", &session, || {
                    Some(self.encapsulated_response.clone())
                })
            }
            Self::SET_LINE_CODING => Some(Vec::new()),
            Self::GET_LINE_CODING => Some(Vec::new()),
            Self::SET_CONTROL_LINE_STATE => Some(Vec::new()),
            _ => None,
        }
    }
}

/// Per-device endpoint behavior plugged into the shared CDC skeleton.
pub struct CdcEndpointHandlers {
    /// Bulk OUT (endpoint 1): host data.
    pub data_out: OutHandler,
    /// Bulk IN (endpoint 2): device data.
    pub data_in: InHandler,
    /// Interrupt IN (endpoint 3): management notifications.
    pub notify_in: InHandler,
}

impl Default for CdcEndpointHandlers {
    fn default() -> Self {
        Self {
            data_out: Box::new(|_phy, data| {
                log::debug!("discarding {} bytes of cdc data", data.len());
            }),
            data_in: Box::new(|_phy| {}),
            notify_in: Box::new(|_phy| {}),
        }
    }
}

/// Parameters for a concrete CDC device built on the shared skeleton.
pub struct CdcDeviceParams {
    pub vid: u16,
    pub pid: u16,
    pub rev: u16,
    pub control_subclass: u8,
    pub control_protocol: u8,
    pub data_protocol: u8,
    pub cs_interfaces: Vec<CsInterfaceDescriptor>,
    pub handlers: CdcEndpointHandlers,
    pub class: Box<dyn UsbClass>,
}

/// The common CDC device shape: a control interface (class 0x02) with the
/// functional descriptors and the notification endpoint, and a data
/// interface (class 0x0a) with the bulk pair.
pub fn device(params: CdcDeviceParams, broker: Arc<MutationBroker>) -> Result<Device> {
    let CdcDeviceParams {
        vid,
        pid,
        rev,
        control_subclass,
        control_protocol,
        data_protocol,
        cs_interfaces,
        handlers,
        class,
    } = params;

    let mut control_iface = Interface::new(
        CONTROL_INTERFACE,
        UsbClassCode::Cdc as u8,
        control_subclass,
        control_protocol,
    )
    .with_endpoint(Endpoint::new(
        3,
        Direction::In,
        TransferType::Interrupt,
        0x40,
        0x20,
        EndpointHandler::In(handlers.notify_in),
    ));
    for cs in cs_interfaces {
        control_iface = control_iface.with_cs_interface(cs);
    }

    let data_iface = Interface::new(
        DATA_INTERFACE,
        UsbClassCode::CdcData as u8,
        0,
        data_protocol,
    )
    .with_endpoint(Endpoint::new(
        1,
        Direction::Out,
        TransferType::Bulk,
        0x40,
        0,
        EndpointHandler::Out(handlers.data_out),
    ))
    .with_endpoint(Endpoint::new(
        2,
        Direction::In,
        TransferType::Bulk,
        0x40,
        0,
        EndpointHandler::In(handlers.data_in),
    ));

    Ok(DeviceBuilder::new("cdc device", vid, pid, broker)
        .device_class(UsbClassCode::Cdc as u8, 0, 0)
        .revision(rev)
        .manufacturer("Phantom NetSolutions")
        .product("Phantom CDC-TRON")
        .serial("PHANTOM-13337-CDC")
        .configuration(Configuration::new(
            1,
            "Emulated CDC",
            vec![control_iface, data_iface],
        ))
        .usb_class(class)
        .build())
}
