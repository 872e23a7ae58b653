//! Interface model: descriptor header, nested endpoints, class-specific
//! interface descriptors, and the interface-recipient standard requests.

use std::collections::HashMap;

use packed_struct::prelude::*;

use crate::endpoint::Endpoint;
use crate::fuzz::{MutationBroker, SessionData};
use crate::phy::PhyIo;
use crate::usb::{
    ControlRequest, DescriptorType, InterfaceDescriptor, Speed, StandardRequest,
};
use crate::Result;

/// A class-specific interface descriptor: `{length, 0x24, subtype, payload}`.
/// Carries CDC functional descriptors, audio control topology and the like.
#[derive(Debug, Clone)]
pub struct CsInterfaceDescriptor {
    pub subtype: u8,
    pub payload: Vec<u8>,
}

impl CsInterfaceDescriptor {
    pub fn new(subtype: u8, payload: &[u8]) -> Self {
        Self {
            subtype,
            payload: payload.to_vec(),
        }
    }

    pub fn descriptor(&self, fuzz: &MutationBroker) -> Vec<u8> {
        fuzz.produce_plain("usbcsinterface_descriptor", || self.raw())
    }

    fn raw(&self) -> Vec<u8> {
        let mut d = Vec::with_capacity(self.payload.len() + 3);
        d.push((self.payload.len() + 3) as u8);
        d.push(DescriptorType::CsInterface as u8);
        d.push(self.subtype);
        d.extend_from_slice(&self.payload);
        d
    }
}

/// A descriptor served on interface-recipient GET_DESCRIPTOR, keyed by the
/// descriptor type byte (HID descriptor 0x21, HID report 0x22).
pub struct InterfaceClassDescriptor {
    pub stage: &'static str,
    pub bytes: Vec<u8>,
}

/// One interface of a configuration.
pub struct Interface {
    pub number: u8,
    pub alternate: u8,
    pub iface_class: u8,
    pub iface_subclass: u8,
    pub iface_protocol: u8,
    pub string_index: u8,
    pub endpoints: Vec<Endpoint>,
    pub cs_interfaces: Vec<CsInterfaceDescriptor>,
    /// Class descriptor embedded between the interface header and the
    /// class-specific/endpoint block (the HID descriptor lives here).
    pub embedded_class_descriptor: Option<Vec<u8>>,
    /// Descriptors reachable through interface-recipient GET_DESCRIPTOR.
    descriptors: HashMap<u8, InterfaceClassDescriptor>,
}

impl Interface {
    pub fn new(number: u8, iface_class: u8, iface_subclass: u8, iface_protocol: u8) -> Self {
        Self {
            number,
            alternate: 0,
            iface_class,
            iface_subclass,
            iface_protocol,
            string_index: 0,
            endpoints: Vec::new(),
            cs_interfaces: Vec::new(),
            embedded_class_descriptor: None,
            descriptors: HashMap::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn with_cs_interface(mut self, cs: CsInterfaceDescriptor) -> Self {
        self.cs_interfaces.push(cs);
        self
    }

    pub fn with_alternate(mut self, alternate: u8) -> Self {
        self.alternate = alternate;
        self
    }

    pub fn with_embedded_class_descriptor(mut self, bytes: Vec<u8>) -> Self {
        self.embedded_class_descriptor = Some(bytes);
        self
    }

    /// Register a descriptor for interface-recipient GET_DESCRIPTOR.
    pub fn with_descriptor(mut self, dtype: u8, stage: &'static str, bytes: Vec<u8>) -> Self {
        self.descriptors
            .insert(dtype, InterfaceClassDescriptor { stage, bytes });
        self
    }

    /// The interface header plus its embedded class descriptor,
    /// class-specific interface descriptors and endpoint descriptors, as one
    /// contiguous block ready for inclusion in a configuration response.
    pub fn descriptor(&self, speed: Speed, valid: bool, fuzz: &MutationBroker) -> Vec<u8> {
        let produce = || {
            let mut d = InterfaceDescriptor {
                b_length: 9,
                b_descriptor_type: DescriptorType::Interface as u8,
                b_interface_number: self.number,
                b_alternate_setting: self.alternate,
                b_num_endpoints: self.endpoints.len() as u8,
                b_interface_class: self.iface_class,
                b_interface_subclass: self.iface_subclass,
                b_interface_protocol: self.iface_protocol,
                i_interface: self.string_index,
            }
            .pack()
            .unwrap()
            .to_vec();
            if let Some(class_desc) = &self.embedded_class_descriptor {
                d.extend_from_slice(class_desc);
            }
            for cs in &self.cs_interfaces {
                if valid {
                    d.extend_from_slice(&cs.raw());
                } else {
                    d.extend_from_slice(&cs.descriptor(fuzz));
                }
            }
            for ep in &self.endpoints {
                d.extend_from_slice(&ep.descriptor(speed, valid, fuzz));
            }
            d
        };
        if valid {
            produce()
        } else {
            fuzz.produce("interface_descriptor", &SessionData::new(), produce)
        }
    }

    /// Standard interface-recipient requests: GET_DESCRIPTOR against the
    /// interface's class descriptor table, and SET_INTERFACE. Returns
    /// `Ok(None)` when the request code is unserviced (caller stalls).
    pub fn handle_standard_request(
        &mut self,
        fuzz: &MutationBroker,
        req: &ControlRequest,
        phy: &mut dyn PhyIo,
    ) -> Result<Option<()>> {
        match StandardRequest::from_primitive(req.setup.b_request) {
            Some(StandardRequest::GetDescriptor) => {
                let dtype = req.setup.descriptor_type();
                let dindex = req.setup.descriptor_index();
                log::debug!(
                    "interface {} GET_DESCRIPTOR type {dtype:#04x} index {dindex}",
                    self.number
                );
                match self.descriptors.get(&dtype) {
                    Some(entry) => {
                        let mut response =
                            fuzz.produce_plain(entry.stage, || entry.bytes.clone());
                        response.truncate(req.setup.length() as usize);
                        phy.send_on_endpoint(0, &response)?;
                        Ok(Some(()))
                    }
                    None => {
                        log::warn!(
                            "interface {} has no descriptor of type {dtype:#04x}",
                            self.number
                        );
                        Ok(None)
                    }
                }
            }
            Some(StandardRequest::SetInterface) => {
                log::debug!("SET_INTERFACE on interface {}", self.number);
                phy.send_on_endpoint(0, &[])?;
                Ok(Some(()))
            }
            _ => Ok(None),
        }
    }

    /// Request codes serviced at the interface recipient, for the stall log.
    pub fn request_codes(&self) -> Vec<u8> {
        vec![
            StandardRequest::GetDescriptor as u8,
            StandardRequest::SetInterface as u8,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointHandler;
    use crate::usb::{Direction, TransferType};

    fn iface_with_two_endpoints() -> Interface {
        Interface::new(0, 0xff, 0xff, 0xff)
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
            ))
    }

    #[test]
    fn num_endpoints_matches_endpoint_list() {
        let fuzz = MutationBroker::passthrough();
        let d = iface_with_two_endpoints().descriptor(Speed::Full, false, &fuzz);
        assert_eq!(d[0], 9);
        assert_eq!(d[1], 0x04);
        assert_eq!(d[4], 2);
        // header + two endpoint descriptors
        assert_eq!(d.len(), 9 + 7 + 7);
    }

    #[test]
    fn cs_interface_descriptor_shape() {
        let cs = CsInterfaceDescriptor::new(0x00, &[0x10, 0x01]);
        assert_eq!(cs.raw(), vec![0x05, 0x24, 0x00, 0x10, 0x01]);
    }

    #[test]
    fn cs_interfaces_serialize_before_endpoints() {
        let fuzz = MutationBroker::passthrough();
        let iface = iface_with_two_endpoints()
            .with_cs_interface(CsInterfaceDescriptor::new(0x00, &[0x10, 0x01]));
        let d = iface.descriptor(Speed::Full, false, &fuzz);
        assert_eq!(d[9], 0x05);
        assert_eq!(d[10], 0x24);
        assert_eq!(d[14], 0x07);
        assert_eq!(d[15], 0x05);
    }
}
