//! Endpoint model: direction, transfer type, per-direction handler and
//! class-specific endpoint descriptors.

use packed_struct::prelude::*;

use crate::fuzz::{MutationBroker, SessionData};
use crate::phy::PhyIo;
use crate::usb::{
    DescriptorType, Direction, EndpointDescriptor, Speed, SyncType, TransferType, UsageType,
};
use crate::Result;

/// High-speed bulk endpoints always report a 512-byte max packet.
pub const HS_BULK_MAX_PACKET: u16 = 512;

/// Handler invoked when an OUT endpoint delivers host data.
pub type OutHandler = Box<dyn FnMut(&mut dyn PhyIo, &[u8]) + Send>;

/// Handler invoked when the PHY has buffer space on an IN endpoint.
pub type InHandler = Box<dyn FnMut(&mut dyn PhyIo) + Send>;

/// Direction-specific endpoint behavior. Idle endpoints are legal; they
/// simply never move data.
pub enum EndpointHandler {
    Idle,
    Out(OutHandler),
    In(InHandler),
}

/// A class-specific endpoint descriptor: `{length, 0x25, subtype, payload}`.
#[derive(Debug, Clone)]
pub struct CsEndpointDescriptor {
    pub subtype: u8,
    pub payload: Vec<u8>,
}

impl CsEndpointDescriptor {
    pub fn new(subtype: u8, payload: &[u8]) -> Self {
        Self {
            subtype,
            payload: payload.to_vec(),
        }
    }

    pub fn descriptor(&self, fuzz: &MutationBroker) -> Vec<u8> {
        fuzz.produce_plain("usbcsendpoint_descriptor", || self.raw())
    }

    fn raw(&self) -> Vec<u8> {
        let mut d = Vec::with_capacity(self.payload.len() + 3);
        d.push((self.payload.len() + 3) as u8);
        d.push(DescriptorType::CsEndpoint as u8);
        d.push(self.subtype);
        d.extend_from_slice(&self.payload);
        d
    }
}

/// One endpoint of an interface.
pub struct Endpoint {
    pub number: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub sync_type: SyncType,
    pub usage_type: UsageType,
    pub max_packet_size: u16,
    pub interval: u8,
    pub cs_endpoints: Vec<CsEndpointDescriptor>,
    pub handler: EndpointHandler,
}

impl Endpoint {
    pub fn new(
        number: u8,
        direction: Direction,
        transfer_type: TransferType,
        max_packet_size: u16,
        interval: u8,
        handler: EndpointHandler,
    ) -> Self {
        Self {
            number,
            direction,
            transfer_type,
            sync_type: SyncType::NoSync,
            usage_type: UsageType::Data,
            max_packet_size,
            interval,
            cs_endpoints: Vec::new(),
            handler,
        }
    }

    pub fn with_sync_type(mut self, sync_type: SyncType) -> Self {
        self.sync_type = sync_type;
        self
    }

    pub fn with_cs_endpoint(mut self, cs: CsEndpointDescriptor) -> Self {
        self.cs_endpoints.push(cs);
        self
    }

    /// bEndpointAddress: number in the low nibble, direction in bit 7.
    pub fn address(&self) -> u8 {
        (self.number & 0x0f) | ((self.direction as u8) << 7)
    }

    pub fn max_packet_size_at(&self, speed: Speed) -> u16 {
        if speed == Speed::High && self.transfer_type == TransferType::Bulk {
            HS_BULK_MAX_PACKET
        } else {
            self.max_packet_size
        }
    }

    fn attributes(&self) -> u8 {
        (self.transfer_type as u8 & 0x03)
            | ((self.sync_type as u8 & 0x03) << 2)
            | ((self.usage_type as u8 & 0x03) << 4)
    }

    /// The 7-byte endpoint descriptor followed by any class-specific
    /// endpoint descriptors.
    pub fn descriptor(&self, speed: Speed, valid: bool, fuzz: &MutationBroker) -> Vec<u8> {
        let produce = || {
            let mut d = self.wire_descriptor(speed);
            for cs in &self.cs_endpoints {
                if valid {
                    d.extend_from_slice(&cs.raw());
                } else {
                    d.extend_from_slice(&cs.descriptor(fuzz));
                }
            }
            d
        };
        if valid {
            produce()
        } else {
            fuzz.produce("endpoint_descriptor", &SessionData::new(), produce)
        }
    }

    /// Just the 7 canonical bytes, without class-specific descriptors. Used
    /// when programming kernel gadget endpoint files.
    pub fn wire_descriptor(&self, speed: Speed) -> Vec<u8> {
        EndpointDescriptor {
            b_length: 7,
            b_descriptor_type: DescriptorType::Endpoint as u8,
            b_endpoint_address: self.address(),
            bm_attributes: self.attributes(),
            w_max_packet_size: Integer::from_primitive(self.max_packet_size_at(speed)),
            b_interval: self.interval,
        }
        .pack()
        .unwrap()
        .to_vec()
    }

    /// Standard endpoint-recipient requests: GET_STATUS and CLEAR_FEATURE.
    /// Anything else is unserviced and the caller stalls.
    pub fn handle_standard_request(
        &mut self,
        request: u8,
        phy: &mut dyn PhyIo,
    ) -> Result<Option<()>> {
        match request {
            0x00 => {
                log::debug!("GET_STATUS on endpoint {}", self.number);
                phy.send_on_endpoint(0, &[0x00, 0x00])?;
                Ok(Some(()))
            }
            0x01 => {
                log::debug!("CLEAR_FEATURE on endpoint {}", self.number);
                phy.send_on_endpoint(0, &[])?;
                Ok(Some(()))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk_out() -> Endpoint {
        Endpoint::new(
            1,
            Direction::Out,
            TransferType::Bulk,
            0x40,
            0,
            EndpointHandler::Idle,
        )
    }

    #[test]
    fn address_encodes_direction() {
        assert_eq!(bulk_out().address(), 0x01);
        let ep_in = Endpoint::new(
            3,
            Direction::In,
            TransferType::Interrupt,
            0x40,
            0x20,
            EndpointHandler::Idle,
        );
        assert_eq!(ep_in.address(), 0x83);
    }

    #[test]
    fn high_speed_bulk_is_512() {
        let fuzz = MutationBroker::passthrough();
        let ep = bulk_out();
        let fs = ep.descriptor(Speed::Full, false, &fuzz);
        let hs = ep.descriptor(Speed::High, false, &fuzz);
        assert_eq!(&fs[4..6], &[0x40, 0x00]);
        assert_eq!(&hs[4..6], &[0x00, 0x02]);
    }

    #[test]
    fn interrupt_endpoint_keeps_its_packet_size_at_high_speed() {
        let ep = Endpoint::new(
            2,
            Direction::In,
            TransferType::Interrupt,
            0x40,
            0x0a,
            EndpointHandler::Idle,
        );
        assert_eq!(ep.max_packet_size_at(Speed::High), 0x40);
    }

    #[test]
    fn cs_endpoint_descriptor_shape() {
        let cs = CsEndpointDescriptor::new(0x01, &[0x01, 0x01, 0x01, 0x00]);
        assert_eq!(cs.raw(), vec![0x07, 0x25, 0x01, 0x01, 0x01, 0x01, 0x00]);
    }

    #[test]
    fn endpoint_descriptor_appends_cs_block() {
        let fuzz = MutationBroker::passthrough();
        let ep = Endpoint::new(
            1,
            Direction::In,
            TransferType::Isochronous,
            0x100,
            4,
            EndpointHandler::Idle,
        )
        .with_cs_endpoint(CsEndpointDescriptor::new(0x01, &[0x00]));
        let d = ep.descriptor(Speed::Full, false, &fuzz);
        assert_eq!(d.len(), 7 + 4);
        assert_eq!(d[7..], [0x04, 0x25, 0x01, 0x00]);
    }
}
