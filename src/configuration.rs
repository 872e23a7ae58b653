//! Configuration model: attributes, power budget and the owned interfaces,
//! serialized as one contiguous block with a consistent wTotalLength.

use packed_struct::prelude::*;

use crate::fuzz::{MutationBroker, SessionData};
use crate::interface::Interface;
use crate::usb::{ConfigurationDescriptor, DescriptorType, Speed};

/// One configuration of a device. `index` is the 1-based value the host
/// passes to SET_CONFIGURATION.
pub struct Configuration {
    pub index: u8,
    pub string: String,
    pub string_index: u8,
    pub attributes: u8,
    pub max_power: u8,
    pub interfaces: Vec<Interface>,
}

impl Configuration {
    /// Bit 7 of bmAttributes, always set.
    pub const ATTR_BASE: u8 = 0x80;
    pub const ATTR_SELF_POWERED: u8 = Self::ATTR_BASE | 0x40;
    pub const ATTR_REMOTE_WAKEUP: u8 = Self::ATTR_BASE | 0x20;

    pub fn new(index: u8, string: &str, interfaces: Vec<Interface>) -> Self {
        Self {
            index,
            string: string.to_string(),
            string_index: 0,
            attributes: Self::ATTR_SELF_POWERED | Self::ATTR_REMOTE_WAKEUP,
            max_power: 0x32,
            interfaces,
        }
    }

    pub fn with_attributes(mut self, attributes: u8) -> Self {
        self.attributes = attributes | Self::ATTR_BASE;
        self
    }

    pub fn with_max_power(mut self, max_power: u8) -> Self {
        self.max_power = max_power;
        self
    }

    /// The configuration response: 9-byte header with the interface block
    /// appended; `wTotalLength = 9 + len(block)` by construction.
    pub fn descriptor(&self, speed: Speed, valid: bool, fuzz: &MutationBroker) -> Vec<u8> {
        self.serialize(DescriptorType::Configuration, speed, valid, fuzz)
    }

    /// The other-speed companion: same shape with descriptor type 7, with
    /// endpoints sized for the opposite speed.
    pub fn other_speed_descriptor(
        &self,
        speed: Speed,
        valid: bool,
        fuzz: &MutationBroker,
    ) -> Vec<u8> {
        self.serialize(DescriptorType::OtherSpeedConfiguration, speed, valid, fuzz)
    }

    fn serialize(
        &self,
        dtype: DescriptorType,
        speed: Speed,
        valid: bool,
        fuzz: &MutationBroker,
    ) -> Vec<u8> {
        let produce = || {
            let mut block = Vec::new();
            for iface in &self.interfaces {
                block.extend_from_slice(&iface.descriptor(speed, valid, fuzz));
            }
            let mut d = ConfigurationDescriptor {
                b_length: 9,
                b_descriptor_type: dtype as u8,
                w_total_length: Integer::from_primitive((block.len() + 9) as u16),
                b_num_interfaces: self.interfaces.len() as u8,
                b_configuration_value: self.index,
                i_configuration: self.string_index,
                bm_attributes: self.attributes,
                b_max_power: self.max_power,
            }
            .pack()
            .unwrap()
            .to_vec();
            d.extend_from_slice(&block);
            d
        };
        let stage = match dtype {
            DescriptorType::OtherSpeedConfiguration => "other_speed_configuration_descriptor",
            _ => "configuration_descriptor",
        };
        if valid {
            produce()
        } else {
            fuzz.produce(stage, &SessionData::new(), produce)
        }
    }
}
