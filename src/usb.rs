//! Wire-level USB 2.0 types: packed descriptor structs, the setup packet,
//! and the enums used by the control-transfer engine.

use packed_struct::prelude::*;

use crate::{Error, Result};

/// Descriptor type codes (the high byte of wValue in GET_DESCRIPTOR).
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescriptorType {
    Device = 0x01,
    Configuration = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
    DeviceQualifier = 0x06,
    OtherSpeedConfiguration = 0x07,
    Bos = 0x0f,
    Hid = 0x21,
    Report = 0x22,
    CsInterface = 0x24,
    CsEndpoint = 0x25,
    Hub = 0x29,
}

/// Standard request codes (bRequest), USB 2.0 table 9-4.
#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq)]
pub enum StandardRequest {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0a,
    SetInterface = 0x0b,
    SynchFrame = 0x0c,
}

/// Transfer direction, bit 7 of bmRequestType.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Out = 0,
    In = 1,
}

/// Request type, bits 6-5 of bmRequestType.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// Request recipient, bits 4-0 of bmRequestType.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved,
}

/// Endpoint transfer type, bits 1-0 of bmAttributes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// Isochronous synchronization type, bits 3-2 of bmAttributes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncType {
    NoSync = 0,
    Async = 1,
    Adaptive = 2,
    Synchronous = 3,
}

/// Isochronous usage type, bits 5-4 of bmAttributes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UsageType {
    Data = 0,
    Feedback = 1,
    ImplicitFeedback = 2,
}

/// Bus speed the device is being enumerated at. Only affects the serialized
/// max packet size of bulk endpoints (high-speed bulk is fixed at 512).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Speed {
    Full,
    High,
}

impl Speed {
    pub fn other(self) -> Speed {
        match self {
            Speed::Full => Speed::High,
            Speed::High => Speed::Full,
        }
    }
}

/// Device state machine, USB 2.0 section 9.1.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceState {
    Detached,
    Attached,
    Powered,
    Address,
    Configured,
}

/// Class codes as they appear in device and interface descriptors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UsbClassCode {
    Unspecified = 0x00,
    Audio = 0x01,
    Cdc = 0x02,
    Hid = 0x03,
    Image = 0x06,
    Printer = 0x07,
    MassStorage = 0x08,
    Hub = 0x09,
    CdcData = 0x0a,
    SmartCard = 0x0b,
    VendorSpecific = 0xff,
}

/// US English, the language id reported by string descriptor zero.
pub const LANGID_EN_US: u16 = 0x0409;

/// The 8-byte header that initiates every control transfer.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "8")]
pub struct SetupRequest {
    #[packed_field(bytes = "0")]
    pub bm_request_type: u8,
    #[packed_field(bytes = "1")]
    pub b_request: u8,
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub w_value: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4..=5", endian = "lsb")]
    pub w_index: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "6..=7", endian = "lsb")]
    pub w_length: Integer<u16, packed_bits::Bits<16>>,
}

impl SetupRequest {
    /// Parse the first 8 bytes of a setup buffer.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 8 {
            return Err(Error::Protocol(format!(
                "short setup packet: {} bytes",
                raw.len()
            )));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&raw[..8]);
        SetupRequest::unpack(&buf).map_err(|e| Error::Protocol(format!("bad setup packet: {e}")))
    }

    pub fn direction(&self) -> Direction {
        if self.bm_request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn kind(&self) -> RequestKind {
        match (self.bm_request_type >> 5) & 0x03 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.bm_request_type & 0x1f {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    pub fn value(&self) -> u16 {
        self.w_value.to_primitive()
    }

    /// wIndex, masked per recipient: the low byte selects an interface, the
    /// low nibble an endpoint (USB 2.0 section 9.3.4).
    pub fn index(&self) -> u16 {
        match self.recipient() {
            Recipient::Endpoint => self.w_index.to_primitive() & 0x0f,
            _ => self.w_index.to_primitive(),
        }
    }

    pub fn length(&self) -> u16 {
        self.w_length.to_primitive()
    }

    /// Requested descriptor type, when this is a GET_DESCRIPTOR.
    pub fn descriptor_type(&self) -> u8 {
        (self.value() >> 8) as u8
    }

    /// Requested descriptor index, when this is a GET_DESCRIPTOR.
    pub fn descriptor_index(&self) -> u8 {
        (self.value() & 0xff) as u8
    }
}

impl SetupRequest {
    /// Human-readable summary for logging.
    ///
    /// Named `describe` rather than implemented via `Display` because
    /// `#[derive(PackedStruct)]` already generates its own `Display` impl
    /// for this type (a raw bit-field dump), which would conflict.
    pub fn describe(&self) -> String {
        format!(
            "dir={} type={:?} rec={:?} req={:#04x} val={:#06x} idx={:#06x} len={:#06x}",
            match self.direction() {
                Direction::In => "in",
                Direction::Out => "out",
            },
            self.kind(),
            self.recipient(),
            self.b_request,
            self.value(),
            self.w_index.to_primitive(),
            self.length(),
        )
    }
}

/// A parsed control transfer: the setup packet plus, for host-to-device
/// transfers with a data stage, the payload that followed it.
#[derive(Debug, Clone)]
pub struct ControlRequest {
    pub setup: SetupRequest,
    pub data: Vec<u8>,
}

impl ControlRequest {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let setup = SetupRequest::parse(raw)?;
        Ok(Self {
            setup,
            data: raw[8..].to_vec(),
        })
    }
}

/// The 18-byte device descriptor, the root of the descriptor tree.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "18")]
pub struct DeviceDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    /// USB specification release in BCD (2.00 is 0x0200).
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub bcd_usb: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4")]
    pub b_device_class: u8,
    #[packed_field(bytes = "5")]
    pub b_device_sub_class: u8,
    #[packed_field(bytes = "6")]
    pub b_device_protocol: u8,
    /// Max packet size for endpoint zero; only 8, 16, 32 or 64 are valid.
    #[packed_field(bytes = "7")]
    pub b_max_packet_size_0: u8,
    #[packed_field(bytes = "8..=9", endian = "lsb")]
    pub id_vendor: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "10..=11", endian = "lsb")]
    pub id_product: Integer<u16, packed_bits::Bits<16>>,
    /// Device release number in BCD.
    #[packed_field(bytes = "12..=13", endian = "lsb")]
    pub bcd_device: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "14")]
    pub i_manufacturer: u8,
    #[packed_field(bytes = "15")]
    pub i_product: u8,
    #[packed_field(bytes = "16")]
    pub i_serial_number: u8,
    #[packed_field(bytes = "17")]
    pub b_num_configurations: u8,
}

/// The 10-byte device qualifier, describing how a dual-speed device would
/// enumerate at the other speed.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "10")]
pub struct DeviceQualifierDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub bcd_usb: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4")]
    pub b_device_class: u8,
    #[packed_field(bytes = "5")]
    pub b_device_sub_class: u8,
    #[packed_field(bytes = "6")]
    pub b_device_protocol: u8,
    #[packed_field(bytes = "7")]
    pub b_max_packet_size_0: u8,
    #[packed_field(bytes = "8")]
    pub b_num_configurations: u8,
    #[packed_field(bytes = "9")]
    pub b_reserved: u8,
}

/// The 9-byte configuration descriptor header. The full configuration
/// response appends the serialized interface block; wTotalLength covers both.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "9")]
pub struct ConfigurationDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub w_total_length: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4")]
    pub b_num_interfaces: u8,
    #[packed_field(bytes = "5")]
    pub b_configuration_value: u8,
    #[packed_field(bytes = "6")]
    pub i_configuration: u8,
    /// Bit 7 always set; bit 6 self-powered, bit 5 remote wakeup.
    #[packed_field(bytes = "7")]
    pub bm_attributes: u8,
    /// In 2 mA units.
    #[packed_field(bytes = "8")]
    pub b_max_power: u8,
}

/// The 9-byte interface descriptor header.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "9")]
pub struct InterfaceDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2")]
    pub b_interface_number: u8,
    #[packed_field(bytes = "3")]
    pub b_alternate_setting: u8,
    #[packed_field(bytes = "4")]
    pub b_num_endpoints: u8,
    #[packed_field(bytes = "5")]
    pub b_interface_class: u8,
    #[packed_field(bytes = "6")]
    pub b_interface_subclass: u8,
    #[packed_field(bytes = "7")]
    pub b_interface_protocol: u8,
    #[packed_field(bytes = "8")]
    pub i_interface: u8,
}

/// The 7-byte endpoint descriptor.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "7")]
pub struct EndpointDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    /// Bits 3-0 endpoint number, bit 7 direction (1 = IN).
    #[packed_field(bytes = "2")]
    pub b_endpoint_address: u8,
    /// Bits 1-0 transfer type, 3-2 sync type, 5-4 usage type.
    #[packed_field(bytes = "3")]
    pub bm_attributes: u8,
    #[packed_field(bytes = "4..=5", endian = "lsb")]
    pub w_max_packet_size: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "6")]
    pub b_interval: u8,
}

/// The class descriptor of a HID interface, embedded in the configuration
/// block after the interface header. Followed by one 3-byte entry per class
/// report descriptor.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "6")]
pub struct HidDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub bcd_hid: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4")]
    pub b_country_code: u8,
    #[packed_field(bytes = "5")]
    pub b_num_descriptors: u8,
}

/// The 9-byte hub class descriptor (USB 2.0 table 11-13, single-TT form).
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "9")]
pub struct HubDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2")]
    pub b_nbr_ports: u8,
    #[packed_field(bytes = "3..=4", endian = "lsb")]
    pub w_hub_characteristics: Integer<u16, packed_bits::Bits<16>>,
    /// Time from port power-on to power-good, in 2 ms units.
    #[packed_field(bytes = "5")]
    pub b_pwr_on_2_pwr_good: u8,
    #[packed_field(bytes = "6")]
    pub b_hub_contr_current: u8,
    #[packed_field(bytes = "7")]
    pub device_removable: u8,
    #[packed_field(bytes = "8")]
    pub port_pwr_ctrl_mask: u8,
}

impl Default for HubDescriptor {
    fn default() -> Self {
        Self {
            b_length: 9,
            b_descriptor_type: DescriptorType::Hub as u8,
            b_nbr_ports: 4,
            w_hub_characteristics: Integer::from_primitive(0xe000),
            b_pwr_on_2_pwr_good: 0x32,
            b_hub_contr_current: 0x64,
            device_removable: 0,
            port_pwr_ctrl_mask: 0xff,
        }
    }
}

/// String descriptor zero: the list of supported language ids.
pub fn string_descriptor_zero() -> Vec<u8> {
    let lang = LANGID_EN_US.to_le_bytes();
    vec![0x04, DescriptorType::String as u8, lang[0], lang[1]]
}

/// Encode a string descriptor: `{len+2, 0x03}` followed by UTF-16LE without
/// a byte order mark.
pub fn string_descriptor(s: &str) -> Vec<u8> {
    let utf16: Vec<u8> = s.encode_utf16().flat_map(u16::to_le_bytes).collect();
    let mut d = Vec::with_capacity(utf16.len() + 2);
    d.push((utf16.len() + 2) as u8);
    d.push(DescriptorType::String as u8);
    d.extend_from_slice(&utf16);
    d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_request_decodes_get_descriptor() {
        // GET_DESCRIPTOR(device), wLength 18
        let raw = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let req = SetupRequest::parse(&raw).unwrap();
        assert_eq!(req.direction(), Direction::In);
        assert_eq!(req.kind(), RequestKind::Standard);
        assert_eq!(req.recipient(), Recipient::Device);
        assert_eq!(req.b_request, StandardRequest::GetDescriptor as u8);
        assert_eq!(req.descriptor_type(), DescriptorType::Device as u8);
        assert_eq!(req.descriptor_index(), 0);
        assert_eq!(req.length(), 18);
    }

    #[test]
    fn setup_request_masks_endpoint_index() {
        // CLEAR_FEATURE on endpoint 0x83
        let raw = [0x02, 0x01, 0x00, 0x00, 0x83, 0x00, 0x00, 0x00];
        let req = SetupRequest::parse(&raw).unwrap();
        assert_eq!(req.recipient(), Recipient::Endpoint);
        assert_eq!(req.index(), 3);
    }

    #[test]
    fn short_setup_is_rejected() {
        assert!(SetupRequest::parse(&[0x80, 0x06]).is_err());
    }

    #[test]
    fn string_descriptor_zero_reports_en_us() {
        assert_eq!(string_descriptor_zero(), vec![0x04, 0x03, 0x09, 0x04]);
    }

    #[test]
    fn string_descriptor_is_utf16le_without_bom() {
        let d = string_descriptor("AB");
        assert_eq!(d, vec![0x06, 0x03, b'A', 0x00, b'B', 0x00]);
    }

    #[test]
    fn device_descriptor_packs_to_18_bytes() {
        let desc = DeviceDescriptor {
            b_length: 18,
            b_descriptor_type: DescriptorType::Device as u8,
            bcd_usb: Integer::from_primitive(0x0200),
            b_device_class: 0,
            b_device_sub_class: 0,
            b_device_protocol: 0,
            b_max_packet_size_0: 64,
            id_vendor: Integer::from_primitive(0x0403),
            id_product: Integer::from_primitive(0x6001),
            bcd_device: Integer::from_primitive(0x0100),
            i_manufacturer: 1,
            i_product: 2,
            i_serial_number: 3,
            b_num_configurations: 1,
        };
        let bytes = desc.pack().unwrap();
        assert_eq!(bytes.len(), 18);
        assert_eq!(&bytes[..2], &[0x12, 0x01]);
        // little-endian VID/PID
        assert_eq!(&bytes[8..12], &[0x03, 0x04, 0x01, 0x60]);
    }
}
