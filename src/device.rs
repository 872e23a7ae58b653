//! The device: root of the descriptor graph and the control-transfer engine
//! for endpoint 0.
//!
//! Requests are decoded from the 8-byte setup packet and routed through a
//! recipient/type dispatch: standard requests resolve their recipient by
//! index (device, interface, endpoint), class and vendor requests go to the
//! device's class/vendor handler objects. Anything unresolvable stalls the
//! control endpoint. All setup processing is strictly sequential; a second
//! setup is not accepted until the engine has written a full response or a
//! stall for the first.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use packed_struct::prelude::*;

use crate::class::{FunctionSignal, UsbClass, UsbVendor};
use crate::configuration::Configuration;
use crate::endpoint::EndpointHandler;
use crate::fuzz::MutationBroker;
use crate::phy::{EndpointInit, PhyIo};
use crate::usb::{
    ControlRequest, DescriptorType, DeviceDescriptor, DeviceQualifierDescriptor, DeviceState,
    HubDescriptor, Recipient, RequestKind, Speed, StandardRequest, string_descriptor,
    string_descriptor_zero,
};
use crate::Result;

/// Binary device object store: 5-byte header plus opaque capability blobs.
#[derive(Debug, Clone, Default)]
pub struct BosDescriptor {
    pub capabilities: Vec<Vec<u8>>,
}

impl BosDescriptor {
    pub fn serialize(&self) -> Vec<u8> {
        let caps: Vec<u8> = self.capabilities.iter().flatten().copied().collect();
        let mut d = Vec::with_capacity(caps.len() + 5);
        d.push(0x05);
        d.push(DescriptorType::Bos as u8);
        d.extend_from_slice(&((caps.len() + 5) as u16).to_le_bytes());
        d.push(self.capabilities.len() as u8);
        d.extend_from_slice(&caps);
        d
    }
}

/// A descriptor served through the device-level type map beyond the builtin
/// types (e.g. a HID report descriptor registered at device scope).
pub struct ExtraDescriptor {
    pub stage: &'static str,
    pub bytes: Vec<u8>,
}

/// Location of an endpoint inside the active configuration.
#[derive(Debug, Copy, Clone)]
struct EndpointPath {
    iface: usize,
    ep: usize,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// An emulated USB device.
pub struct Device {
    name: &'static str,
    pub usb_spec_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub protocol_rel_num: u8,
    pub max_packet_size_ep0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_rev: u16,
    manufacturer_string_id: u8,
    product_string_id: u8,
    serial_number_string_id: u8,
    strings: Vec<String>,
    pub configurations: Vec<Configuration>,
    config_num: usize,
    state: DeviceState,
    address: u8,
    speed: Speed,
    endpoints: BTreeMap<u8, EndpointPath>,
    usb_class: Option<Box<dyn UsbClass>>,
    usb_vendor: Option<Box<dyn UsbVendor>>,
    bos: Option<BosDescriptor>,
    hub: HubDescriptor,
    extra_descriptors: HashMap<u8, ExtraDescriptor>,
    signal: FunctionSignal,
    broker: Arc<MutationBroker>,
    teardown: Vec<Box<dyn FnMut() + Send>>,
}

impl Device {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn set_state(&mut self, state: DeviceState) {
        log::debug!("device {} state: {:?} -> {state:?}", self.name, self.state);
        self.state = state;
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    /// Recorded by the PHY at connect time; GET_DESCRIPTOR responses size
    /// bulk endpoints for this speed.
    pub fn set_speed(&mut self, speed: Speed) {
        self.speed = speed;
    }

    pub fn signal(&self) -> FunctionSignal {
        self.signal.clone()
    }

    pub fn broker(&self) -> Arc<MutationBroker> {
        self.broker.clone()
    }

    pub fn active_configuration(&self) -> &Configuration {
        &self.configurations[self.config_num]
    }

    /// Endpoint numbers in use by the active configuration (populated by
    /// SET_CONFIGURATION).
    pub fn endpoint_numbers(&self) -> Vec<u8> {
        self.endpoints.keys().copied().collect()
    }

    pub fn set_vid(&mut self, vid: u16) {
        self.vendor_id = vid;
    }

    pub fn set_pid(&mut self, pid: u16) {
        self.product_id = pid;
    }

    /// Register cleanup to run when the application disconnects the device
    /// (worker threads, open files).
    pub fn add_teardown(&mut self, f: Box<dyn FnMut() + Send>) {
        self.teardown.push(f);
    }

    /// Runs teardown hooks and drops back to the detached state.
    pub fn detach(&mut self) {
        for f in &mut self.teardown {
            f();
        }
        self.set_state(DeviceState::Detached);
    }

    // Serializers
    // ------------------------------------------------------------------

    /// The 18-byte device descriptor.
    pub fn descriptor(&self, valid: bool) -> Vec<u8> {
        let produce = || {
            DeviceDescriptor {
                b_length: 18,
                b_descriptor_type: DescriptorType::Device as u8,
                bcd_usb: Integer::from_primitive(self.usb_spec_version),
                b_device_class: self.device_class,
                b_device_sub_class: self.device_subclass,
                b_device_protocol: self.protocol_rel_num,
                b_max_packet_size_0: self.max_packet_size_ep0,
                id_vendor: Integer::from_primitive(self.vendor_id),
                id_product: Integer::from_primitive(self.product_id),
                bcd_device: Integer::from_primitive(self.device_rev),
                i_manufacturer: self.manufacturer_string_id,
                i_product: self.product_string_id,
                i_serial_number: self.serial_number_string_id,
                b_num_configurations: self.configurations.len() as u8,
            }
            .pack()
            .unwrap()
            .to_vec()
        };
        if valid {
            produce()
        } else {
            self.broker.produce_plain("device_descriptor", produce)
        }
    }

    pub fn device_qualifier_descriptor(&self) -> Vec<u8> {
        self.broker.produce_plain("device_qualifier_descriptor", || {
            DeviceQualifierDescriptor {
                b_length: 10,
                b_descriptor_type: DescriptorType::DeviceQualifier as u8,
                bcd_usb: Integer::from_primitive(self.usb_spec_version),
                b_device_class: self.device_class,
                b_device_sub_class: self.device_subclass,
                b_device_protocol: self.protocol_rel_num,
                b_max_packet_size_0: self.max_packet_size_ep0,
                b_num_configurations: self.configurations.len() as u8,
                b_reserved: 0,
            }
            .pack()
            .unwrap()
            .to_vec()
        })
    }

    fn configuration_descriptor(&self, index: u8) -> Vec<u8> {
        let config = self
            .configurations
            .get(index as usize)
            .unwrap_or_else(|| {
                log::warn!("invalid configuration descriptor index {index}, serving 0");
                &self.configurations[0]
            });
        config.descriptor(self.speed, false, &self.broker)
    }

    fn other_speed_configuration_descriptor(&self, index: u8) -> Vec<u8> {
        let config = self
            .configurations
            .get(index as usize)
            .unwrap_or(&self.configurations[0]);
        config.other_speed_descriptor(self.speed.other(), false, &self.broker)
    }

    fn string_descriptor_response(&self, index: u8) -> Option<Vec<u8>> {
        if index == 0 {
            return Some(
                self.broker
                    .produce_plain("string_descriptor_zero", string_descriptor_zero),
            );
        }
        if self.strings.is_empty() {
            return None;
        }
        // unknown indices fall back to the first string rather than stalling
        let s = self
            .strings
            .get(index as usize - 1)
            .unwrap_or(&self.strings[0]);
        Some(
            self.broker
                .produce_plain("string_descriptor", || string_descriptor(s)),
        )
    }

    fn hub_descriptor_response(&self) -> Vec<u8> {
        self.broker
            .produce_plain("hub_descriptor", || self.hub.pack().unwrap().to_vec())
    }

    fn bos_descriptor_response(&self) -> Option<Vec<u8>> {
        let bos = self.bos.as_ref()?;
        Some(self.broker.produce_plain("bos_descriptor", || bos.serialize()))
    }

    /// The descriptor-type map of GET_DESCRIPTOR: resolve the serializer for
    /// a type byte and produce the (possibly mutated) bytes. `None` stalls.
    pub fn descriptor_response(&self, dtype: u8, index: u8) -> Option<Vec<u8>> {
        match DescriptorType::from_primitive(dtype) {
            Some(DescriptorType::Device) => Some(self.descriptor(false)),
            Some(DescriptorType::Configuration) => Some(self.configuration_descriptor(index)),
            Some(DescriptorType::String) => self.string_descriptor_response(index),
            Some(DescriptorType::DeviceQualifier) => Some(self.device_qualifier_descriptor()),
            Some(DescriptorType::OtherSpeedConfiguration) => {
                Some(self.other_speed_configuration_descriptor(index))
            }
            Some(DescriptorType::Bos) => self.bos_descriptor_response(),
            Some(DescriptorType::Hub) => Some(self.hub_descriptor_response()),
            _ => self
                .extra_descriptors
                .get(&dtype)
                .map(|e| self.broker.produce_plain(e.stage, || e.bytes.clone())),
        }
    }

    // Control-transfer engine
    // ------------------------------------------------------------------

    /// Decode and service one setup packet (plus any host-to-device data
    /// stage appended to `raw`). Protocol errors are answered with a stall
    /// and reported as success; only transport failures propagate.
    pub fn handle_request(&mut self, raw: &[u8], phy: &mut dyn PhyIo) -> Result<()> {
        let req = match ControlRequest::parse(raw) {
            Ok(req) => req,
            Err(e) => {
                log::warn!("unparseable setup packet, stalling: {e}");
                return phy.stall_ep0();
            }
        };
        log::debug!("received request: {}", req.setup.describe());

        match req.setup.kind() {
            RequestKind::Standard => self.handle_standard_request(&req, phy),
            RequestKind::Class => {
                let broker = Arc::clone(&self.broker);
                match self.usb_class.as_mut() {
                    Some(class) => {
                        let codes = class.request_codes();
                        match class.handle(&broker, &req) {
                            Some(response) => {
                                phy.send_on_endpoint(0, &response)?;
                                self.signal.mark("class request serviced");
                                Ok(())
                            }
                            None => {
                                log_unhandled(&req, "class", &codes);
                                phy.stall_ep0()
                            }
                        }
                    }
                    None => {
                        log::warn!("class request but device has no class handler, stalling");
                        phy.stall_ep0()
                    }
                }
            }
            RequestKind::Vendor => {
                let broker = Arc::clone(&self.broker);
                match self.usb_vendor.as_mut() {
                    Some(vendor) => {
                        let codes = vendor.request_codes();
                        match vendor.handle(&broker, &req) {
                            Some(response) => {
                                phy.send_on_endpoint(0, &response)?;
                                self.signal.mark("vendor request serviced");
                                Ok(())
                            }
                            None => {
                                log_unhandled(&req, "vendor", &codes);
                                phy.stall_ep0()
                            }
                        }
                    }
                    None => {
                        log::warn!("vendor request but device has no vendor handler, stalling");
                        phy.stall_ep0()
                    }
                }
            }
            RequestKind::Reserved => {
                log::warn!("reserved request type, stalling: {}", req.setup.describe());
                phy.stall_ep0()
            }
        }
    }

    fn handle_standard_request(&mut self, req: &ControlRequest, phy: &mut dyn PhyIo) -> Result<()> {
        match req.setup.recipient() {
            Recipient::Device => self.handle_standard_device_request(req, phy),
            Recipient::Interface => {
                let index = (req.setup.index() & 0xff) as usize;
                self.dispatch_to_interface(index, req, phy)
            }
            // routed to the first interface as a hub workaround; revisit
            // when hub emulation grows beyond descriptors
            Recipient::Other => self.dispatch_to_interface(0, req, phy),
            Recipient::Endpoint => {
                let number = req.setup.index() as u8;
                let Some(path) = self.endpoints.get(&number).copied() else {
                    log::warn!("failed to get endpoint recipient {number}, stalling");
                    return phy.stall_ep0();
                };
                let ep = &mut self.configurations[self.config_num].interfaces[path.iface]
                    .endpoints[path.ep];
                match ep.handle_standard_request(req.setup.b_request, phy)? {
                    Some(()) => Ok(()),
                    None => {
                        log_unhandled(req, "endpoint", &[0x00, 0x01]);
                        phy.stall_ep0()
                    }
                }
            }
            Recipient::Reserved => {
                log::warn!("reserved recipient, stalling: {}", req.setup.describe());
                phy.stall_ep0()
            }
        }
    }

    fn dispatch_to_interface(
        &mut self,
        index: usize,
        req: &ControlRequest,
        phy: &mut dyn PhyIo,
    ) -> Result<()> {
        let broker = Arc::clone(&self.broker);
        let Some(iface) = self.configurations[self.config_num].interfaces.get_mut(index) else {
            log::warn!("failed to get interface recipient at index {index}, stalling");
            return phy.stall_ep0();
        };
        let codes = iface.request_codes();
        match iface.handle_standard_request(&broker, req, phy)? {
            Some(()) => Ok(()),
            None => {
                log_unhandled(req, "interface", &codes);
                phy.stall_ep0()
            }
        }
    }

    fn handle_standard_device_request(
        &mut self,
        req: &ControlRequest,
        phy: &mut dyn PhyIo,
    ) -> Result<()> {
        let Some(request) = StandardRequest::from_primitive(req.setup.b_request) else {
            log::warn!("unknown standard request, stalling: {}", req.setup.describe());
            return phy.stall_ep0();
        };
        match request {
            StandardRequest::GetStatus => {
                log::debug!("GET_STATUS");
                // self-powered
                phy.send_on_endpoint(0, &[0x01, 0x00])
            }
            StandardRequest::ClearFeature => {
                log::debug!("CLEAR_FEATURE value {:#06x}", req.setup.value());
                phy.send_on_endpoint(0, &[])
            }
            StandardRequest::SetFeature => {
                log::debug!("SET_FEATURE value {:#06x}", req.setup.value());
                phy.send_on_endpoint(0, &[])
            }
            StandardRequest::SetAddress => {
                self.address = req.setup.value() as u8;
                self.set_state(DeviceState::Address);
                log::debug!("SET_ADDRESS {}", self.address);
                phy.ack_status_stage()
            }
            StandardRequest::GetDescriptor => self.handle_get_descriptor(req, phy),
            StandardRequest::SetDescriptor => {
                log::info!("SET_DESCRIPTOR not supported: {}", req.setup.describe());
                phy.stall_ep0()
            }
            StandardRequest::GetConfiguration => {
                log::debug!("GET_CONFIGURATION");
                phy.send_on_endpoint(0, &[0x01])
            }
            StandardRequest::SetConfiguration => self.handle_set_configuration(req, phy),
            StandardRequest::GetInterface => {
                log::debug!("GET_INTERFACE {}", req.setup.index());
                if req.setup.index() == 0 {
                    phy.send_on_endpoint(0, &[0x00])
                } else {
                    phy.stall_ep0()
                }
            }
            StandardRequest::SetInterface => {
                log::debug!("SET_INTERFACE");
                phy.send_on_endpoint(0, &[])
            }
            StandardRequest::SynchFrame => {
                log::debug!("SYNCH_FRAME");
                phy.send_on_endpoint(0, &[])
            }
        }
    }

    fn handle_get_descriptor(&mut self, req: &ControlRequest, phy: &mut dyn PhyIo) -> Result<()> {
        let dtype = req.setup.descriptor_type();
        let dindex = req.setup.descriptor_index();
        log::debug!("GET_DESCRIPTOR type {dtype:#04x} index {dindex}");
        match self.descriptor_response(dtype, dindex) {
            Some(mut response) if !response.is_empty() => {
                response.truncate(req.setup.length() as usize);
                let n = response.len();
                phy.send_on_endpoint(0, &response)?;
                log::debug!("sent {n} descriptor bytes in response");
                Ok(())
            }
            _ => {
                log::warn!("no descriptor for type {dtype:#04x} index {dindex}, stalling");
                phy.stall_ep0()
            }
        }
    }

    fn handle_set_configuration(&mut self, req: &ControlRequest, phy: &mut dyn PhyIo) -> Result<()> {
        let value = req.setup.value() as usize;
        // configuration values are one-based
        let index = if value == 0 || value > self.configurations.len() {
            log::error!("host tried to set invalid configuration {value:#x}, using 0");
            0
        } else {
            value - 1
        };
        log::info!("setting configuration {index:#x}");
        self.config_num = index;
        self.rebuild_endpoint_map();
        self.set_state(DeviceState::Configured);
        let inits = self.endpoint_inits();
        phy.configure_endpoints(&inits)?;
        phy.ack_status_stage()
    }

    fn rebuild_endpoint_map(&mut self) {
        self.endpoints.clear();
        for (i, iface) in self.configurations[self.config_num].interfaces.iter().enumerate() {
            for (j, ep) in iface.endpoints.iter().enumerate() {
                self.endpoints
                    .insert(ep.number, EndpointPath { iface: i, ep: j });
            }
        }
        log::debug!("endpoint map: {:?}", self.endpoints.keys());
    }

    fn endpoint_inits(&self) -> Vec<EndpointInit> {
        let mut inits = Vec::new();
        for iface in &self.configurations[self.config_num].interfaces {
            for ep in &iface.endpoints {
                inits.push(EndpointInit {
                    number: ep.number,
                    direction: ep.direction,
                    fs_descriptor: ep.wire_descriptor(Speed::Full),
                    hs_descriptor: ep.wire_descriptor(Speed::High),
                });
            }
        }
        inits
    }

    // Endpoint I/O entry points, called by the PHY run loop
    // ------------------------------------------------------------------

    /// The PHY delivered `data` on an OUT endpoint.
    pub fn handle_data_available(&mut self, ep_num: u8, data: &[u8], phy: &mut dyn PhyIo) {
        if self.state != DeviceState::Configured {
            return;
        }
        let Some(path) = self.endpoints.get(&ep_num).copied() else {
            return;
        };
        self.signal
            .mark(&format!("data received on endpoint {ep_num:#x}"));
        let ep = &mut self.configurations[self.config_num].interfaces[path.iface].endpoints[path.ep];
        if let EndpointHandler::Out(handler) = &mut ep.handler {
            handler(phy, data);
        }
    }

    /// The PHY has buffer space on an IN endpoint.
    pub fn handle_buffer_available(&mut self, ep_num: u8, phy: &mut dyn PhyIo) {
        if self.state != DeviceState::Configured {
            return;
        }
        let Some(path) = self.endpoints.get(&ep_num).copied() else {
            return;
        };
        let ep = &mut self.configurations[self.config_num].interfaces[path.iface].endpoints[path.ep];
        if let EndpointHandler::In(handler) = &mut ep.handler {
            handler(phy);
        }
    }
}

fn log_unhandled(req: &ControlRequest, role: &str, codes: &[u8]) {
    log::error!("{role} request not handled: {}", req.setup.describe());
    log::error!(
        "available {role} request codes: [{}]",
        codes
            .iter()
            .map(|c| format!("{c:#04x}"))
            .collect::<Vec<_>>()
            .join(", ")
    );
}

/// Assembles a [`Device`], interning strings and wiring string indices the
/// way the descriptors reference them (1-based, 0 reserved).
pub struct DeviceBuilder {
    name: &'static str,
    usb_spec_version: u16,
    device_class: u8,
    device_subclass: u8,
    protocol_rel_num: u8,
    max_packet_size_ep0: u8,
    vendor_id: u16,
    product_id: u16,
    device_rev: u16,
    manufacturer: Option<String>,
    product: Option<String>,
    serial: Option<String>,
    configurations: Vec<Configuration>,
    usb_class: Option<Box<dyn UsbClass>>,
    usb_vendor: Option<Box<dyn UsbVendor>>,
    bos: Option<BosDescriptor>,
    hub: HubDescriptor,
    extra_descriptors: HashMap<u8, ExtraDescriptor>,
    broker: Arc<MutationBroker>,
}

impl DeviceBuilder {
    pub fn new(name: &'static str, vendor_id: u16, product_id: u16, broker: Arc<MutationBroker>) -> Self {
        Self {
            name,
            usb_spec_version: 0x0200,
            device_class: 0,
            device_subclass: 0,
            protocol_rel_num: 0,
            max_packet_size_ep0: 64,
            vendor_id,
            product_id,
            device_rev: 0x0100,
            manufacturer: None,
            product: None,
            serial: None,
            configurations: Vec::new(),
            usb_class: None,
            usb_vendor: None,
            bos: None,
            hub: HubDescriptor::default(),
            extra_descriptors: HashMap::new(),
            broker,
        }
    }

    pub fn device_class(mut self, class: u8, subclass: u8, protocol: u8) -> Self {
        self.device_class = class;
        self.device_subclass = subclass;
        self.protocol_rel_num = protocol;
        self
    }

    /// Max EP0 packet size; only 8, 16, 32 or 64 are valid.
    pub fn max_packet_size(mut self, size: u8) -> Self {
        self.max_packet_size_ep0 = size;
        self
    }

    pub fn revision(mut self, rev: u16) -> Self {
        self.device_rev = rev;
        self
    }

    pub fn manufacturer(mut self, s: &str) -> Self {
        self.manufacturer = Some(s.to_string());
        self
    }

    pub fn product(mut self, s: &str) -> Self {
        self.product = Some(s.to_string());
        self
    }

    pub fn serial(mut self, s: &str) -> Self {
        self.serial = Some(s.to_string());
        self
    }

    pub fn configuration(mut self, config: Configuration) -> Self {
        self.configurations.push(config);
        self
    }

    pub fn usb_class(mut self, class: Box<dyn UsbClass>) -> Self {
        self.usb_class = Some(class);
        self
    }

    pub fn usb_vendor(mut self, vendor: Box<dyn UsbVendor>) -> Self {
        self.usb_vendor = Some(vendor);
        self
    }

    pub fn bos(mut self, bos: BosDescriptor) -> Self {
        self.bos = Some(bos);
        self
    }

    pub fn hub(mut self, hub: HubDescriptor) -> Self {
        self.hub = hub;
        self
    }

    /// Register a descriptor in the device-level type map beyond the builtin
    /// types.
    pub fn descriptor(mut self, dtype: u8, stage: &'static str, bytes: Vec<u8>) -> Self {
        self.extra_descriptors.insert(dtype, ExtraDescriptor { stage, bytes });
        self
    }

    pub fn build(mut self) -> Device {
        assert!(
            !self.configurations.is_empty(),
            "a device needs at least one configuration"
        );
        let mut strings = Vec::new();
        let manufacturer_string_id = intern(&mut strings, self.manufacturer.take());
        let product_string_id = intern(&mut strings, self.product.take());
        let serial_number_string_id = intern(&mut strings, self.serial.take());
        for config in &mut self.configurations {
            let s = config.string.clone();
            config.string_index = intern(&mut strings, Some(s));
        }

        Device {
            name: self.name,
            usb_spec_version: self.usb_spec_version,
            device_class: self.device_class,
            device_subclass: self.device_subclass,
            protocol_rel_num: self.protocol_rel_num,
            max_packet_size_ep0: self.max_packet_size_ep0,
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            device_rev: self.device_rev,
            manufacturer_string_id,
            product_string_id,
            serial_number_string_id,
            strings,
            configurations: self.configurations,
            config_num: 0,
            state: DeviceState::Detached,
            address: 0,
            speed: Speed::Full,
            endpoints: BTreeMap::new(),
            usb_class: self.usb_class,
            usb_vendor: self.usb_vendor,
            bos: self.bos,
            hub: self.hub,
            extra_descriptors: self.extra_descriptors,
            signal: FunctionSignal::new(),
            broker: self.broker,
            teardown: Vec::new(),
        }
    }
}

/// String descriptor indices are 1-based; duplicate strings share an index.
fn intern(strings: &mut Vec<String>, s: Option<String>) -> u8 {
    let Some(s) = s else {
        return 0;
    };
    if let Some(pos) = strings.iter().position(|existing| *existing == s) {
        return (pos + 1) as u8;
    }
    strings.push(s);
    strings.len() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoint, EndpointHandler};
    use crate::interface::Interface;
    use crate::phy::mock::MockPhy;
    use crate::usb::{Direction, TransferType};

    fn test_device(broker: Arc<MutationBroker>) -> Device {
        let iface = Interface::new(0, 0xff, 0xff, 0xff)
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
            ));
        DeviceBuilder::new("test device", 0x1209, 0x0001, broker)
            .manufacturer("phantom")
            .product("phantom test")
            .serial("0000")
            .configuration(Configuration::new(1, "default", vec![iface]))
            .build()
    }

    fn passthrough_device() -> Device {
        test_device(Arc::new(MutationBroker::passthrough()))
    }

    #[test]
    fn get_device_descriptor_is_18_bytes() {
        let mut dev = passthrough_device();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00], &mut phy)
            .unwrap();
        let d = phy.last_ep0().unwrap();
        assert_eq!(d.len(), 18);
        assert_eq!(&d[..2], &[0x12, 0x01]);
        // bcdUSB 2.00
        assert_eq!(&d[2..4], &[0x00, 0x02]);
        // VID/PID little-endian
        assert_eq!(&d[8..12], &[0x09, 0x12, 0x01, 0x00]);
        // last byte is the configuration count
        assert_eq!(d[17], 1);
    }

    #[test]
    fn eight_byte_probe_is_a_prefix_of_the_full_descriptor() {
        let mut dev = passthrough_device();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00], &mut phy)
            .unwrap();
        dev.handle_request(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x08, 0x00], &mut phy)
            .unwrap();
        let responses = phy.ep0_responses();
        assert_eq!(responses[1].len(), 8);
        assert_eq!(responses[1], &responses[0][..8]);
    }

    #[test]
    fn get_descriptor_is_idempotent() {
        let mut dev = passthrough_device();
        let mut phy = MockPhy::new();
        let req = [0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0xff, 0x00];
        dev.handle_request(&req, &mut phy).unwrap();
        dev.handle_request(&req, &mut phy).unwrap();
        let responses = phy.ep0_responses();
        assert_eq!(responses[0], responses[1]);
    }

    #[test]
    fn string_descriptor_zero_is_the_language_table() {
        let mut dev = passthrough_device();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0x80, 0x06, 0x00, 0x03, 0x00, 0x00, 0xff, 0x00], &mut phy)
            .unwrap();
        assert_eq!(phy.last_ep0().unwrap(), &[0x04, 0x03, 0x09, 0x04]);
    }

    #[test]
    fn string_descriptors_are_utf16() {
        let mut dev = passthrough_device();
        let mut phy = MockPhy::new();
        // string index 1 = manufacturer
        dev.handle_request(&[0x80, 0x06, 0x01, 0x03, 0x09, 0x04, 0xff, 0x00], &mut phy)
            .unwrap();
        let d = phy.last_ep0().unwrap();
        assert_eq!(d[0] as usize, d.len());
        assert_eq!(d[1], 0x03);
        assert_eq!(&d[2..4], &[b'p', 0x00]);
    }

    #[test]
    fn set_configuration_configures_and_acks() {
        let mut dev = passthrough_device();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00], &mut phy)
            .unwrap();
        assert_eq!(dev.state(), DeviceState::Configured);
        assert_eq!(dev.endpoint_numbers(), vec![1, 3]);
        assert_eq!(phy.acks, 1);
        assert!(phy.sent.is_empty());
        // the PHY learned both endpoints
        assert_eq!(phy.configured.len(), 1);
        assert_eq!(phy.configured[0].len(), 2);
    }

    #[test]
    fn set_configuration_out_of_range_falls_back_to_first() {
        let mut dev = passthrough_device();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0x00, 0x09, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00], &mut phy)
            .unwrap();
        assert_eq!(dev.state(), DeviceState::Configured);
        assert_eq!(dev.endpoint_numbers(), vec![1, 3]);
    }

    #[test]
    fn set_address_reaches_address_state() {
        let mut dev = passthrough_device();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0x00, 0x05, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00], &mut phy)
            .unwrap();
        assert_eq!(dev.state(), DeviceState::Address);
        assert_eq!(dev.address(), 7);
        assert_eq!(phy.acks, 1);
    }

    #[test]
    fn state_is_not_changed_by_other_requests() {
        let mut dev = passthrough_device();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00], &mut phy)
            .unwrap();
        dev.handle_request(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00], &mut phy)
            .unwrap();
        assert_eq!(dev.state(), DeviceState::Detached);
    }

    #[test]
    fn get_status_reports_self_powered() {
        let mut dev = passthrough_device();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00], &mut phy)
            .unwrap();
        assert_eq!(phy.last_ep0().unwrap(), &[0x01, 0x00]);
    }

    #[test]
    fn truncation_honors_wlength() {
        let mut dev = passthrough_device();
        let mut phy = MockPhy::new();
        // full configuration is 9 + 9 + 7 + 7 = 32 bytes; ask for 9
        dev.handle_request(&[0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0x09, 0x00], &mut phy)
            .unwrap();
        let d = phy.last_ep0().unwrap();
        assert_eq!(d.len(), 9);
        let total = u16::from_le_bytes([d[2], d[3]]);
        assert_eq!(total, 32);
    }

    #[test]
    fn other_recipient_routes_to_first_interface() {
        // GET_DESCRIPTOR addressed to "other": the first interface has no
        // matching class descriptor, so EP0 stalls
        let mut dev = passthrough_device();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0x82, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00], &mut phy)
            .unwrap();
        assert_eq!(phy.stalls, 1);
        assert!(phy.sent.is_empty());
    }

    #[test]
    fn unknown_descriptor_type_stalls() {
        let mut dev = passthrough_device();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0x80, 0x06, 0x00, 0x42, 0x00, 0x00, 0x12, 0x00], &mut phy)
            .unwrap();
        assert_eq!(phy.stalls, 1);
    }

    #[test]
    fn class_request_without_handler_stalls() {
        let mut dev = passthrough_device();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0xa1, 0xfe, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00], &mut phy)
            .unwrap();
        assert_eq!(phy.stalls, 1);
    }

    #[test]
    fn endpoint_get_status_and_clear_feature() {
        let mut dev = passthrough_device();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00], &mut phy)
            .unwrap();
        dev.handle_request(&[0x82, 0x00, 0x00, 0x00, 0x83, 0x00, 0x02, 0x00], &mut phy)
            .unwrap();
        assert_eq!(phy.last_ep0().unwrap(), &[0x00, 0x00]);
        dev.handle_request(&[0x02, 0x01, 0x00, 0x00, 0x83, 0x00, 0x00, 0x00], &mut phy)
            .unwrap();
        assert_eq!(phy.last_ep0().unwrap(), &[] as &[u8]);
    }

    #[test]
    fn unknown_endpoint_recipient_stalls() {
        let mut dev = passthrough_device();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00], &mut phy)
            .unwrap();
        dev.handle_request(&[0x82, 0x00, 0x00, 0x00, 0x87, 0x00, 0x02, 0x00], &mut phy)
            .unwrap();
        assert_eq!(phy.stalls, 1);
    }

    #[test]
    fn mutation_substitutes_device_descriptor() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(
            "device_descriptor".to_string(),
            vec![0xde, 0xad, 0xbe, 0xef],
        );
        let broker = Arc::new(MutationBroker::with_source(Box::new(
            crate::fuzz::StaticMutations(map),
        )));
        let mut dev = test_device(broker);
        let mut phy = MockPhy::new();
        dev.handle_request(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00], &mut phy)
            .unwrap();
        // the mutation is shorter than wLength, so it passes through whole
        assert_eq!(phy.last_ep0().unwrap(), &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn out_data_marks_function_supported() {
        let mut dev = passthrough_device();
        let mut phy = MockPhy::new();
        dev.handle_request(&[0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00], &mut phy)
            .unwrap();
        assert!(!dev.signal().is_supported());
        dev.handle_data_available(1, &[0x55], &mut phy);
        assert!(dev.signal().is_supported());
    }

    #[test]
    fn data_before_configuration_is_ignored() {
        let mut dev = passthrough_device();
        let mut phy = MockPhy::new();
        dev.handle_data_available(1, &[0x55], &mut phy);
        assert!(!dev.signal().is_supported());
    }

    #[test]
    fn hub_descriptor_has_fixed_shape() {
        let dev = passthrough_device();
        let d = dev.descriptor_response(0x29, 0).unwrap();
        assert_eq!(d, vec![9, 0x29, 4, 0x00, 0xe0, 0x32, 0x64, 0x00, 0xff]);
    }

    #[test]
    fn device_qualifier_is_ten_bytes() {
        let dev = passthrough_device();
        let d = dev.descriptor_response(0x06, 0).unwrap();
        assert_eq!(d.len(), 10);
        assert_eq!(d[0], 10);
        assert_eq!(d[1], 0x06);
    }

    #[test]
    fn bos_stalls_when_absent() {
        let dev = passthrough_device();
        assert!(dev.descriptor_response(0x0f, 0).is_none());
    }

    #[test]
    fn bos_serializes_header_and_capabilities() {
        let broker = Arc::new(MutationBroker::passthrough());
        let iface = Interface::new(0, 0xff, 0xff, 0xff);
        let dev = DeviceBuilder::new("bos", 0x1209, 0x0001, broker)
            .configuration(Configuration::new(1, "cfg", vec![iface]))
            .bos(BosDescriptor {
                // USB 2.0 extension capability
                capabilities: vec![vec![0x07, 0x10, 0x02, 0x02, 0x00, 0x00, 0x00]],
            })
            .build();
        let d = dev.descriptor_response(0x0f, 0).unwrap();
        assert_eq!(d[0], 0x05);
        assert_eq!(d[1], 0x0f);
        assert_eq!(u16::from_le_bytes([d[2], d[3]]) as usize, d.len());
        assert_eq!(d[4], 1);
        assert_eq!(d[5..7], [0x07, 0x10]);
    }

    #[test]
    fn interned_strings_are_deduplicated() {
        let broker = Arc::new(MutationBroker::passthrough());
        let iface = Interface::new(0, 0xff, 0xff, 0xff);
        let dev = DeviceBuilder::new("dup", 0x1209, 0x0001, broker)
            .manufacturer("same")
            .product("same")
            .configuration(Configuration::new(1, "cfg", vec![iface]))
            .build();
        let d = dev.descriptor(true);
        assert_eq!(d[14], d[15]);
    }
}
