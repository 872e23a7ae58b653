//! Audio headset: an audio-control interface carrying the class-specific
//! topology (terminals, units) and two audio-streaming interfaces with
//! isochronous endpoints. Class requests read and write the parameter table
//! keyed by (wValue, wIndex).

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use packed_struct::types::SizedInteger;

use crate::class::UsbClass;
use crate::configuration::Configuration;
use crate::device::{Device, DeviceBuilder};
use crate::dev::DeviceOptions;
use crate::endpoint::{CsEndpointDescriptor, Endpoint, EndpointHandler};
use crate::fuzz::{MutationBroker, SessionData};
use crate::interface::{CsInterfaceDescriptor, Interface};
use crate::usb::{ControlRequest, Direction, SyncType, TransferType, UsbClassCode};
use crate::Result;

pub const SUBCLASS_AUDIOCONTROL: u8 = 0x01;
pub const SUBCLASS_AUDIOSTREAMING: u8 = 0x02;

// parameter slots in the settings table
const PARAM_CUR: usize = 0;
const PARAM_MIN: usize = 1;
const PARAM_MAX: usize = 2;
const PARAM_RES: usize = 3;
const PARAM_IDLE: usize = 4;

pub struct AudioClass {
    settings: BTreeMap<(u16, u16), Vec<Vec<u8>>>,
}

impl AudioClass {
    pub fn new() -> Self {
        let mut settings = BTreeMap::new();
        let mut insert = |val: u16, idx: u16, slots: &[&[u8]]| {
            settings.insert(
                (val, idx),
                slots.iter().map(|s| s.to_vec()).collect::<Vec<_>>(),
            );
        };
        // (wValue, wIndex) -> [cur, min, max, res, (idle)]
        insert(0x0100, 0x0001, &[b"\x44\xac\x00", b"\x44\xac\x00", b"\x80\xbb\x00", b"\x80\xbb\x00"]);
        insert(0x0100, 0x0082, &[b"\x44\xac\x00", b"\x44\xac\x00", b"\x80\xbb\x00", b"\x80\xbb\x00"]);
        insert(0x0100, 0x0900, &[b"\x00", b"\x00", b"\xff", b"\x00"]);
        insert(0x0100, 0x0a00, &[b"\x01", b"\x00", b"\xff", b"\x00"]);
        insert(0x0100, 0x0d00, &[b"\x01", b"\x00", b"\xff", b"\x00"]);
        insert(0x0101, 0x0f00, &[b"\x01", b"\x00", b"\xff", b"\x00"]);
        insert(0x0102, 0x0f00, &[b"\x01", b"\x00", b"\xff", b"\x00"]);
        insert(0x0200, 0x0a00, &[b"\x00\x00", b"\x00\x00", b"\xd0\x17", b"\x30\x00", b"\x00\x00"]);
        insert(0x0200, 0x0d00, &[b"\x80\x22", b"\x00\x00", b"\xd0\x2f", b"\x30\x00"]);
        insert(0x0201, 0x0900, &[b"\x80\x22", b"\xa0\xe3", b"\xf0\xff", b"\x30\x00"]);
        insert(0x0201, 0x0f00, &[b"\x01", b"\x00", b"\xff", b"\x00"]);
        insert(0x0202, 0x0900, &[b"\xcf\x00", b"\x00\x00", b"\xcf\x00", b"\x30\x00"]);
        insert(0x0202, 0x0f00, &[b"\x01", b"\x00", b"\xff", b"\x00"]);
        insert(0x0301, 0x0f00, &[b"\x01", b"\x00", b"\xff", b"\x00"]);
        insert(0x0302, 0x0f00, &[b"\x00\x00", b"\x00\x00", b"\x00\x00", b"\x00\x00"]);
        insert(0x0700, 0x0a00, &[b"\x01", b"\x00", b"\xff", b"\x00"]);
        Self { settings }
    }

    fn set_param(&mut self, req: &ControlRequest, param: usize) -> Option<Vec<u8>> {
        let key = (req.setup.value(), req.setup.w_index.to_primitive());
        match self.settings.get_mut(&key) {
            Some(slots) if param < slots.len() => {
                slots[param] = req.data.clone();
                Some(Vec::new())
            }
            _ => {
                log::warn!("no audio parameter ({:#x}, {:#x}, {param})", key.0, key.1);
                None
            }
        }
    }

    fn get_param(&self, req: &ControlRequest, param: usize) -> Option<Vec<u8>> {
        let key = (req.setup.value(), req.setup.w_index.to_primitive());
        match self.settings.get(&key) {
            Some(slots) if param < slots.len() => Some(slots[param].clone()),
            _ => {
                log::warn!("no audio parameter ({:#x}, {:#x}, {param})", key.0, key.1);
                None
            }
        }
    }
}

impl Default for AudioClass {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbClass for AudioClass {
    fn name(&self) -> &'static str {
        "audio class"
    }

    fn request_codes(&self) -> Vec<u8> {
        vec![0x01, 0x04, 0x0a, 0x81, 0x82, 0x83, 0x84]
    }

    fn handle(&mut self, fuzz: &MutationBroker, req: &ControlRequest) -> Option<Vec<u8>> {
        let session = SessionData::new();
        match req.setup.b_request {
            0x01 => fuzz.wrap("audio_set_cur_response", &session, || {
                self.set_param(req, PARAM_CUR)
            }),
            0x04 => fuzz.wrap("audio_set_res_response", &session, || {
                self.set_param(req, PARAM_RES)
            }),
            0x0a => fuzz.wrap("audio_set_idle_response", &session, || {
                self.set_param(req, PARAM_IDLE)
            }),
            0x81 => fuzz.wrap("audio_get_cur_response", &session, || {
                self.get_param(req, PARAM_CUR)
            }),
            0x82 => fuzz.wrap("audio_get_min_response", &session, || {
                self.get_param(req, PARAM_MIN)
            }),
            0x83 => fuzz.wrap("audio_get_max_response", &session, || {
                self.get_param(req, PARAM_MAX)
            }),
            0x84 => fuzz.wrap("audio_get_res_response", &session, || {
                self.get_param(req, PARAM_RES)
            }),
            _ => None,
        }
    }
}

pub fn device(opts: &DeviceOptions, broker: Arc<MutationBroker>) -> Result<Device> {
    // streaming IN endpoint sends queued samples, or silence
    let txq: Arc<Mutex<VecDeque<Vec<u8>>>> = Arc::new(Mutex::new(VecDeque::new()));
    let stream_in = EndpointHandler::In(Box::new(move |phy| {
        let next = txq.lock().unwrap().pop_front();
        let frame = next.unwrap_or_else(|| vec![0u8; 8]);
        if let Err(e) = phy.send_on_endpoint(2, &frame) {
            log::error!("failed to send audio frame: {e}");
        }
    }));
    let stream_out = EndpointHandler::Out(Box::new(|_phy, data| {
        log::info!("got {:#x} bytes on the streaming endpoint", data.len());
    }));

    // audio control interface: class-specific topology, no endpoints
    let control = Interface::new(0, UsbClassCode::Audio as u8, SUBCLASS_AUDIOCONTROL, 0)
        .with_cs_interface(CsInterfaceDescriptor::new(
            0x01,
            b"\x00\x01\x64\x00\x02\x01\x02",
        ))
        .with_cs_interface(CsInterfaceDescriptor::new(
            0x02,
            b"\x01\x01\x01\x00\x02\x03\x00\x00\x00",
        ))
        .with_cs_interface(CsInterfaceDescriptor::new(
            0x02,
            b"\x02\x01\x02\x00\x01\x01\x00\x00\x00",
        ))
        .with_cs_interface(CsInterfaceDescriptor::new(0x03, b"\x06\x01\x03\x00\x09\x00"))
        .with_cs_interface(CsInterfaceDescriptor::new(0x03, b"\x07\x01\x01\x00\x08\x00"))
        .with_cs_interface(CsInterfaceDescriptor::new(0x05, b"\x08\x01\x0a\x00"))
        .with_cs_interface(CsInterfaceDescriptor::new(
            0x06,
            b"\x09\x0f\x01\x01\x02\x02\x00",
        ))
        .with_cs_interface(CsInterfaceDescriptor::new(0x06, b"\x0a\x02\x01\x43\x00\x00"))
        .with_cs_interface(CsInterfaceDescriptor::new(0x06, b"\x0d\x02\x01\x03\x00\x00"))
        .with_cs_interface(CsInterfaceDescriptor::new(
            0x04,
            b"\x0f\x02\x01\x0d\x02\x03\x00\x00\x00\x00",
        ));

    // streaming interface: host-to-device samples
    let streaming_out = Interface::new(1, UsbClassCode::Audio as u8, SUBCLASS_AUDIOSTREAMING, 0)
        .with_cs_interface(CsInterfaceDescriptor::new(0x01, b"\x01\x01\x01\x00"))
        .with_cs_interface(CsInterfaceDescriptor::new(
            0x02,
            b"\x01\x02\x02\x10\x02\x44\xac\x00\x44\xac\x00",
        ))
        .with_endpoint(
            Endpoint::new(1, Direction::Out, TransferType::Isochronous, 0x40, 1, stream_out)
                .with_sync_type(SyncType::Adaptive)
                .with_cs_endpoint(CsEndpointDescriptor::new(0x01, b"\x01\x01\x01\x00")),
        );

    // streaming interface: device-to-host samples
    let streaming_in = Interface::new(2, UsbClassCode::Audio as u8, SUBCLASS_AUDIOSTREAMING, 0)
        .with_cs_interface(CsInterfaceDescriptor::new(0x01, b"\x07\x01\x01\x00"))
        .with_cs_interface(CsInterfaceDescriptor::new(
            0x02,
            b"\x01\x01\x02\x10\x02\x44\xac\x00\x44\xac\x00",
        ))
        .with_endpoint(
            Endpoint::new(2, Direction::In, TransferType::Isochronous, 0x40, 1, stream_in)
                .with_sync_type(SyncType::Async)
                .with_cs_endpoint(CsEndpointDescriptor::new(0x01, b"\x01\x00\x00\x00")),
        );

    Ok(DeviceBuilder::new(
        "audio device",
        opts.vid.unwrap_or(0x0d8c),
        opts.pid.unwrap_or(0x000c),
        broker,
    )
    .revision(0x0001)
    .manufacturer("Phantom Sound Inc.")
    .product("Phantom Audio Adapter")
    .serial("PHANTOM-12345-AUDIO")
    .configuration(
        Configuration::new(
            1,
            "Phantom Audio Configuration",
            vec![control, streaming_out, streaming_in],
        )
        .with_attributes(Configuration::ATTR_BASE),
    )
    .usb_class(Box::new(AudioClass::new()))
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
    fn get_cur_reads_the_parameter_table() {
        let (mut dev, mut phy) = configured();
        // GET_CUR for sampling frequency: wValue 0x0100, wIndex 0x0001
        dev.handle_request(&[0xa1, 0x81, 0x00, 0x01, 0x01, 0x00, 0x03, 0x00], &mut phy)
            .unwrap();
        assert_eq!(phy.last_ep0().unwrap(), &[0x44, 0xac, 0x00]);
    }

    #[test]
    fn set_cur_overwrites_then_get_cur_reads_back() {
        let (mut dev, mut phy) = configured();
        dev.handle_request(
            &[0x21, 0x01, 0x00, 0x01, 0x01, 0x00, 0x03, 0x00, 0x80, 0xbb, 0x00],
            &mut phy,
        )
        .unwrap();
        dev.handle_request(&[0xa1, 0x81, 0x00, 0x01, 0x01, 0x00, 0x03, 0x00], &mut phy)
            .unwrap();
        assert_eq!(phy.last_ep0().unwrap(), &[0x80, 0xbb, 0x00]);
    }

    #[test]
    fn unknown_parameter_stalls() {
        let (mut dev, mut phy) = configured();
        dev.handle_request(&[0xa1, 0x81, 0x34, 0x12, 0x01, 0x00, 0x03, 0x00], &mut phy)
            .unwrap();
        assert_eq!(phy.stalls, 1);
    }

    #[test]
    fn streaming_endpoint_sends_silence_when_idle() {
        let (mut dev, mut phy) = configured();
        dev.handle_buffer_available(2, &mut phy);
        let (ep, frame) = phy.sent.last().unwrap();
        assert_eq!(*ep, 2);
        assert_eq!(frame, &vec![0u8; 8]);
    }

    #[test]
    fn configuration_carries_class_specific_endpoint_descriptors() {
        let dev = device(
            &DeviceOptions::default(),
            Arc::new(MutationBroker::passthrough()),
        )
        .unwrap();
        let d = dev.descriptor_response(0x02, 0).unwrap();
        let cs_eps = d.windows(2).filter(|w| w[1] == 0x25).count();
        assert_eq!(cs_eps, 2);
        let total = u16::from_le_bytes([d[2], d[3]]) as usize;
        assert_eq!(total, d.len());
    }
}
