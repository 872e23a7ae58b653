//! Register-poll PHY back-end: drives a MAX342x-family USB interface chip
//! over the framed serial link.
//!
//! The chip exposes FIFOs and an interrupt register; the run loop polls the
//! interrupt register and services, in priority order, setup data, OUT
//! endpoint 1 data, and IN endpoint 2/3 buffer space. Writing an IN
//! endpoint goes through a 64-byte FIFO and must be chunked, each chunk
//! committed by writing the byte-count register with the ack bit set.

use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::device::Device;
use crate::phy::facedancer::{BoardCommand, FacedancerLink, SerialLine};
use crate::phy::{Phy, PhyIo, RunPolicy};
use crate::usb::{DeviceState, Speed};
use crate::{Error, Result};

/// MAX342x register numbers.
mod regs {
    pub const EP0_FIFO: u8 = 0x00;
    pub const EP1_OUT_FIFO: u8 = 0x01;
    pub const EP2_IN_FIFO: u8 = 0x02;
    pub const EP3_IN_FIFO: u8 = 0x03;
    pub const SETUP_DATA_FIFO: u8 = 0x04;
    pub const EP0_BYTE_COUNT: u8 = 0x05;
    pub const EP1_OUT_BYTE_COUNT: u8 = 0x06;
    pub const EP2_IN_BYTE_COUNT: u8 = 0x07;
    pub const EP3_IN_BYTE_COUNT: u8 = 0x08;
    pub const EP_STALLS: u8 = 0x09;
    pub const ENDPOINT_IRQ: u8 = 0x0b;
    pub const USB_CONTROL: u8 = 0x0f;
    pub const PIN_CONTROL: u8 = 0x11;
    pub const REVISION: u8 = 0x12;
}

// endpoint interrupt register bits
const IS_SETUP_DATA_AVAIL: u8 = 0x20;
const IS_IN3_BUFFER_AVAIL: u8 = 0x10;
const IS_IN2_BUFFER_AVAIL: u8 = 0x08;
const IS_OUT1_DATA_AVAIL: u8 = 0x04;
const IS_OUT0_DATA_AVAIL: u8 = 0x02;
const IS_IN0_BUFFER_AVAIL: u8 = 0x01;

// usb control register bits
const USB_CONTROL_VBGATE: u8 = 0x40;
const USB_CONTROL_CONNECT: u8 = 0x08;

// pin control register bits
const PIN_INTERRUPT_LEVEL: u8 = 0x08;
const PIN_FULL_DUPLEX: u8 = 0x10;

/// Stall both directions of EP0 plus the setup stage.
const EP0_STALL_BITS: u8 = 0x23;

const APP_NUM: u8 = 0x40;
const VERB_REGISTER: u8 = 0x00;
const VERB_ENABLE: u8 = 0x10;

const CHIP_FIFO_SIZE: usize = 64;

/// Flag files driven by the fuzzer's companion RPC for timed reconnects.
const TRIGGER_DIR: &str = "/tmp/umap_kitty";

/// Engine-facing chip access: register reads/writes and the EP0 control
/// operations, all through the framed link.
pub struct Max342xIo {
    link: FacedancerLink,
}

impl Max342xIo {
    fn read_register(&mut self, reg: u8) -> Result<u8> {
        let cmd = BoardCommand::new(APP_NUM, VERB_REGISTER, vec![reg << 3, 0]);
        self.link.write_command(&cmd)?;
        let resp = self.link.read_command()?;
        if resp.data.len() < 2 {
            return Err(Error::Protocol(format!(
                "short register read reply for register {reg:#04x}"
            )));
        }
        Ok(resp.data[1])
    }

    fn write_register(&mut self, reg: u8, value: u8, ack: bool) -> Result<()> {
        let mask = if ack { 3 } else { 2 };
        let cmd = BoardCommand::new(APP_NUM, VERB_REGISTER, vec![(reg << 3) | mask, value]);
        self.link.write_command(&cmd)?;
        self.link.read_command()?;
        Ok(())
    }

    fn read_bytes(&mut self, reg: u8, n: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; n + 1];
        data[0] = reg << 3;
        let cmd = BoardCommand::new(APP_NUM, VERB_REGISTER, data);
        self.link.write_command(&cmd)?;
        let resp = self.link.read_command()?;
        if resp.data.is_empty() {
            return Err(Error::Protocol(format!(
                "empty reply reading {n} bytes from register {reg:#04x}"
            )));
        }
        Ok(resp.data[1..].to_vec())
    }

    fn write_bytes(&mut self, reg: u8, data: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(data.len() + 1);
        payload.push((reg << 3) | 3);
        payload.extend_from_slice(data);
        let cmd = BoardCommand::new(APP_NUM, VERB_REGISTER, payload);
        self.link.write_command(&cmd)?;
        // null reply
        self.link.read_command()?;
        Ok(())
    }

    fn enable(&mut self) -> Result<()> {
        let cmd = BoardCommand::new(APP_NUM, VERB_ENABLE, Vec::new());
        for _ in 0..3 {
            self.link.write_command(&cmd)?;
            self.link.read_command()?;
        }
        log::info!("chip enabled");
        Ok(())
    }
}

impl PhyIo for Max342xIo {
    fn send_on_endpoint(&mut self, ep_num: u8, data: &[u8]) -> Result<()> {
        let (fifo_reg, bc_reg) = match ep_num {
            0 => (regs::EP0_FIFO, regs::EP0_BYTE_COUNT),
            2 => (regs::EP2_IN_FIFO, regs::EP2_IN_BYTE_COUNT),
            3 => (regs::EP3_IN_FIFO, regs::EP3_IN_BYTE_COUNT),
            _ => {
                return Err(Error::Protocol(format!(
                    "endpoint {ep_num} not wired on this chip"
                )))
            }
        };
        // the chip FIFO holds 64 bytes, longer transfers go in chunks
        let mut rest = data;
        while rest.len() > CHIP_FIFO_SIZE {
            self.write_bytes(fifo_reg, &rest[..CHIP_FIFO_SIZE])?;
            self.write_register(bc_reg, CHIP_FIFO_SIZE as u8, true)?;
            rest = &rest[CHIP_FIFO_SIZE..];
        }
        self.write_bytes(fifo_reg, rest)?;
        self.write_register(bc_reg, rest.len() as u8, true)?;
        log::trace!("wrote {} bytes to endpoint {ep_num}", data.len());
        Ok(())
    }

    fn stall_ep0(&mut self) -> Result<()> {
        log::debug!("stalling endpoint 0");
        self.write_register(regs::EP_STALLS, EP0_STALL_BITS, false)
    }

    fn ack_status_stage(&mut self) -> Result<()> {
        log::trace!("acking status stage");
        self.link
            .write_command(&BoardCommand::new(APP_NUM, VERB_REGISTER, vec![0x01]))?;
        self.link.read_command()?;
        Ok(())
    }
}

/// The register-poll PHY back-end.
pub struct Max342xPhy {
    io: Max342xIo,
    connected: bool,
    fuzzing: bool,
    last_irq: u8,
}

impl Max342xPhy {
    /// Bring up the chip: reset the board, enable the app, read the chip
    /// revision, and select full duplex with a negative interrupt level.
    pub fn new(line: Box<dyn SerialLine>, fuzzing: bool) -> Result<Self> {
        let link = FacedancerLink::open(line)?;
        let mut io = Max342xIo { link };
        io.enable()?;
        let revision = io.read_register(regs::REVISION)?;
        log::info!("chip revision: {revision}");
        io.write_register(
            regs::PIN_CONTROL,
            PIN_FULL_DUPLEX | PIN_INTERRUPT_LEVEL,
            false,
        )?;
        Ok(Self {
            io,
            connected: false,
            fuzzing,
            last_irq: 0,
        })
    }

    /// Open the serial device and bring up the chip.
    pub fn open(serial_device: &Path, fuzzing: bool) -> Result<Self> {
        let line = super::facedancer::TtyLine::open(serial_device)?;
        Self::new(Box::new(line), fuzzing)
    }

    fn read_from_endpoint(&mut self, ep_num: u8) -> Result<Vec<u8>> {
        if ep_num != 1 {
            return Ok(Vec::new());
        }
        let byte_count = self.io.read_register(regs::EP1_OUT_BYTE_COUNT)? as usize;
        if byte_count == 0 {
            return Ok(Vec::new());
        }
        self.io.read_bytes(regs::EP1_OUT_FIFO, byte_count)
    }

    fn service_irqs(&mut self, device: &mut Device, policy: &mut dyn RunPolicy) -> Result<()> {
        loop {
            if self.fuzzing && self.check_connection_commands(device)? {
                continue;
            }
            let irq = self.io.read_register(regs::ENDPOINT_IRQ)?;
            if irq != self.last_irq {
                self.send_heartbeat();
            }
            if irq & !(IS_IN0_BUFFER_AVAIL | IS_IN2_BUFFER_AVAIL | IS_IN3_BUFFER_AVAIL) != 0 {
                log::debug!("notable irq: {irq:#04x}");
            }

            if irq & IS_SETUP_DATA_AVAIL != 0 {
                self.io
                    .write_register(regs::ENDPOINT_IRQ, IS_SETUP_DATA_AVAIL, false)?;
                let mut buf = self.io.read_bytes(regs::SETUP_DATA_FIFO, 8)?;
                // host-to-device setups with a data stage carry the payload
                // in the EP0 FIFO
                if irq & IS_OUT0_DATA_AVAIL != 0 && buf.len() >= 8 && buf[0] & 0x80 == 0 {
                    let n = u16::from_le_bytes([buf[6], buf[7]]) as usize;
                    if n > 0 {
                        let extra = self.io.read_bytes(regs::EP0_FIFO, n)?;
                        buf.extend_from_slice(&extra);
                    }
                }
                device.handle_request(&buf, &mut self.io)?;
            }

            if irq & IS_OUT1_DATA_AVAIL != 0 {
                let data = self.read_from_endpoint(1)?;
                if !data.is_empty() {
                    device.handle_data_available(1, &data, &mut self.io);
                }
                self.io
                    .write_register(regs::ENDPOINT_IRQ, IS_OUT1_DATA_AVAIL, false)?;
            }

            if irq & IS_IN2_BUFFER_AVAIL != 0 {
                device.handle_buffer_available(2, &mut self.io);
            }

            if irq & IS_IN3_BUFFER_AVAIL != 0 {
                device.handle_buffer_available(3, &mut self.io);
            }

            self.last_irq = irq;
            if policy.packet_processed() {
                break;
            }
        }
        Ok(())
    }

    /// Honor the fuzzer's disconnect/reconnect flag files. Returns true when
    /// a reconnect happened and the IRQ loop should restart.
    fn check_connection_commands(&mut self, device: &mut Device) -> Result<bool> {
        if trigger_set("trigger_disconnect") {
            self.disconnect()?;
            device.set_state(DeviceState::Detached);
            clear_trigger("trigger_disconnect");
            while !trigger_set("trigger_reconnect") {
                clear_trigger("trigger_disconnect");
                thread::sleep(Duration::from_millis(100));
            }
        }
        if trigger_set("trigger_reconnect") {
            self.connect(device)?;
            clear_trigger("trigger_reconnect");
            return Ok(true);
        }
        Ok(false)
    }

    fn send_heartbeat(&self) {
        if !self.fuzzing {
            return;
        }
        let dir = Path::new(TRIGGER_DIR);
        if dir.is_dir() {
            let _ = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("heartbeat"));
        }
    }
}

fn trigger_set(name: &str) -> bool {
    Path::new(TRIGGER_DIR).join(name).is_file()
}

fn clear_trigger(name: &str) {
    let path = Path::new(TRIGGER_DIR).join(name);
    if path.is_file() {
        let _ = std::fs::remove_file(path);
    }
}

impl PhyIo for Max342xPhy {
    fn send_on_endpoint(&mut self, ep_num: u8, data: &[u8]) -> Result<()> {
        self.io.send_on_endpoint(ep_num, data)
    }

    fn stall_ep0(&mut self) -> Result<()> {
        self.io.stall_ep0()
    }

    fn ack_status_stage(&mut self) -> Result<()> {
        self.io.ack_status_stage()
    }
}

impl Phy for Max342xPhy {
    fn connect(&mut self, device: &mut Device) -> Result<()> {
        self.io.write_register(
            regs::USB_CONTROL,
            USB_CONTROL_VBGATE | USB_CONTROL_CONNECT,
            false,
        )?;
        self.connected = true;
        device.set_speed(Speed::Full);
        device.set_state(DeviceState::Powered);
        log::info!("connected device {}", device.name());
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.io
            .write_register(regs::USB_CONTROL, USB_CONTROL_VBGATE, false)?;
        if !self.connected {
            log::warn!("disconnect called when already disconnected");
        }
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn run(&mut self, device: &mut Device, policy: &mut dyn RunPolicy) -> Result<()> {
        log::debug!("started irq service loop");
        self.service_irqs(device, policy)?;
        log::debug!("done with irq service loop");
        Ok(())
    }
}
