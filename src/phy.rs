//! The physical-layer abstraction. A PHY moves bytes between the device
//! model and a real (or emulated) USB line; the engine only sees the narrow
//! [`PhyIo`] surface while a request is in flight, the application drives
//! the wider [`Phy`] lifecycle.

pub mod facedancer;
pub mod gadgetfs;
pub mod max342x;
pub mod mock;

use crate::device::Device;
use crate::usb::Direction;
use crate::Result;

/// Serialized endpoint parameters handed to the PHY when the host selects a
/// configuration: the canonical endpoint descriptor at both speeds, so a
/// back-end that programs per-endpoint kernel files can do so without
/// reaching back into the device graph.
#[derive(Debug, Clone)]
pub struct EndpointInit {
    pub number: u8,
    pub direction: Direction,
    pub fs_descriptor: Vec<u8>,
    pub hs_descriptor: Vec<u8>,
}

/// The engine-facing side of a PHY, available while a control transfer or
/// endpoint callback is being serviced.
pub trait PhyIo {
    /// Queue `data` for transmission on the given endpoint.
    fn send_on_endpoint(&mut self, ep_num: u8, data: &[u8]) -> Result<()>;

    /// Signal a protocol error on the control endpoint.
    fn stall_ep0(&mut self) -> Result<()>;

    /// Acknowledge the no-data status stage of a control transfer.
    fn ack_status_stage(&mut self) -> Result<()>;

    /// Called by the engine during SET_CONFIGURATION with the chosen
    /// configuration's endpoints. Back-ends with fixed endpoint hardware
    /// ignore this.
    fn configure_endpoints(&mut self, endpoints: &[EndpointInit]) -> Result<()> {
        let _ = endpoints;
        Ok(())
    }
}

/// The application's stop predicate, consulted once per serviced packet.
/// Returning `true` ends the PHY run loop.
pub trait RunPolicy {
    fn packet_processed(&mut self) -> bool;
}

/// The application-facing side of a PHY back-end.
pub trait Phy: PhyIo {
    /// Attach the device to the physical line. Implementations mark the
    /// device powered and record the line speed on it.
    fn connect(&mut self, device: &mut Device) -> Result<()>;

    /// Tear down worker threads and file handles.
    fn disconnect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Block, driving the device until the stop predicate fires or the
    /// transport fails.
    fn run(&mut self, device: &mut Device, policy: &mut dyn RunPolicy) -> Result<()>;
}
