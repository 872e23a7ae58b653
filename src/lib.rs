//! Software emulation of USB peripherals for host-side security assessment.
//!
//! A [`device::Device`] holds a typed descriptor graph (configurations,
//! interfaces, endpoints, class-specific extensions) and a control-transfer
//! engine for endpoint 0. A [`phy::Phy`] back-end moves bytes between the
//! device model and a real USB line; two back-ends are provided, one driving
//! a register-polled serial USB interface chip and one driving the Linux
//! gadgetfs kernel interface. Every descriptor serializer and class response
//! is routed through a [`fuzz::MutationBroker`], which can substitute bytes
//! obtained from a remote fuzzer without the protocol engine noticing.

pub mod app;
pub mod class;
pub mod configuration;
pub mod dev;
pub mod device;
pub mod endpoint;
pub mod fuzz;
pub mod interface;
pub mod phy;
pub mod usb;

use thiserror::Error as ThisError;

/// Crate-wide error type.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A malformed or unsupported request from the host. The engine answers
    /// these with a stall; they never abort the run loop.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A failure on the physical transport (serial line, gadget files).
    /// Propagates to the application run loop, which disconnects the device.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// An invalid startup configuration (unknown PHY string, unknown device
    /// class, unreadable disk image). Fatal.
    #[error("configuration error: {0}")]
    Config(String),
    /// A failure talking to the remote fuzzer. The broker degrades to
    /// pass-through when it sees one of these.
    #[error("fuzzer error: {0}")]
    Fuzzer(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Transport(std::io::Error::from_raw_os_error(errno as i32))
    }
}
