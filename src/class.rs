//! Class and vendor request handling: one trait per handler role, plus the
//! "function supported by host" signal raised whenever a class or vendor
//! request is serviced.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::fuzz::MutationBroker;
use crate::usb::ControlRequest;

/// Services class requests (bmRequestType type bits = 1) for a device.
///
/// `handle` returns the control response for `bRequest`: `Some(bytes)` is a
/// data stage payload, `Some(vec![])` an acknowledgement, and `None` means
/// the code is not serviced, which the engine answers with a stall.
pub trait UsbClass: Send {
    fn name(&self) -> &'static str;

    /// The bRequest codes this handler services, for the stall log.
    fn request_codes(&self) -> Vec<u8>;

    fn handle(&mut self, fuzz: &MutationBroker, req: &ControlRequest) -> Option<Vec<u8>>;
}

/// Services vendor requests (bmRequestType type bits = 2). Same contract as
/// [`UsbClass`]; kept as a distinct role so devices can carry both.
pub trait UsbVendor: Send {
    fn name(&self) -> &'static str;

    fn request_codes(&self) -> Vec<u8>;

    fn handle(&mut self, fuzz: &MutationBroker, req: &ControlRequest) -> Option<Vec<u8>>;
}

#[derive(Default)]
struct SignalState {
    supported: AtomicBool,
    count: AtomicU32,
}

/// Shared flag between the engine and the application: set when the host
/// demonstrates that it drives this device's function (a class or vendor
/// request was serviced, or data arrived on a configured endpoint).
#[derive(Clone, Default)]
pub struct FunctionSignal(Arc<SignalState>);

impl FunctionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, reason: &str) {
        if !self.0.supported.swap(true, Ordering::SeqCst) {
            log::info!("usb function supported by host: {reason}");
        }
        self.0.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_supported(&self) -> bool {
        self.0.supported.load(Ordering::SeqCst)
    }

    pub fn count(&self) -> u32 {
        self.0.count.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.supported.store(false, Ordering::SeqCst);
        self.0.count.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_latches_and_counts() {
        let signal = FunctionSignal::new();
        assert!(!signal.is_supported());
        signal.mark("first");
        signal.mark("second");
        assert!(signal.is_supported());
        assert_eq!(signal.count(), 2);
        signal.reset();
        assert!(!signal.is_supported());
        assert_eq!(signal.count(), 0);
    }
}
