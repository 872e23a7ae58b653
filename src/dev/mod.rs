//! Device templates: ready-made descriptor graphs and handlers for the
//! emulated device classes, plus the registry the applications load them
//! through.

pub mod audio;
pub mod cdc;
pub mod cdc_acm;
pub mod ftdi;
pub mod hub;
pub mod keyboard;
pub mod mass_storage;
pub mod printer;
pub mod vendor_specific;

use std::path::PathBuf;
use std::sync::Arc;

use crate::device::Device;
use crate::fuzz::MutationBroker;
use crate::{Error, Result};

/// User-supplied overrides for a device template.
#[derive(Debug, Clone, Default)]
pub struct DeviceOptions {
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub disk_image: Option<PathBuf>,
}

/// Available device classes: name and description.
pub const CLASSES: &[(&str, &str)] = &[
    ("audio", "headset with audio control and streaming interfaces"),
    ("cdc_acm", "abstract control model device (like serial modem)"),
    ("ftdi", "USB<->RS232 FTDI chip"),
    ("hub", "USB hub"),
    ("keyboard", "HID boot keyboard"),
    ("mass_storage", "disk on key"),
    ("printer", "printer"),
    ("vendor_specific", "device servicing every class/vendor request"),
];

/// Device classes of the original tool set that this emulator does not
/// carry. Listed so asking for one is answered with "not carried" rather
/// than "unknown".
pub const UNAVAILABLE_CLASSES: &[(&str, &str)] = &[
    ("billboard", "billboard, requires USB 2.1 and higher"),
    ("iphone", "Apple iPhone"),
    ("mtp", "Android phone"),
    ("smartcard", "USB<->smart card interface"),
];

/// Build a device by class name.
pub fn build(name: &str, opts: &DeviceOptions, broker: Arc<MutationBroker>) -> Result<Device> {
    log::info!("loading USB device {name}");
    match name {
        "audio" => audio::device(opts, broker),
        "cdc_acm" => cdc_acm::device(opts, broker),
        "ftdi" => ftdi::device(opts, broker),
        "hub" => hub::device(opts, broker),
        "keyboard" => keyboard::device(opts, broker),
        "mass_storage" => mass_storage::device(opts, broker),
        "printer" => printer::device(opts, broker),
        "vendor_specific" => vendor_specific::device(opts, broker),
        other if UNAVAILABLE_CLASSES.iter().any(|(name, _)| *name == other) => Err(
            Error::Config(format!("device class {other} is not carried in this emulator")),
        ),
        other => Err(Error::Config(format!("unknown device class: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_class_builds() {
        for (name, _) in CLASSES {
            if *name == "mass_storage" {
                // needs a disk image, covered in its own tests
                continue;
            }
            let broker = Arc::new(MutationBroker::passthrough());
            let device = build(name, &DeviceOptions::default(), broker);
            assert!(device.is_ok(), "class {name} failed to build");
        }
    }

    #[test]
    fn unknown_class_is_a_config_error() {
        let broker = Arc::new(MutationBroker::passthrough());
        assert!(matches!(
            build("toaster", &DeviceOptions::default(), broker),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn uncarried_classes_are_reported_as_such() {
        for (name, _) in UNAVAILABLE_CLASSES {
            let broker = Arc::new(MutationBroker::passthrough());
            let err = build(name, &DeviceOptions::default(), broker).unwrap_err();
            let message = err.to_string();
            assert!(
                message.contains("not carried"),
                "{name} answered {message:?}"
            );
        }
    }

    #[test]
    fn vid_pid_overrides_apply() {
        let broker = Arc::new(MutationBroker::passthrough());
        let opts = DeviceOptions {
            vid: Some(0x1111),
            pid: Some(0x2222),
            disk_image: None,
        };
        let device = build("ftdi", &opts, broker).unwrap();
        let d = device.descriptor(true);
        assert_eq!(&d[8..12], &[0x11, 0x11, 0x22, 0x22]);
    }
}
