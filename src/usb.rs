//! USB transport layer: device discovery and the blocking port abstraction.
//!
//! The DAQFlex protocol runs over two pipes of the same USB device: vendor
//! control transfers carry the ASCII command channel, and one bulk-IN
//! endpoint streams raw scan data. [`UsbPort`] is the seam between the
//! driver and libusb, so the protocol logic in [`crate::device`] can be
//! exercised against an in-memory port in tests.

use std::time::Duration;

use log::{debug, warn};
use rusb::{ConfigDescriptor, DeviceHandle, Direction, GlobalContext, Recipient, RequestType,
           TransferType};

use crate::errors::{DriverError, Result};

/// Fallback bulk packet size for models without a bulk-IN endpoint.
const DEFAULT_BULK_PACKET_SIZE: usize = 64;

/// Outcome of one bulk-IN read.
///
/// A timeout is steady-state noise during scan readout (the host polls
/// faster than the device produces), so it is a value here rather than an
/// error; only genuine transport faults travel through the `Err` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkRead {
    /// `n` bytes were read into the buffer; `Data(0)` is the device's
    /// end-of-stream sentinel.
    Data(usize),
    /// No data arrived within the caller's timeout.
    Timeout,
}

/// Synchronous transport operations against one physical device.
///
/// All transfers block the calling thread for at most the supplied timeout.
/// Commands always use `wValue = 0`, `wIndex = 0`; only the vendor request
/// code varies.
pub trait UsbPort: Send + Sync {
    /// Vendor host-to-device control transfer. Returns the byte count the
    /// device accepted.
    fn control_out(&self, request: u8, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Vendor device-to-host control transfer into `buf`. Returns the byte
    /// count received.
    fn control_in(&self, request: u8, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// One bulk-IN read of at most `buf.len()` bytes.
    fn bulk_read(&self, buf: &mut [u8], timeout: Duration) -> Result<BulkRead>;

    /// Max packet size of the bulk-IN endpoint in bytes.
    fn bulk_packet_size(&self) -> usize;
}

/// libusb-backed [`UsbPort`] for an opened, claimed DAQFlex module.
pub struct RusbPort {
    handle: DeviceHandle<GlobalContext>,
    /// Absent on models without a scan endpoint (e.g. USB-2001-TC); bulk
    /// reads then fail with `rusb::Error::NotFound`.
    bulk_in_address: Option<u8>,
    bulk_packet_size: usize,
}

impl RusbPort {
    /// Open the first attached device matching `vendor_id`/`product_id`,
    /// optionally narrowed to one serial number, claim its interface and
    /// locate the bulk-IN endpoint.
    pub fn open(vendor_id: u16, product_id: u16, serial_number: Option<&str>) -> Result<Self> {
        for device in rusb::devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if descriptor.vendor_id() != vendor_id || descriptor.product_id() != product_id {
                continue;
            }
            let handle = device.open()?;
            if let Some(wanted) = serial_number {
                let serial = handle
                    .read_serial_number_string_ascii(&descriptor)
                    .unwrap_or_default();
                if serial != wanted {
                    continue;
                }
            }

            // Linux may have usbfs or hid bound to the interface.
            let _ = handle.set_auto_detach_kernel_driver(true);

            let config = match device.active_config_descriptor() {
                Ok(c) => c,
                Err(_) => {
                    let c = device.config_descriptor(0)?;
                    handle.set_active_configuration(c.number())?;
                    c
                }
            };

            let (interface_number, bulk_in) = locate_bulk_in(&config);
            handle.claim_interface(interface_number)?;

            let (bulk_in_address, bulk_packet_size) = match bulk_in {
                Some((address, size)) => (Some(address), size),
                None => {
                    debug!("no bulk-IN endpoint, scan readout unavailable");
                    (None, DEFAULT_BULK_PACKET_SIZE)
                }
            };
            debug!(
                "opened {vendor_id:#06x}:{product_id:#06x}, interface {interface_number}, \
                 bulk-in {bulk_in_address:?} ({bulk_packet_size} bytes)"
            );
            return Ok(Self {
                handle,
                bulk_in_address,
                bulk_packet_size,
            });
        }
        Err(DriverError::DeviceNotFound {
            vendor_id,
            product_id,
        })
    }

    /// Serial numbers of every attached device with the given ids.
    pub fn find_serial_numbers(vendor_id: u16, product_id: u16) -> Result<Vec<String>> {
        let mut serials = Vec::new();
        for device in rusb::devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if descriptor.vendor_id() != vendor_id || descriptor.product_id() != product_id {
                continue;
            }
            match device.open() {
                Ok(handle) => {
                    if let Ok(serial) = handle.read_serial_number_string_ascii(&descriptor) {
                        serials.push(serial);
                    }
                }
                Err(e) => warn!("skipping unreadable device on enumeration: {e}"),
            }
        }
        Ok(serials)
    }
}

/// First interface carrying a bulk-IN endpoint, or the first interface at
/// all when none does (the command channel still needs a claimed interface).
fn locate_bulk_in(config: &ConfigDescriptor) -> (u8, Option<(u8, usize)>) {
    let mut first_interface = 0;
    for (i, interface) in config.interfaces().enumerate() {
        if i == 0 {
            first_interface = interface.number();
        }
        for descriptor in interface.descriptors() {
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.direction() == Direction::In
                    && endpoint.transfer_type() == TransferType::Bulk
                {
                    return (
                        interface.number(),
                        Some((endpoint.address(), endpoint.max_packet_size() as usize)),
                    );
                }
            }
        }
    }
    (first_interface, None)
}

impl UsbPort for RusbPort {
    fn control_out(&self, request: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        let request_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        Ok(self
            .handle
            .write_control(request_type, request, 0, 0, data, timeout)?)
    }

    fn control_in(&self, request: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let request_type = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        Ok(self
            .handle
            .read_control(request_type, request, 0, 0, buf, timeout)?)
    }

    fn bulk_read(&self, buf: &mut [u8], timeout: Duration) -> Result<BulkRead> {
        let address = self
            .bulk_in_address
            .ok_or(DriverError::Transport(rusb::Error::NotFound))?;
        match self.handle.read_bulk(address, buf, timeout) {
            Ok(n) => Ok(BulkRead::Data(n)),
            Err(rusb::Error::Timeout) => Ok(BulkRead::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    fn bulk_packet_size(&self) -> usize {
        self.bulk_packet_size
    }
}
