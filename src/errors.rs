use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("device not found (vendor {vendor_id:#06x}, product {product_id:#06x})")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },
    #[error("usb transport error: {0}")]
    Transport(#[from] rusb::Error),
    #[error("could not send command: {0}")]
    ProtocolWrite(String),
    #[error("command too long: {len} bytes with terminator, limit {limit}")]
    CommandTooLong { len: usize, limit: usize },
    #[error("malformed response: {0:?}")]
    MalformedResponse(String),
    #[error("unknown device model: {0:?}")]
    UnknownModel(String),
    #[error("acquisition already in progress: {0}")]
    AcquisitionBusy(&'static str),
    #[error("invalid sample rate: {0}")]
    InvalidRate(f64),
    #[error("FPGA configuration failed: {0}")]
    FpgaConfig(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, DriverError>;
