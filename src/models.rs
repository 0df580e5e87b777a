//! Supported device models and their fixed identification constants.
//!
//! Every DAQFlex module shares one vendor id; the product id selects the
//! model and with it the ADC full-scale count and, for the 1608G family,
//! the FPGA image that must be uploaded on first connect.

use crate::errors::{DriverError, Result};

/// USB vendor id shared by all Measurement Computing DAQFlex modules.
pub const VENDOR_ID: u16 = 0x09DB;

/// A supported DAQFlex device model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceModel {
    Usb7202,
    Usb7204,
    Usb2001Tc,
    Usb1608FsPlus,
    Usb1608G,
    Usb1608Gx,
    Usb1608Gx2Ao,
    Usb201,
    Usb204,
}

/// All supported models, in product-id order of the original firmware family.
pub const ALL_MODELS: [DeviceModel; 9] = [
    DeviceModel::Usb7204,
    DeviceModel::Usb7202,
    DeviceModel::Usb2001Tc,
    DeviceModel::Usb1608FsPlus,
    DeviceModel::Usb1608G,
    DeviceModel::Usb1608Gx,
    DeviceModel::Usb1608Gx2Ao,
    DeviceModel::Usb201,
    DeviceModel::Usb204,
];

impl DeviceModel {
    /// USB product id of this model.
    pub fn product_id(self) -> u16 {
        match self {
            DeviceModel::Usb7202 => 0x00F2,
            DeviceModel::Usb7204 => 0x00F0,
            DeviceModel::Usb2001Tc => 0x00F9,
            DeviceModel::Usb1608FsPlus => 0x00EA,
            DeviceModel::Usb1608G => 0x0110,
            DeviceModel::Usb1608Gx => 0x0111,
            DeviceModel::Usb1608Gx2Ao => 0x0112,
            DeviceModel::Usb201 => 0x0113,
            DeviceModel::Usb204 => 0x0114,
        }
    }

    /// Full-scale ADC count, the divisor of the calibration formula.
    pub fn max_counts(self) -> u32 {
        match self {
            DeviceModel::Usb7202
            | DeviceModel::Usb1608FsPlus
            | DeviceModel::Usb1608G
            | DeviceModel::Usb1608Gx
            | DeviceModel::Usb1608Gx2Ao => 0xFFFF,
            DeviceModel::Usb7204 | DeviceModel::Usb201 | DeviceModel::Usb204 => 0x0FFF,
            DeviceModel::Usb2001Tc => 1,
        }
    }

    /// FPGA image file for models that boot in configuration mode.
    pub fn fpga_image(self) -> Option<&'static str> {
        match self {
            DeviceModel::Usb1608G | DeviceModel::Usb1608Gx | DeviceModel::Usb1608Gx2Ao => {
                Some("USB_1608G.rbf")
            }
            _ => None,
        }
    }

    /// Marketing name, also accepted by [`DeviceModel::from_name`].
    pub fn name(self) -> &'static str {
        match self {
            DeviceModel::Usb7202 => "USB-7202",
            DeviceModel::Usb7204 => "USB-7204",
            DeviceModel::Usb2001Tc => "USB-2001-TC",
            DeviceModel::Usb1608FsPlus => "USB-1608FS-Plus",
            DeviceModel::Usb1608G => "USB-1608G",
            DeviceModel::Usb1608Gx => "USB-1608GX",
            DeviceModel::Usb1608Gx2Ao => "USB-1608GX-2AO",
            DeviceModel::Usb201 => "USB-201",
            DeviceModel::Usb204 => "USB-204",
        }
    }

    /// Look up a model by its USB product id.
    pub fn from_product_id(product_id: u16) -> Option<Self> {
        ALL_MODELS.into_iter().find(|m| m.product_id() == product_id)
    }

    /// Parse a model name such as `"USB-204"` (underscores and case are
    /// tolerated, so the Python-style `"USB_1608FS_PLUS"` works too).
    pub fn from_name(name: &str) -> Result<Self> {
        let wanted = name.trim().replace('_', "-").to_ascii_uppercase();
        ALL_MODELS
            .into_iter()
            .find(|m| m.name().to_ascii_uppercase() == wanted)
            .ok_or_else(|| DriverError::UnknownModel(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_id_lookup_is_total_over_the_table() {
        for model in ALL_MODELS {
            assert_eq!(DeviceModel::from_product_id(model.product_id()), Some(model));
        }
        assert_eq!(DeviceModel::from_product_id(0xBEEF), None);
    }

    #[test]
    fn name_parse_accepts_python_spelling() {
        assert_eq!(
            DeviceModel::from_name("USB_1608FS_PLUS").unwrap(),
            DeviceModel::Usb1608FsPlus
        );
        assert_eq!(DeviceModel::from_name("usb-204").unwrap(), DeviceModel::Usb204);
        assert!(DeviceModel::from_name("USB-9999").is_err());
    }

    #[test]
    fn fpga_models_are_the_1608g_family() {
        let with_fpga: Vec<_> = ALL_MODELS
            .into_iter()
            .filter(|m| m.fpga_image().is_some())
            .collect();
        assert_eq!(
            with_fpga,
            vec![
                DeviceModel::Usb1608G,
                DeviceModel::Usb1608Gx,
                DeviceModel::Usb1608Gx2Ao
            ]
        );
    }
}
