//! DAQFlex Rust driver with Python bindings.
//!
//! This crate drives Measurement Computing USB data-acquisition modules
//! that speak the DAQFlex ASCII command protocol: commands and responses
//! travel over vendor control transfers, raw analog-scan samples stream in
//! over a bulk endpoint.
//!
//! # Acquisition model
//!
//! A scan is configured and armed entirely through command strings
//! (`AISCAN:RATE=...`, `AISCAN:START`, ...). Sample readout is separate:
//!
//! 1. Block mode — `read_scan_data` collects a fixed number of samples on
//!    the calling thread.
//! 2. Continuous mode — `start_continuous_transfer` polls the endpoint on
//!    a background thread into a bounded packet buffer which
//!    `get_new_bulk_data` drains incrementally.
//!
//! Raw counts become voltages by applying the per-channel calibration
//! (`get_calib_data`) and the selected voltage range; calibration values
//! are only valid for the range active when they were queried.

use pyo3::prelude::*;

mod buffer;
mod device;
mod errors;
mod logging;
mod models;
mod usb;

pub use buffer::{DataEvent, ScanBuffer};
pub use device::{scale_and_calibrate_data, Calibration, MccDevice, FIRMWARE_DIR_ENV};
pub use errors::{DriverError, Result};
pub use models::{DeviceModel, ALL_MODELS, VENDOR_ID};
pub use usb::{BulkRead, RusbPort, UsbPort};

// ============================================================================
// Python Bindings
// ============================================================================

fn py_err(e: DriverError) -> PyErr {
    use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};
    match e {
        DriverError::UnknownModel(_)
        | DriverError::InvalidRate(_)
        | DriverError::CommandTooLong { .. } => PyErr::new::<PyValueError, _>(e.to_string()),
        DriverError::AcquisitionBusy(_) => PyErr::new::<PyRuntimeError, _>(e.to_string()),
        _ => PyErr::new::<PyIOError, _>(e.to_string()),
    }
}

/// A DAQFlex data-acquisition module.
///
/// Example:
///     >>> dev = MCCDevice("USB-204")
///     >>> dev.send_message("AISCAN:LOWCHAN=0")
///     >>> dev.send_message("AISCAN:HIGHCHAN=0")
///     >>> dev.send_message("AISCAN:RATE=1000")
///     >>> dev.send_message("AISCAN:SAMPLES=2000")
///     >>> dev.send_message("AISCAN:START")
///     >>> raw = dev.read_scan_data(2000, 1000)
///     >>> volts = dev.scale_and_calibrate_data(raw, -10, 10, dev.get_calib_data(0))
#[pyclass(name = "MCCDevice", unsendable)]
struct PyMccDevice {
    inner: MccDevice,
}

#[pymethods]
impl PyMccDevice {
    /// Connect to the first attached device of the given model, or the one
    /// with a specific serial number.
    ///
    /// Args:
    ///     model: Model name, e.g. "USB-204" (underscores accepted).
    ///     serial_number: Optional serial number to select one of several
    ///         attached devices.
    ///
    /// Raises:
    ///     ValueError: Unknown model name.
    ///     IOError: No matching device, or FPGA bring-up failed.
    #[new]
    #[pyo3(signature = (model, serial_number=None))]
    fn new(model: &str, serial_number: Option<&str>) -> PyResult<Self> {
        let model = DeviceModel::from_name(model).map_err(py_err)?;
        MccDevice::open(model, serial_number)
            .map(|inner| PyMccDevice { inner })
            .map_err(py_err)
    }

    /// Serial numbers of all attached devices of the given model.
    #[staticmethod]
    fn find_serial_numbers(model: &str) -> PyResult<Vec<String>> {
        let model = DeviceModel::from_name(model).map_err(py_err)?;
        MccDevice::find_serial_numbers(model).map_err(py_err)
    }

    /// Model name this device was opened as.
    #[getter]
    fn model(&self) -> &'static str {
        self.inner.model().name()
    }

    /// Full-scale ADC count of this model.
    #[getter]
    fn max_counts(&self) -> u32 {
        self.inner.model().max_counts()
    }

    /// Whether a continuous transfer is currently running.
    #[getter]
    fn is_polling(&self) -> bool {
        self.inner.is_polling()
    }

    /// Send a DAQFlex command and return the device response.
    ///
    /// The command is upper-cased before transmission; the response has
    /// its NUL padding stripped (e.g. "AI{0}:SLOPE=1.012").
    fn send_message(&mut self, py: Python<'_>, message: &str) -> PyResult<String> {
        let inner = &mut self.inner;
        py.detach(|| inner.send_message(message)).map_err(py_err)
    }

    /// Synchronously read scan data produced by a running AISCAN.
    ///
    /// Blocks until `length` samples have accumulated or the device ends
    /// the stream; whole packets are kept, so more than `length` samples
    /// may be returned.
    fn read_scan_data(&mut self, py: Python<'_>, length: usize, rate: f64) -> PyResult<Vec<u16>> {
        let inner = &mut self.inner;
        py.detach(|| inner.read_scan_data(length, rate)).map_err(py_err)
    }

    /// Read and discard stale data pending on the bulk endpoint.
    fn flush_input_data(&mut self, py: Python<'_>) -> PyResult<()> {
        let inner = &mut self.inner;
        py.detach(|| inner.flush_input_data()).map_err(py_err)
    }

    /// Start buffering AISCAN data on a background thread.
    ///
    /// Args:
    ///     rate: Scan rate in Hz (used to derive the poll timeout).
    ///     buf_size: Buffer bound in packets; oldest packets are dropped
    ///         once it is full.
    ///     packet_size: Bulk read size in bytes (default: derived from
    ///         the rate).
    #[pyo3(signature = (rate, buf_size, packet_size=None))]
    fn start_continuous_transfer(
        &mut self,
        py: Python<'_>,
        rate: f64,
        buf_size: usize,
        packet_size: Option<usize>,
    ) -> PyResult<()> {
        let inner = &mut self.inner;
        py.detach(|| inner.start_continuous_transfer(rate, buf_size, packet_size))
            .map_err(py_err)
    }

    /// Stop the continuous transfer and wait for the poller to exit.
    fn stop_continuous_transfer(&mut self, py: Python<'_>) -> PyResult<()> {
        let inner = &mut self.inner;
        py.detach(|| inner.stop_continuous_transfer()).map_err(py_err)
    }

    /// Return all buffered continuous-transfer samples.
    ///
    /// Args:
    ///     wait: If True, block until the poller signals new data first.
    ///         Waits indefinitely if the scan never produces any.
    #[pyo3(signature = (wait=false))]
    fn get_new_bulk_data(&mut self, py: Python<'_>, wait: bool) -> Vec<u16> {
        let inner = &mut self.inner;
        // Release the GIL: the poller may log through Python while we wait.
        py.detach(|| inner.get_new_bulk_data(wait))
    }

    /// Query calibration slope and offset for an analog input channel.
    ///
    /// The values are only valid for the currently selected voltage range;
    /// query again after changing it.
    fn get_calib_data(&mut self, py: Python<'_>, channel: u8) -> PyResult<(f64, f64)> {
        let inner = &mut self.inner;
        py.detach(|| inner.get_calib_data(channel))
            .map(|c| (c.slope, c.offset))
            .map_err(py_err)
    }

    /// Convert raw counts to calibrated voltages.
    ///
    /// Args:
    ///     data: Raw samples as returned by the readout methods.
    ///     min_voltage: Lower bound of the selected voltage range.
    ///     max_voltage: Upper bound of the selected voltage range.
    ///     calib: (slope, offset) tuple from get_calib_data.
    fn scale_and_calibrate_data(
        &self,
        data: Vec<u16>,
        min_voltage: f64,
        max_voltage: f64,
        calib: (f64, f64),
    ) -> Vec<f64> {
        self.inner.scale_and_calibrate(
            &data,
            min_voltage,
            max_voltage,
            Calibration {
                slope: calib.0,
                offset: calib.1,
            },
        )
    }

    fn __repr__(&self) -> String {
        format!(
            "MCCDevice(model={}, polling={})",
            self.inner.model().name(),
            self.inner.is_polling()
        )
    }
}

/// Set the minimum level of driver log forwarding ("off", "error", "warn",
/// "info", "debug", "trace"). Without an argument the level comes from
/// DAQFLEX_LOG / RUST_LOG.
#[pyfunction]
#[pyo3(signature = (level=None))]
fn set_log_level(level: Option<&str>) {
    logging::set_python_log_level(level);
}

/// The Python module definition
#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    logging::init_python_logging(m.py())?;

    m.add_class::<PyMccDevice>()?;
    m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

    // Add module-level constants
    m.add("VENDOR_ID", VENDOR_ID)?;
    m.add("RESPONSE_SIZE", 64u16)?;
    m.add(
        "SUPPORTED_MODELS",
        ALL_MODELS.iter().map(|model| model.name()).collect::<Vec<_>>(),
    )?;

    Ok(())
}
