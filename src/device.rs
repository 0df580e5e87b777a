//! DAQFlex device driver: command channel, scan readout and calibration.
//!
//! This module implements the host side of the DAQFlex protocol. Commands
//! are short ASCII strings carried by vendor control transfers; scan data
//! arrives as packed little-endian `u16` samples on a bulk-IN endpoint.
//!
//! # Readout modes
//!
//! - **Block**: [`MccDevice::read_scan_data`] busy-loops the bulk endpoint
//!   on the calling thread until the requested sample count has arrived or
//!   the device ends the stream with a zero-length packet.
//! - **Continuous**: [`MccDevice::start_continuous_transfer`] moves the
//!   same loop onto a background thread which feeds a bounded packet
//!   buffer; [`MccDevice::get_new_bulk_data`] drains it incrementally.
//!
//! Only one of the two may own the bulk endpoint at a time; the driver
//! enforces this and fails foreground reads with `AcquisitionBusy` while a
//! continuous transfer is running.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::buffer::{decode_samples, scan_read_timeout, DataEvent, Poller, ScanBuffer};
use crate::errors::{DriverError, Result};
use crate::models::{DeviceModel, VENDOR_ID};
use crate::usb::{BulkRead, RusbPort, UsbPort};

// ============================================================================
// Constants
// ============================================================================

/// Vendor request code carrying command strings and their responses.
const MESSAGE_REQUEST: u8 = 0x80;

/// Vendor request code for FPGA firmware chunks.
const FPGA_DATA_REQUEST: u8 = 0x51;

/// Control-transfer payload limit; commands including the NUL terminator
/// must fit, and responses always occupy this many bytes NUL-padded.
const MESSAGE_SIZE: usize = 64;

/// Timeout for one command/response control round trip.
const COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

/// Short per-read timeout while discarding stale bulk data.
const FLUSH_TIMEOUT: Duration = Duration::from_millis(20);

/// FPGA image chunk size on the control pipe.
const FPGA_CHUNK_SIZE: usize = 64;

/// Pause after the last firmware chunk before the device answers again.
const FPGA_SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Environment variable naming the directory with `.rbf` FPGA images.
pub const FIRMWARE_DIR_ENV: &str = "DAQFLEX_FIRMWARE_DIR";

// ============================================================================
// Data Types
// ============================================================================

/// Per-channel calibration parameters.
///
/// Slope and offset are only valid for the voltage range selected at query
/// time; re-query after changing the range. The driver does not cache or
/// invalidate these.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub slope: f64,
    pub offset: f64,
}

/// Apply calibration and range scaling to raw ADC counts.
///
/// Elementwise affine transform
/// `((raw * slope + offset) / max_counts) * (max - min) + min`; raw values
/// beyond `max_counts` are scaled like any other (overshoot is observable,
/// not an error), and empty input yields empty output.
pub fn scale_and_calibrate_data(
    data: &[u16],
    min_voltage: f64,
    max_voltage: f64,
    calibration: Calibration,
    max_counts: u32,
) -> Vec<f64> {
    let full_scale = max_voltage - min_voltage;
    data.iter()
        .map(|&raw| {
            let counts = f64::from(raw) * calibration.slope + calibration.offset;
            counts / f64::from(max_counts) * full_scale + min_voltage
        })
        .collect()
}

/// Buffer, notification flag and (while running) the poller of one
/// continuous transfer. Outlives the poller so late data can be drained
/// after `stop_continuous_transfer`.
struct ContinuousTransfer {
    buffer: Arc<ScanBuffer>,
    new_data: Arc<DataEvent>,
    poller: Option<Poller>,
}

// ============================================================================
// MccDevice Driver
// ============================================================================

/// Driver for one Measurement Computing DAQFlex module.
///
/// # Example (Rust)
/// ```ignore
/// let mut device = MccDevice::open(DeviceModel::Usb204, None)?;
/// device.send_message("AISCAN:LOWCHAN=0")?;
/// device.send_message("AISCAN:HIGHCHAN=0")?;
/// device.send_message("AISCAN:RATE=1000")?;
/// device.send_message("AISCAN:SAMPLES=2000")?;
/// device.send_message("AISCAN:START")?;
/// let raw = device.read_scan_data(2000, 1000.0)?;
/// let calibration = device.get_calib_data(0)?;
/// let volts = device.scale_and_calibrate(&raw, -10.0, 10.0, calibration);
/// ```
pub struct MccDevice {
    port: Arc<dyn UsbPort>,
    model: DeviceModel,
    continuous: Option<ContinuousTransfer>,
}

impl MccDevice {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Open the first attached device of `model`, optionally selected by
    /// serial number. Models of the 1608G family get their FPGA configured
    /// here if the hardware reports configuration mode.
    pub fn open(model: DeviceModel, serial_number: Option<&str>) -> Result<Self> {
        let port = RusbPort::open(VENDOR_ID, model.product_id(), serial_number)?;
        Self::from_port(Arc::new(port), model)
    }

    /// Build a driver over an already-opened transport port.
    ///
    /// This is the seam for alternate transports and for tests.
    pub fn from_port(port: Arc<dyn UsbPort>, model: DeviceModel) -> Result<Self> {
        let mut device = Self {
            port,
            model,
            continuous: None,
        };
        if let Some(image) = model.fpga_image() {
            device.configure_fpga(image)?;
        }
        Ok(device)
    }

    /// Serial numbers of all attached devices of `model`.
    pub fn find_serial_numbers(model: DeviceModel) -> Result<Vec<String>> {
        RusbPort::find_serial_numbers(VENDOR_ID, model.product_id())
    }

    /// The model this driver was opened for.
    pub fn model(&self) -> DeviceModel {
        self.model
    }

    /// Whether a continuous transfer is currently polling the endpoint.
    pub fn is_polling(&self) -> bool {
        self.continuous
            .as_ref()
            .is_some_and(|transfer| transfer.poller.is_some())
    }

    // ------------------------------------------------------------------------
    // Command Channel
    // ------------------------------------------------------------------------

    /// Send one DAQFlex command and return the device's response.
    ///
    /// The message is upper-cased (the protocol is case-insensitive but
    /// canonicalized outward) and NUL-terminated on the wire. The response
    /// is a fixed 64-byte ASCII buffer; trailing padding is stripped and
    /// everything before it, embedded `=` included, is returned verbatim.
    pub fn send_message(&mut self, message: &str) -> Result<String> {
        debug!("command: {message}");
        let mut wire = message.to_ascii_uppercase().into_bytes();
        wire.push(0);
        if wire.len() > MESSAGE_SIZE {
            return Err(DriverError::CommandTooLong {
                len: wire.len(),
                limit: MESSAGE_SIZE,
            });
        }

        match self.port.control_out(MESSAGE_REQUEST, &wire, COMMAND_TIMEOUT) {
            Ok(sent) if sent == wire.len() => {}
            Ok(sent) => {
                return Err(DriverError::ProtocolWrite(format!(
                    "short write: {sent} of {} bytes accepted",
                    wire.len()
                )))
            }
            Err(DriverError::Transport(e)) => {
                return Err(DriverError::ProtocolWrite(format!(
                    "send failed, possibly malformed command ({e})"
                )))
            }
            Err(e) => return Err(e),
        }

        let mut response = [0u8; MESSAGE_SIZE];
        let received = self
            .port
            .control_in(MESSAGE_REQUEST, &mut response, COMMAND_TIMEOUT)?;
        let end = response[..received]
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i + 1);
        let text = String::from_utf8_lossy(&response[..end]).into_owned();
        debug!("response: {text}");
        Ok(text)
    }

    // ------------------------------------------------------------------------
    // Block Readout
    // ------------------------------------------------------------------------

    /// Synchronously read scan data produced by a running AISCAN.
    ///
    /// Reads the bulk endpoint until either `length` samples have
    /// accumulated or the device signals end of stream with a zero-length
    /// packet. Read timeouts are treated as "no data yet" and retried; any
    /// other transport fault aborts the readout.
    ///
    /// Whole packets are kept, so the result may exceed `length`; it is
    /// never truncated. The scan itself must have been configured and
    /// started through [`send_message`](Self::send_message) beforehand.
    pub fn read_scan_data(&mut self, length: usize, rate: f64) -> Result<Vec<u16>> {
        self.ensure_bulk_idle("read_scan_data")?;
        check_rate(rate)?;
        let packet_bytes = self.port.bulk_packet_size();
        let timeout = scan_read_timeout(packet_bytes, rate);
        let mut raw = vec![0u8; packet_bytes];
        let mut samples: Vec<u16> = Vec::with_capacity(length);
        loop {
            match self.port.bulk_read(&mut raw, timeout)? {
                BulkRead::Timeout => continue,
                BulkRead::Data(0) => {
                    debug!("zero-length packet, scan stream ended");
                    break;
                }
                BulkRead::Data(n) => {
                    samples.extend(decode_samples(&raw[..n]));
                    if samples.len() >= length {
                        break;
                    }
                }
            }
        }
        debug!("block readout done: {}/{length} samples", samples.len());
        Ok(samples)
    }

    /// Read and discard whatever stale data the bulk endpoint still holds,
    /// e.g. the tail of an aborted scan. Best effort: transport faults end
    /// the flush rather than surface.
    pub fn flush_input_data(&mut self) -> Result<()> {
        self.ensure_bulk_idle("flush_input_data")?;
        let mut raw = vec![0u8; self.port.bulk_packet_size()];
        loop {
            match self.port.bulk_read(&mut raw, FLUSH_TIMEOUT) {
                Ok(BulkRead::Data(n)) if n > 0 => continue,
                Ok(_) => break,
                Err(e) => {
                    debug!("flush stopped on transport error: {e}");
                    break;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Continuous Readout
    // ------------------------------------------------------------------------

    /// Start polling AISCAN data on a background thread.
    ///
    /// `buf_size` bounds the packet buffer (oldest packets are dropped once
    /// it is full). `packet_size` is the bulk read size in bytes; when
    /// `None` it is derived from the rate as `(rate / 1000 + 1)`
    /// endpoint-native packets. A transfer already running on this device
    /// is stopped first — there is never more than one poller per device.
    ///
    /// The scan itself is armed separately via `AISCAN:START`; starting the
    /// transfer first and the scan second avoids losing the stream head.
    pub fn start_continuous_transfer(
        &mut self,
        rate: f64,
        buf_size: usize,
        packet_size: Option<usize>,
    ) -> Result<()> {
        check_rate(rate)?;
        self.stop_continuous_transfer()?;

        let packet_bytes = packet_size
            .unwrap_or_else(|| (rate as usize / 1000 + 1) * self.port.bulk_packet_size());
        let buffer = Arc::new(ScanBuffer::new(buf_size));
        let new_data = Arc::new(DataEvent::default());
        let poller = Poller::spawn(
            Arc::clone(&self.port),
            Arc::clone(&buffer),
            Arc::clone(&new_data),
            packet_bytes,
            rate,
        )?;
        debug!("continuous transfer started: {packet_bytes}B packets, {buf_size} packet buffer");
        self.continuous = Some(ContinuousTransfer {
            buffer,
            new_data,
            poller: Some(poller),
        });
        Ok(())
    }

    /// Stop the continuous transfer and wait for the polling thread to
    /// exit. After this returns no further packet is appended; data already
    /// buffered stays available to [`get_new_bulk_data`](Self::get_new_bulk_data).
    ///
    /// Surfaces the transport fault that terminated the poller, if any.
    pub fn stop_continuous_transfer(&mut self) -> Result<()> {
        if let Some(transfer) = self.continuous.as_mut() {
            if let Some(poller) = transfer.poller.take() {
                poller.stop()?;
                debug!("continuous transfer stopped");
            }
        }
        Ok(())
    }

    /// Drain all buffered continuous-transfer data as one flat sample
    /// sequence.
    ///
    /// With `wait` and a live poller this first blocks until the next
    /// "new data" notification — indefinitely, if the device never produces
    /// any (a scan that was never started, for instance). That unbounded
    /// wait is a deliberate non-feature of the protocol, not a defect.
    /// With `wait = false` an empty buffer yields an empty vec immediately.
    pub fn get_new_bulk_data(&mut self, wait: bool) -> Vec<u16> {
        let Some(transfer) = self.continuous.as_ref() else {
            return Vec::new();
        };
        if wait && transfer.poller.is_some() {
            transfer.new_data.wait();
        }
        let samples = transfer.buffer.drain();
        transfer.new_data.clear();
        samples
    }

    // ------------------------------------------------------------------------
    // Calibration
    // ------------------------------------------------------------------------

    /// Query slope and offset for an analog input channel.
    ///
    /// The values apply to the voltage range selected at call time only.
    pub fn get_calib_data(&mut self, channel: u8) -> Result<Calibration> {
        let slope = self.query_float(&format!("?AI{{{channel}}}:SLOPE"))?;
        let offset = self.query_float(&format!("?AI{{{channel}}}:OFFSET"))?;
        debug!("channel {channel} calibration: slope={slope} offset={offset}");
        Ok(Calibration { slope, offset })
    }

    /// [`scale_and_calibrate_data`] with this model's full-scale count.
    pub fn scale_and_calibrate(
        &self,
        data: &[u16],
        min_voltage: f64,
        max_voltage: f64,
        calibration: Calibration,
    ) -> Vec<f64> {
        scale_and_calibrate_data(
            data,
            min_voltage,
            max_voltage,
            calibration,
            self.model.max_counts(),
        )
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    /// Send a `?KEY` query and parse the `KEY=VALUE` response value as a
    /// float. Responses without exactly one `=` or with a non-numeric
    /// value are malformed.
    fn query_float(&mut self, command: &str) -> Result<f64> {
        let response = self.send_message(command)?;
        let parsed = {
            let mut parts = response.split('=');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(_key), Some(value), None) => value.trim().parse::<f64>().ok(),
                _ => None,
            }
        };
        parsed.ok_or(DriverError::MalformedResponse(response))
    }

    fn ensure_bulk_idle(&self, operation: &'static str) -> Result<()> {
        if self.is_polling() {
            return Err(DriverError::AcquisitionBusy(operation));
        }
        Ok(())
    }

    /// Bring up the FPGA on models that ship unconfigured.
    ///
    /// The device reports `CONFIGMODE` until an image has been streamed in
    /// 64-byte chunks via request 0x51, unlocked by `DEV:FPGACFG=0xAD`.
    /// The image is read from [`FIRMWARE_DIR_ENV`] (default `firmware/`).
    fn configure_fpga(&mut self, image_name: &str) -> Result<()> {
        let status = self.send_message("?DEV:FPGACFG")?;
        if status == "DEV:FPGACFG=CONFIGMODE" {
            let path = firmware_path(image_name);
            debug!("uploading FPGA image {}", path.display());
            let image = fs::read(&path)?;
            self.send_message("DEV:FPGACFG=0xAD")?;
            for chunk in image.chunks(FPGA_CHUNK_SIZE) {
                self.port
                    .control_out(FPGA_DATA_REQUEST, chunk, COMMAND_TIMEOUT)?;
            }
            // The device ignores commands for a short window after the
            // last chunk.
            thread::sleep(FPGA_SETTLE_DELAY);
        }
        let status = self.send_message("?DEV:FPGACFG")?;
        if status != "DEV:FPGACFG=CONFIGURED" {
            return Err(DriverError::FpgaConfig(status));
        }
        Ok(())
    }
}

impl Drop for MccDevice {
    /// An acquisition run never outlives its device: a still-running
    /// poller is stopped and joined here.
    fn drop(&mut self) {
        if let Err(e) = self.stop_continuous_transfer() {
            warn!("stopping continuous transfer on drop failed: {e}");
        }
    }
}

fn check_rate(rate: f64) -> Result<()> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(DriverError::InvalidRate(rate));
    }
    Ok(())
}

fn firmware_path(image_name: &str) -> PathBuf {
    env::var_os(FIRMWARE_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("firmware"))
        .join(image_name)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    enum BulkEvent {
        Packet(Vec<u8>),
        Timeout,
        Fatal,
    }

    /// Scripted transport: queued control responses and bulk events,
    /// recorded control writes. An exhausted bulk queue reads as timeouts,
    /// like a device that has stopped producing.
    struct ScriptedPort {
        sent: Mutex<Vec<Vec<u8>>>,
        responses: Mutex<VecDeque<Vec<u8>>>,
        bulk: Mutex<VecDeque<BulkEvent>>,
        bulk_reads: AtomicUsize,
        packet_size: usize,
        write_result: Option<fn(usize) -> Result<usize>>,
    }

    impl ScriptedPort {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                responses: Mutex::new(VecDeque::new()),
                bulk: Mutex::new(VecDeque::new()),
                bulk_reads: AtomicUsize::new(0),
                packet_size: 128,
                write_result: None,
            }
        }

        fn respond(&self, text: &str) {
            self.responses.lock().unwrap().push_back(text.as_bytes().to_vec());
        }

        fn queue(&self, event: BulkEvent) {
            self.bulk.lock().unwrap().push_back(event);
        }

        /// A packet of `n` ascending samples starting at `first`.
        fn queue_samples(&self, first: u16, n: u16) {
            let bytes: Vec<u8> = (first..first + n)
                .flat_map(|s| s.to_le_bytes())
                .collect();
            self.queue(BulkEvent::Packet(bytes));
        }

        fn sent_commands(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }

        /// Block until the poller has consumed every queued bulk event.
        fn wait_bulk_consumed(&self) {
            for _ in 0..500 {
                if self.bulk.lock().unwrap().is_empty() {
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            panic!("poller did not consume the scripted bulk events");
        }
    }

    impl UsbPort for ScriptedPort {
        fn control_out(&self, _request: u8, data: &[u8], _timeout: Duration) -> Result<usize> {
            self.sent.lock().unwrap().push(data.to_vec());
            match self.write_result {
                Some(f) => f(data.len()),
                None => Ok(data.len()),
            }
        }

        fn control_in(&self, _request: u8, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            let payload = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected control read");
            buf[..payload.len()].copy_from_slice(&payload);
            // The device always returns the full NUL-padded slot.
            Ok(buf.len())
        }

        fn bulk_read(&self, buf: &mut [u8], _timeout: Duration) -> Result<BulkRead> {
            self.bulk_reads.fetch_add(1, Ordering::SeqCst);
            match self.bulk.lock().unwrap().pop_front() {
                Some(BulkEvent::Packet(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(BulkRead::Data(bytes.len()))
                }
                Some(BulkEvent::Timeout) | None => {
                    // Keep idle polling from spinning too hot in tests.
                    thread::sleep(Duration::from_millis(1));
                    Ok(BulkRead::Timeout)
                }
                Some(BulkEvent::Fatal) => Err(DriverError::Transport(rusb::Error::Pipe)),
            }
        }

        fn bulk_packet_size(&self) -> usize {
            self.packet_size
        }
    }

    fn device_with(port: Arc<ScriptedPort>) -> MccDevice {
        MccDevice::from_port(port, DeviceModel::Usb204).expect("no FPGA on USB-204")
    }

    // ---- command channel ----

    #[test]
    fn commands_are_uppercased_and_nul_terminated() {
        let port = Arc::new(ScriptedPort::new());
        port.respond("AISCAN:START");
        let mut device = device_with(Arc::clone(&port));
        device.send_message("aiscan:start").unwrap();
        assert_eq!(port.sent_commands(), vec![b"AISCAN:START\0".to_vec()]);
    }

    #[test]
    fn response_padding_is_trimmed_verbatim() {
        let port = Arc::new(ScriptedPort::new());
        port.respond("AI=0.125");
        let mut device = device_with(port);
        // The scripted port pads to the full 64-byte slot with NULs.
        assert_eq!(device.send_message("?AI").unwrap(), "AI=0.125");
    }

    #[test]
    fn overlong_command_is_rejected_before_the_wire() {
        let port = Arc::new(ScriptedPort::new());
        let mut device = device_with(Arc::clone(&port));
        let long = "X".repeat(MESSAGE_SIZE);
        match device.send_message(&long) {
            Err(DriverError::CommandTooLong { len, limit }) => {
                assert_eq!((len, limit), (MESSAGE_SIZE + 1, MESSAGE_SIZE));
            }
            other => panic!("expected CommandTooLong, got {other:?}"),
        }
        assert!(port.sent_commands().is_empty());
    }

    #[test]
    fn short_write_is_a_protocol_error() {
        let mut port = ScriptedPort::new();
        port.write_result = Some(|len| Ok(len - 1));
        let mut device = device_with(Arc::new(port));
        assert!(matches!(
            device.send_message("AISCAN:START"),
            Err(DriverError::ProtocolWrite(_))
        ));
    }

    #[test]
    fn write_fault_hints_at_malformed_command() {
        let mut port = ScriptedPort::new();
        port.write_result = Some(|_| Err(DriverError::Transport(rusb::Error::Io)));
        let mut device = device_with(Arc::new(port));
        match device.send_message("BOGUS:CMD") {
            Err(DriverError::ProtocolWrite(reason)) => {
                assert!(reason.contains("malformed"), "reason: {reason}");
            }
            other => panic!("expected ProtocolWrite, got {other:?}"),
        }
    }

    // ---- block readout ----

    #[test]
    fn block_reader_keeps_whole_packets_without_truncation() {
        let port = Arc::new(ScriptedPort::new());
        port.queue_samples(0, 64);
        port.queue_samples(64, 64);
        port.queue(BulkEvent::Packet(Vec::new()));
        let mut device = device_with(port);
        let samples = device.read_scan_data(100, 1000.0).unwrap();
        // 100 requested, but the second 64-sample packet is kept whole.
        assert_eq!(samples.len(), 128);
        assert_eq!(samples[..4], [0, 1, 2, 3]);
        assert_eq!(samples[127], 127);
    }

    #[test]
    fn block_reader_treats_timeouts_as_noise() {
        let port = Arc::new(ScriptedPort::new());
        port.queue(BulkEvent::Timeout);
        port.queue_samples(0, 32);
        port.queue(BulkEvent::Timeout);
        port.queue(BulkEvent::Packet(Vec::new()));
        let mut device = device_with(port);
        assert_eq!(device.read_scan_data(100, 1000.0).unwrap().len(), 32);
    }

    #[test]
    fn block_reader_propagates_fatal_transport_errors() {
        let port = Arc::new(ScriptedPort::new());
        port.queue_samples(0, 8);
        port.queue(BulkEvent::Fatal);
        let mut device = device_with(port);
        assert!(matches!(
            device.read_scan_data(100, 1000.0),
            Err(DriverError::Transport(rusb::Error::Pipe))
        ));
    }

    #[test]
    fn zero_rate_is_rejected() {
        let mut device = device_with(Arc::new(ScriptedPort::new()));
        assert!(matches!(
            device.read_scan_data(10, 0.0),
            Err(DriverError::InvalidRate(_))
        ));
    }

    // ---- continuous readout ----

    #[test]
    fn continuous_transfer_delivers_buffered_samples() {
        let port = Arc::new(ScriptedPort::new());
        port.queue_samples(0, 16);
        let mut device = device_with(port);
        device.start_continuous_transfer(1000.0, 100, Some(32)).unwrap();
        // wait = true blocks until the poller has appended the packet.
        let samples = device.get_new_bulk_data(true);
        assert_eq!(samples, (0u16..16).collect::<Vec<_>>());
        device.stop_continuous_transfer().unwrap();
    }

    #[test]
    fn bounded_buffer_keeps_only_the_newest_packets() {
        let port = Arc::new(ScriptedPort::new());
        for i in 0..5 {
            port.queue_samples(i * 10, 4);
        }
        port.queue(BulkEvent::Packet(Vec::new()));
        let mut device = device_with(Arc::clone(&port));
        device.start_continuous_transfer(1000.0, 3, Some(8)).unwrap();
        // The zero-length packet ends the loop; stop() joins it.
        port.wait_bulk_consumed();
        device.stop_continuous_transfer().unwrap();
        let samples = device.get_new_bulk_data(false);
        assert_eq!(
            samples,
            vec![20, 21, 22, 23, 30, 31, 32, 33, 40, 41, 42, 43]
        );
    }

    #[test]
    fn stop_joins_the_poller_and_freezes_the_buffer() {
        let port = Arc::new(ScriptedPort::new());
        let mut device = device_with(Arc::clone(&port));
        device.start_continuous_transfer(1000.0, 10, Some(8)).unwrap();
        thread::sleep(Duration::from_millis(10));
        device.stop_continuous_transfer().unwrap();
        assert!(!device.is_polling());
        let reads_after_stop = port.bulk_reads.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        // The loop has fully exited: no read is issued after stop returns.
        assert_eq!(port.bulk_reads.load(Ordering::SeqCst), reads_after_stop);
    }

    #[test]
    fn poller_fatal_error_surfaces_on_stop() {
        let port = Arc::new(ScriptedPort::new());
        port.queue(BulkEvent::Fatal);
        let mut device = device_with(Arc::clone(&port));
        device.start_continuous_transfer(1000.0, 10, Some(8)).unwrap();
        port.wait_bulk_consumed();
        assert!(matches!(
            device.stop_continuous_transfer(),
            Err(DriverError::Transport(rusb::Error::Pipe))
        ));
    }

    #[test]
    fn drain_without_wait_never_blocks_on_empty_buffer() {
        let port = Arc::new(ScriptedPort::new());
        let mut device = device_with(port);
        assert!(device.get_new_bulk_data(false).is_empty());
        device.start_continuous_transfer(1000.0, 10, Some(8)).unwrap();
        assert!(device.get_new_bulk_data(false).is_empty());
        device.stop_continuous_transfer().unwrap();
    }

    #[test]
    fn block_reads_are_rejected_while_polling() {
        let port = Arc::new(ScriptedPort::new());
        let mut device = device_with(port);
        device.start_continuous_transfer(1000.0, 10, Some(8)).unwrap();
        assert!(matches!(
            device.read_scan_data(10, 1000.0),
            Err(DriverError::AcquisitionBusy("read_scan_data"))
        ));
        assert!(matches!(
            device.flush_input_data(),
            Err(DriverError::AcquisitionBusy("flush_input_data"))
        ));
        device.stop_continuous_transfer().unwrap();
    }

    #[test]
    fn restart_replaces_the_previous_transfer() {
        let port = Arc::new(ScriptedPort::new());
        port.queue_samples(0, 4);
        let mut device = device_with(Arc::clone(&port));
        device.start_continuous_transfer(1000.0, 10, Some(8)).unwrap();
        device.get_new_bulk_data(true);
        // Restarting stops the first poller and hands out a fresh buffer.
        device.start_continuous_transfer(1000.0, 10, Some(8)).unwrap();
        assert!(device.is_polling());
        assert!(device.get_new_bulk_data(false).is_empty());
        device.stop_continuous_transfer().unwrap();
    }

    // ---- calibration ----

    #[test]
    fn calibration_query_parses_slope_and_offset() {
        let port = Arc::new(ScriptedPort::new());
        port.respond("AI{0}:SLOPE=1.0125");
        port.respond("AI{0}:OFFSET=-0.5");
        let mut device = device_with(Arc::clone(&port));
        let calibration = device.get_calib_data(0).unwrap();
        assert_eq!(
            calibration,
            Calibration {
                slope: 1.0125,
                offset: -0.5
            }
        );
        assert_eq!(
            port.sent_commands(),
            vec![b"?AI{0}:SLOPE\0".to_vec(), b"?AI{0}:OFFSET\0".to_vec()]
        );
    }

    #[test]
    fn calibration_query_rejects_malformed_responses() {
        for bad in ["AI{0}:SLOPE", "AI{0}:SLOPE=1.0=2.0", "AI{0}:SLOPE=volts"] {
            let port = Arc::new(ScriptedPort::new());
            port.respond(bad);
            let mut device = device_with(port);
            assert!(
                matches!(
                    device.get_calib_data(0),
                    Err(DriverError::MalformedResponse(_))
                ),
                "accepted {bad:?}"
            );
        }
    }

    // ---- scaling ----

    #[test]
    fn scaling_maps_full_scale_endpoints_exactly() {
        let identity = Calibration {
            slope: 1.0,
            offset: 0.0,
        };
        let volts = scale_and_calibrate_data(&[0, 2048, 4095], -10.0, 10.0, identity, 0x0FFF);
        assert_eq!(volts[0], -10.0);
        assert_eq!(volts[2], 10.0);
        assert!((volts[1] - 10.0 * (2.0 * 2048.0 - 4095.0) / 4095.0).abs() < 1e-12);
    }

    #[test]
    fn scaling_differences_follow_the_affine_slope() {
        let calibration = Calibration {
            slope: 1.002,
            offset: -1.5,
        };
        let volts = scale_and_calibrate_data(&[100, 4100], 0.0, 5.0, calibration, 0xFFFF);
        let expected = (4100.0 - 100.0) * calibration.slope / 65535.0 * 5.0;
        assert!((volts[1] - volts[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn scaling_does_not_clamp_overshoot() {
        let identity = Calibration {
            slope: 1.0,
            offset: 0.0,
        };
        // Raw beyond the 12-bit full scale maps beyond max_voltage.
        let volts = scale_and_calibrate_data(&[0xFFFF], -10.0, 10.0, identity, 0x0FFF);
        assert!(volts[0] > 10.0);
        assert!(scale_and_calibrate_data(&[], -10.0, 10.0, identity, 0x0FFF).is_empty());
    }

    #[test]
    fn device_scaling_uses_the_model_full_scale() {
        let port = Arc::new(ScriptedPort::new());
        let device = device_with(port);
        let identity = Calibration {
            slope: 1.0,
            offset: 0.0,
        };
        // USB-204 is a 12-bit module.
        let volts = device.scale_and_calibrate(&[0x0FFF], -10.0, 10.0, identity);
        assert_eq!(volts[0], 10.0);
    }

    // ---- FPGA bring-up ----

    #[test]
    fn configured_fpga_is_accepted_without_upload() {
        let port = Arc::new(ScriptedPort::new());
        port.respond("DEV:FPGACFG=CONFIGURED");
        port.respond("DEV:FPGACFG=CONFIGURED");
        let device =
            MccDevice::from_port(Arc::clone(&port) as Arc<dyn UsbPort>, DeviceModel::Usb1608G);
        assert!(device.is_ok());
        assert_eq!(
            port.sent_commands(),
            vec![b"?DEV:FPGACFG\0".to_vec(), b"?DEV:FPGACFG\0".to_vec()]
        );
    }

    #[test]
    fn unconfigured_fpga_after_bringup_is_an_error() {
        let port = Arc::new(ScriptedPort::new());
        port.respond("DEV:FPGACFG=UNKNOWN");
        port.respond("DEV:FPGACFG=UNKNOWN");
        match MccDevice::from_port(port, DeviceModel::Usb1608G) {
            Err(DriverError::FpgaConfig(status)) => {
                assert_eq!(status, "DEV:FPGACFG=UNKNOWN");
            }
            other => panic!("expected FpgaConfig, got {:?}", other.err()),
        }
    }

    #[test]
    fn models_without_fpga_send_no_bringup_traffic() {
        let port = Arc::new(ScriptedPort::new());
        let _device = device_with(Arc::clone(&port));
        assert!(port.sent_commands().is_empty());
    }
}
