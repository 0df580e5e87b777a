//! Packet buffering and the background poller for continuous transfers.
//!
//! The poller decouples device-side sample production from host-side
//! consumption: a dedicated thread repeats the bulk-read loop and appends
//! whole packets to a bounded [`ScanBuffer`], which the caller drains at
//! its own pace through [`crate::device::MccDevice::get_new_bulk_data`].
//! Producer/consumer rate mismatch is absorbed by evicting the oldest
//! unread packet once the bound is hit.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::errors::{DriverError, Result};
use crate::usb::{BulkRead, UsbPort};

/// Extra slack added to every scan-read timeout.
const READ_TIMEOUT_MARGIN_MS: u64 = 10;

/// Per-read timeout for scan data arriving at `rate` samples per second:
/// roughly half the time the device needs to fill `packet_bytes`, plus a
/// fixed margin so the reader never blocks much longer than new data can
/// physically take to arrive.
pub(crate) fn scan_read_timeout(packet_bytes: usize, rate: f64) -> Duration {
    let half_packet_ms = packet_bytes as f64 * 1e3 / 2.0 / rate;
    Duration::from_millis(half_packet_ms as u64 + READ_TIMEOUT_MARGIN_MS)
}

/// Decode a raw bulk packet into samples (little-endian `u16`, packed
/// back-to-back). A trailing odd byte cannot be a sample and is dropped.
pub(crate) fn decode_samples(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// A set/clear/wait notification flag (mutex + condvar).
///
/// Same contract as Python's `threading.Event`: `wait` blocks until the
/// flag is set, `set` wakes all waiters and leaves the flag up until
/// `clear`.
#[derive(Default)]
pub struct DataEvent {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl DataEvent {
    pub fn set(&self) {
        let mut flag = self.flag.lock().unwrap_or_else(|e| e.into_inner());
        *flag = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        *self.flag.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }

    /// Block until the flag is set. No timeout: if the producer never
    /// signals, this waits forever (see `get_new_bulk_data`).
    pub fn wait(&self) {
        let mut flag = self.flag.lock().unwrap_or_else(|e| e.into_inner());
        while !*flag {
            flag = self.cond.wait(flag).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Bounded FIFO of raw sample packets.
///
/// Packets are stored whole, in bulk-endpoint read order. Once `capacity`
/// packets are buffered, pushing another silently drops the oldest unread
/// one — bounded memory wins over lossless capture here.
pub struct ScanBuffer {
    packets: Mutex<VecDeque<Vec<u16>>>,
    capacity: usize,
}

impl ScanBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            packets: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append one packet, evicting from the front to stay within bounds.
    pub fn push(&self, packet: Vec<u16>) {
        if self.capacity == 0 {
            return;
        }
        let mut packets = self.packets.lock().unwrap_or_else(|e| e.into_inner());
        while packets.len() >= self.capacity {
            debug!("scan buffer full, dropping oldest packet");
            packets.pop_front();
        }
        packets.push_back(packet);
    }

    /// Atomically remove all buffered packets and flatten them into one
    /// contiguous sample sequence.
    pub fn drain(&self) -> Vec<u16> {
        let mut packets = self.packets.lock().unwrap_or_else(|e| e.into_inner());
        let total = packets.iter().map(Vec::len).sum();
        let mut samples = Vec::with_capacity(total);
        while let Some(packet) = packets.pop_front() {
            samples.extend(packet);
        }
        samples
    }

    pub fn packet_count(&self) -> usize {
        self.packets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Handle to the background polling thread of one continuous transfer.
pub(crate) struct Poller {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<Result<()>>,
}

impl Poller {
    /// Launch the polling loop on its own thread.
    pub(crate) fn spawn(
        port: Arc<dyn UsbPort>,
        buffer: Arc<ScanBuffer>,
        new_data: Arc<DataEvent>,
        packet_bytes: usize,
        rate: f64,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("daqflex-poll".into())
            .spawn(move || poll_loop(&*port, &buffer, &new_data, &flag, packet_bytes, rate))?;
        Ok(Self { shutdown, handle })
    }

    /// Signal the loop to exit and block until it has. Returns the loop's
    /// terminal result; after this returns, no further packet is appended.
    pub(crate) fn stop(self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(DriverError::Io(io::Error::other("polling thread panicked"))),
        }
    }
}

fn poll_loop(
    port: &dyn UsbPort,
    buffer: &ScanBuffer,
    new_data: &DataEvent,
    shutdown: &AtomicBool,
    packet_bytes: usize,
    rate: f64,
) -> Result<()> {
    let timeout = scan_read_timeout(packet_bytes, rate);
    let mut raw = vec![0u8; packet_bytes];
    debug!("polling started: packet={packet_bytes}B rate={rate}Hz timeout={timeout:?}");
    while !shutdown.load(Ordering::Acquire) {
        let read = match port.bulk_read(&mut raw, timeout) {
            Ok(read) => read,
            Err(e) => {
                warn!("polling aborted by transport fault: {e}");
                return Err(e);
            }
        };
        match read {
            // Nothing yet, poll again; shutdown is re-checked in between.
            BulkRead::Timeout => continue,
            BulkRead::Data(0) => {
                debug!("zero-length packet, scan stream ended");
                break;
            }
            BulkRead::Data(n) => {
                buffer.push(decode_samples(&raw[..n]));
                new_data.set();
            }
        }
    }
    if shutdown.load(Ordering::Acquire) {
        debug!("polling stopped on request");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_packet_is_evicted_at_capacity() {
        let buffer = ScanBuffer::new(3);
        for i in 0..5u16 {
            buffer.push(vec![i; 4]);
        }
        assert_eq!(buffer.packet_count(), 3);
        // Packets 0 and 1 were dropped, 2..5 survive in order.
        let samples = buffer.drain();
        assert_eq!(samples, [vec![2u16; 4], vec![3; 4], vec![4; 4]].concat());
    }

    #[test]
    fn drain_empties_the_buffer() {
        let buffer = ScanBuffer::new(8);
        buffer.push(vec![1, 2, 3]);
        assert_eq!(buffer.drain(), vec![1, 2, 3]);
        assert_eq!(buffer.packet_count(), 0);
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn zero_capacity_buffer_discards_everything() {
        let buffer = ScanBuffer::new(0);
        buffer.push(vec![7; 16]);
        assert_eq!(buffer.packet_count(), 0);
    }

    #[test]
    fn event_wait_returns_once_set() {
        let event = Arc::new(DataEvent::default());
        let setter = Arc::clone(&event);
        let waiter = thread::spawn(move || event.wait());
        thread::sleep(Duration::from_millis(20));
        setter.set();
        waiter.join().expect("waiter exits after set");
        // A set flag lets subsequent waits pass until cleared.
        setter.wait();
        setter.clear();
    }

    #[test]
    fn samples_decode_little_endian() {
        assert_eq!(decode_samples(&[0x34, 0x12, 0xFF, 0xFF, 0x01]), vec![0x1234, 0xFFFF]);
        assert!(decode_samples(&[]).is_empty());
    }

    #[test]
    fn read_timeout_is_half_packet_period_plus_margin() {
        // 64-byte packets at 1 kHz: 32 ms half-period + 10 ms margin.
        assert_eq!(scan_read_timeout(64, 1000.0), Duration::from_millis(42));
        assert_eq!(scan_read_timeout(64, 100_000.0), Duration::from_millis(10));
    }
}
