//! Firmware update engine: stream an image of known length into the
//! inactive slot, validate it, then move the boot pointer.
//!
//! The slot handle is held by a [`Transaction`] guard, so every error path
//! ends the transaction exactly once and nothing partial becomes bootable.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256};

use crate::config::UpdatePolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub label: String,
    /// Only application partitions may be written.
    pub is_app: bool,
    pub capacity: u64,
}

/// Raw status code from the flash/OTA driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverError(pub i32);

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "driver error {}", self.0)
    }
}

pub trait FirmwareSlots: Send + Sync {
    type Writer: SlotWriter;

    /// The slot that is not currently running, if the partition table has one.
    fn next_inactive(&self) -> Result<Option<SlotInfo>, DriverError>;

    /// Opens a write transaction of unknown final size.
    fn begin(&self, slot: &SlotInfo) -> Result<Self::Writer, DriverError>;

    fn set_boot(&self, slot: &SlotInfo) -> Result<(), DriverError>;
}

pub trait SlotWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), DriverError>;

    /// Ends the transaction and runs image validation.
    fn finish(self) -> Result<(), DriverError>;

    /// Ends the transaction, discarding what was written.
    fn abort(self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// The socket timed out without data; the caller may retry.
    Timeout,
    /// Any other receive failure.
    Failed(i32),
}

/// The request body.
pub trait ByteSource {
    /// `Ok(0)` means the peer closed the stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateError {
    NoSlot,
    ImageTooLarge,
    BeginFailed,
    StreamTimeout,
    StreamError,
    LengthMismatch,
    ValidationFailed,
    FlashWriteFailed,
    BootSetFailed,
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            UpdateError::NoSlot => "No OTA partition found",
            UpdateError::ImageTooLarge => "Image larger than update partition",
            UpdateError::BeginFailed => "OTA begin failed",
            UpdateError::StreamTimeout => "OTA socket timeout limit reached",
            UpdateError::StreamError => "OTA receive failed",
            UpdateError::LengthMismatch => "OTA stream length mismatch",
            UpdateError::ValidationFailed => "OTA validation failed",
            UpdateError::FlashWriteFailed => "Flash write failed",
            UpdateError::BootSetFailed => "Set boot partition failed",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for UpdateError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub slot: String,
    pub bytes_written: u64,
    pub sha256: [u8; 32],
}

impl UpdateReport {
    pub fn sha256_hex(&self) -> String {
        to_hex(&self.sha256)
    }
}

/// Parses a 64 character hex digest, any case.
pub fn parse_digest(hex: &str) -> Option<[u8; 32]> {
    let hex = hex.trim();
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let mut digest = [0u8; 32];
    for (i, byte) in digest.iter_mut().enumerate() {
        *byte = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
    }
    Some(digest)
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

pub struct UpdateEngine<S> {
    slots: S,
    policy: UpdatePolicy,
    busy: AtomicBool,
}

impl<S: FirmwareSlots> UpdateEngine<S> {
    pub fn new(slots: S, policy: UpdatePolicy) -> Self {
        Self {
            slots,
            policy,
            busy: AtomicBool::new(false),
        }
    }

    pub fn slots(&self) -> &S {
        &self.slots
    }

    /// Streams `total_length` bytes from `source` into the inactive slot.
    /// When `expected_sha256` is given the image must hash to it. On success
    /// the next boot loads the new slot; the caller schedules the restart.
    pub fn apply_update(
        &self,
        source: &mut dyn ByteSource,
        total_length: u64,
        expected_sha256: Option<[u8; 32]>,
    ) -> Result<UpdateReport, UpdateError> {
        if total_length == 0 {
            log::error!("Refusing empty firmware image");
            return Err(UpdateError::LengthMismatch);
        }
        let Some(_busy) = BusyGuard::acquire(&self.busy) else {
            log::error!("Another update is already running");
            return Err(UpdateError::BeginFailed);
        };

        let slot = self.target_slot()?;
        if total_length > slot.capacity {
            log::error!(
                "Image of {} bytes does not fit partition '{}' ({} bytes)",
                total_length,
                slot.label,
                slot.capacity
            );
            return Err(UpdateError::ImageTooLarge);
        }

        let writer = self.slots.begin(&slot).map_err(|e| {
            log::error!("OTA begin on '{}' failed: {e}", slot.label);
            UpdateError::BeginFailed
        })?;
        let mut txn = Transaction::new(writer);
        log::info!("OTA update started into '{}', size: {} bytes", slot.label, total_length);

        let hasher = self.stream(source, &mut txn, total_length)?;
        let sha256: [u8; 32] = hasher.finalize().into();

        if let Some(expected) = expected_sha256 {
            if expected != sha256 {
                log::error!(
                    "Image digest mismatch (expected {}, got {})",
                    to_hex(&expected),
                    to_hex(&sha256)
                );
                return Err(UpdateError::ValidationFailed);
            }
        }

        txn.finish().map_err(|e| {
            log::error!("OTA validation failed: {e}");
            UpdateError::ValidationFailed
        })?;
        self.slots.set_boot(&slot).map_err(|e| {
            log::error!("Set boot partition failed: {e}");
            UpdateError::BootSetFailed
        })?;

        log::info!("OTA update complete: '{}' sha256={}", slot.label, to_hex(&sha256));
        Ok(UpdateReport {
            slot: slot.label,
            bytes_written: total_length,
            sha256,
        })
    }

    fn target_slot(&self) -> Result<SlotInfo, UpdateError> {
        let slot = match self.slots.next_inactive() {
            Ok(Some(slot)) => slot,
            Ok(None) => {
                log::error!("No OTA partition found");
                return Err(UpdateError::NoSlot);
            }
            Err(e) => {
                log::error!("Could not look up update partition: {e}");
                return Err(UpdateError::NoSlot);
            }
        };
        if !slot.is_app {
            log::error!("Target partition '{}' is not an app partition", slot.label);
            return Err(UpdateError::NoSlot);
        }
        Ok(slot)
    }

    fn stream(
        &self,
        source: &mut dyn ByteSource,
        txn: &mut Transaction<S::Writer>,
        total_length: u64,
    ) -> Result<Sha256, UpdateError> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; self.policy.chunk_size.max(1)];
        let mut remaining = total_length;
        let mut timeouts = 0u8;
        let mut next_progress = 10u64;

        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            match source.read(&mut buf[..want]) {
                Err(ReadError::Timeout) => {
                    timeouts += 1;
                    if timeouts >= self.policy.max_consecutive_timeouts {
                        log::error!("OTA socket timeout limit reached. Aborting.");
                        return Err(UpdateError::StreamTimeout);
                    }
                    log::warn!(
                        "Socket timeout, retrying... ({}/{})",
                        timeouts,
                        self.policy.max_consecutive_timeouts
                    );
                }
                Err(ReadError::Failed(code)) => {
                    log::error!(
                        "OTA receive failed ({code}) after {} bytes",
                        total_length - remaining
                    );
                    return Err(UpdateError::StreamError);
                }
                Ok(0) => {
                    log::warn!("Client closed the stream with {remaining} bytes outstanding");
                    break;
                }
                Ok(read) => {
                    timeouts = 0;
                    let chunk = &buf[..read.min(want)];
                    txn.write(chunk).map_err(|e| {
                        log::error!("Flash write failed: {e}");
                        UpdateError::FlashWriteFailed
                    })?;
                    hasher.update(chunk);
                    remaining -= chunk.len() as u64;

                    let pct = (total_length - remaining) * 100 / total_length;
                    if pct >= next_progress {
                        log::info!("OTA progress: {pct}%");
                        next_progress = pct / 10 * 10 + 10;
                    }
                }
            }
        }

        if remaining != 0 {
            log::error!("OTA stream mismatch: {remaining} bytes missing");
            return Err(UpdateError::LengthMismatch);
        }
        Ok(hasher)
    }
}

/// Owns the slot writer; whatever happens, the driver transaction is ended
/// exactly once.
struct Transaction<W: SlotWriter> {
    writer: Option<W>,
}

impl<W: SlotWriter> Transaction<W> {
    fn new(writer: W) -> Self {
        Self { writer: Some(writer) }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), DriverError> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(data),
            None => Err(DriverError(-1)),
        }
    }

    fn finish(mut self) -> Result<(), DriverError> {
        match self.writer.take() {
            Some(writer) => writer.finish(),
            None => Err(DriverError(-1)),
        }
    }
}

impl<W: SlotWriter> Drop for Transaction<W> {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            log::warn!("Aborting OTA transaction");
            writer.abort();
        }
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
