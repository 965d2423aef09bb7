//! Unit-aware device signals.
//!
//! A [`Signal`] is the narrow interface the scan engine uses to talk to
//! hardware: an async read, an async write and a subscription, plus the name
//! and unit metadata published by the control system. Preprocessors and the
//! trajectory controller receive `Arc<dyn Signal<T>>` handles directly at
//! construction time; nothing in the crate looks devices up by name.
//!
//! [`SoftSignal`] is an in-memory implementation backed by a
//! `tokio::sync::watch` channel, so any number of subscribers see every
//! update. It is used for simulated devices and in tests, and can be flipped
//! into a disconnected state to exercise failure paths.
//!
//! # Example
//!
//! ```rust,ignore
//! let bragg = SoftSignal::new("mono-bragg", 67407.9).with_units("arcsec");
//! let mut rx = bragg.subscribe()?;
//! bragg.set(67500.0).await?;
//! rx.changed().await?;
//! assert_eq!(*rx.borrow(), 67500.0);
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{ScanError, ScanResult};
use crate::units::{PhysicalQuantity, Unit};

/// Shared handle to a signal.
pub type SignalRef<T = f64> = Arc<dyn Signal<T>>;

/// Async, unit-aware access to a single device value.
#[async_trait]
pub trait Signal<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Unique signal name, e.g. `"secondary_mono-bragg"`.
    fn name(&self) -> &str;

    /// Engineering units published with the signal, if any.
    fn units(&self) -> Option<&str>;

    /// Read the current value from the device.
    async fn get_value(&self) -> ScanResult<T>;

    /// Write a new value and wait for the device to accept it.
    async fn set(&self, value: T) -> ScanResult<()>;

    /// Subscribe to value updates.
    fn subscribe(&self) -> ScanResult<watch::Receiver<T>>;
}

/// Whether two handles point at the same signal object.
pub fn same_signal<T>(a: &SignalRef<T>, b: &SignalRef<T>) -> bool
where
    T: Clone + Send + Sync + 'static,
{
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Read a signal and tag the value with the units from its metadata.
pub async fn read_quantity(signal: &dyn Signal<f64>) -> ScanResult<PhysicalQuantity> {
    let value = signal.get_value().await?;
    let units = signal
        .units()
        .ok_or_else(|| ScanError::MissingUnits(signal.name().to_string()))?;
    let unit: Unit = units.parse()?;
    Ok(PhysicalQuantity::new(value, unit))
}

// =============================================================================
// SoftSignal<T>
// =============================================================================

/// Metadata published with a soft signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMetadata {
    /// Signal name (unique within a beamline)
    pub name: String,
    /// Human-readable description
    pub description: Option<String>,
    /// Engineering units (e.g. "eV", "um", "arcsec")
    pub units: Option<String>,
    /// Whether writes are rejected
    pub read_only: bool,
}

type Validator<T> = Arc<dyn Fn(&T) -> ScanResult<()> + Send + Sync>;

/// In-memory signal with watch-channel change notification.
///
/// Clones share the same channel, connection flag and put history, so a test
/// can hold one clone while the device under test holds another.
pub struct SoftSignal<T>
where
    T: Clone + Send + Sync + 'static,
{
    sender: Arc<watch::Sender<T>>,
    metadata: SignalMetadata,
    connected: Arc<AtomicBool>,
    validator: Option<Validator<T>>,
    puts: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Debug for SoftSignal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftSignal")
            .field("metadata", &self.metadata)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for SoftSignal<T> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
            metadata: self.metadata.clone(),
            connected: Arc::clone(&self.connected),
            validator: self.validator.clone(),
            puts: Arc::clone(&self.puts),
        }
    }
}

impl<T> SoftSignal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a connected signal holding `initial`.
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
            metadata: SignalMetadata {
                name: name.into(),
                description: None,
                units: None,
                read_only: false,
            },
            connected: Arc::new(AtomicBool::new(true)),
            validator: None,
            puts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Attach engineering units.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.metadata.units = Some(units.into());
        self
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = Some(description.into());
        self
    }

    /// Reject all writes through [`Signal::set`].
    pub fn read_only(mut self) -> Self {
        self.metadata.read_only = true;
        self
    }

    /// Add a validation function run before every write.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&T) -> ScanResult<()> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Metadata of this signal.
    pub fn metadata(&self) -> &SignalMetadata {
        &self.metadata
    }

    /// Current value without going through the async interface.
    pub fn current(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Update the value as the device itself would (bypasses read-only,
    /// validation and the put history).
    pub fn set_readback(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Simulate losing or regaining the device connection.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Whether the simulated device is connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Every value written through [`Signal::set`], oldest first.
    pub fn put_history(&self) -> Vec<T> {
        self.puts.lock().clone()
    }

    /// Erase the put history.
    pub fn clear_put_history(&self) {
        self.puts.lock().clear();
    }

    /// Share this signal as a trait object.
    pub fn handle(&self) -> SignalRef<T> {
        Arc::new(self.clone())
    }

    fn ensure_connected(&self) -> ScanResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ScanError::Disconnected(self.metadata.name.clone()))
        }
    }
}

#[async_trait]
impl<T> Signal<T> for SoftSignal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.metadata.name
    }

    fn units(&self) -> Option<&str> {
        self.metadata.units.as_deref()
    }

    async fn get_value(&self) -> ScanResult<T> {
        self.ensure_connected()?;
        Ok(self.current())
    }

    async fn set(&self, value: T) -> ScanResult<()> {
        self.ensure_connected()?;
        if self.metadata.read_only {
            return Err(ScanError::SignalWrite {
                signal: self.metadata.name.clone(),
                reason: "signal is read-only".to_string(),
            });
        }
        if let Some(validator) = &self.validator {
            validator(&value)?;
        }
        self.puts.lock().push(value.clone());
        self.sender.send_replace(value);
        Ok(())
    }

    fn subscribe(&self) -> ScanResult<watch::Receiver<T>> {
        self.ensure_connected()?;
        Ok(self.sender.subscribe())
    }
}
