//! The geocode sync loop.
//!
//! A pass walks one batch of host records in order. Records that opted into
//! geocoding and carry an address but no longitude get a single lookup, and
//! the result is written back together with the address it was resolved from.
//! That stored address acts as the cache key: when it stops matching the
//! current address the record's coordinates are discarded and looked up again.
//!
//! Passes never overlap. A batch that arrives while a pass is running is
//! dropped, and the next delivery after the pass settles picks up whatever
//! it missed.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::geocoder::Geocoder;
use crate::host::HostStore;
use crate::record::{
    Coordinate, CoordinatePolicy, FieldMapping, FieldValues, Record, Role, RowRecord,
};
use crate::telemetry::{JournalEvent, SyncJournal};

pub const DEFAULT_LOOKUP_DELAY: Duration = Duration::from_millis(1_000);

type PassHandle = Shared<BoxFuture<'static, PassReport>>;

/// Everything a pass needs from the host, captured when the scan is requested.
#[derive(Debug, Clone)]
pub struct SyncBatch {
    pub table_id: String,
    pub records: Vec<Record>,
    pub mapping: FieldMapping,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub table_id: String,
    pub scanned: usize,
    pub opted_out: usize,
    pub invalidated: usize,
    pub lookups: usize,
    pub lookup_failures: usize,
    pub updates: usize,
    pub update_failures: usize,
    /// The table has no usable Geocode, Longitude or Latitude column.
    pub unconfigured: bool,
    /// The pass panicked; counters cover the records handled before that.
    pub aborted: bool,
}

impl PassReport {
    fn new(table_id: &str) -> Self {
        Self {
            table_id: table_id.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct SyncOptions {
    pub lookup_delay: Duration,
    pub coordinate_policy: CoordinatePolicy,
    pub journal: Option<SyncJournal>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            lookup_delay: DEFAULT_LOOKUP_DELAY,
            coordinate_policy: CoordinatePolicy::default(),
            journal: None,
        }
    }
}

impl SyncOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            lookup_delay: Duration::from_millis(config.geocode_delay_ms),
            coordinate_policy: config.coordinate_policy,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: SyncJournal) -> Self {
        self.journal = Some(journal);
        self
    }
}

/// Flat spacing between provider calls. Public geocoders (Nominatim in
/// particular) allow roughly one request per second per client.
struct Pacer {
    delay: Duration,
}

impl Pacer {
    async fn pause(&self) {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
    }
}

#[derive(Clone)]
pub struct GeocodeSync {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    geocoder: Arc<dyn Geocoder>,
    store: Arc<dyn HostStore>,
    pacer: Pacer,
    policy: CoordinatePolicy,
    journal: Option<SyncJournal>,
    in_flight: Mutex<Option<PassHandle>>,
    passes_started: AtomicU64,
}

/// Clears the in-flight slot when the pass future finishes or unwinds.
struct InFlightRelease(Arc<SyncInner>);

impl Drop for InFlightRelease {
    fn drop(&mut self) {
        self.0.in_flight.lock().take();
    }
}

impl GeocodeSync {
    pub fn new(
        geocoder: Arc<dyn Geocoder>,
        store: Arc<dyn HostStore>,
        options: SyncOptions,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                geocoder,
                store,
                pacer: Pacer {
                    delay: options.lookup_delay,
                },
                policy: options.coordinate_policy,
                journal: options.journal,
                in_flight: Mutex::new(None),
                passes_started: AtomicU64::new(0),
            }),
        }
    }

    /// Starts a pass over `batch` unless one is already running.
    ///
    /// Returns whether a pass was started. The pass runs as a task on the
    /// current tokio runtime; use [`GeocodeSync::wait_idle`] to await it.
    /// Outside a runtime nothing is started and `false` is returned.
    pub fn scan_on_need(&self, batch: SyncBatch) -> bool {
        let Ok(runtime) = Handle::try_current() else {
            warn!(table_id = %batch.table_id, "no async runtime; cannot start sync pass");
            return false;
        };

        let mut in_flight = self.inner.in_flight.lock();
        if in_flight.is_some() {
            drop(in_flight);
            debug!(table_id = %batch.table_id, "sync pass in flight; dropping batch");
            self.inner.note(JournalEvent::PassSkipped {
                table_id: batch.table_id,
            });
            return false;
        }

        let release = InFlightRelease(Arc::clone(&self.inner));
        let pass: PassHandle = async move {
            // Bound inside the body so it drops as soon as the pass returns.
            let release = release;
            let table_id = batch.table_id.clone();
            match AssertUnwindSafe(release.0.run_pass(batch)).catch_unwind().await {
                Ok(report) => report,
                Err(panic) => {
                    error!(%table_id, reason = panic_reason(&*panic), "sync pass panicked");
                    let report = PassReport {
                        aborted: true,
                        ..PassReport::new(&table_id)
                    };
                    release.0.note(JournalEvent::PassCompleted(report.clone()));
                    report
                }
            }
        }
        .boxed()
        .shared();

        // The slot stays locked until the handle is stored, so a pass that
        // finishes immediately cannot clear it before it is set.
        *in_flight = Some(pass.clone());
        drop(in_flight);
        runtime.spawn(pass);
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner.in_flight.lock().is_some()
    }

    /// Waits for the in-flight pass, if any, and returns its report.
    pub async fn wait_idle(&self) -> Option<PassReport> {
        let pending = self.inner.in_flight.lock().clone();
        match pending {
            Some(pass) => Some(pass.await),
            None => None,
        }
    }

    pub fn passes_started(&self) -> u64 {
        self.inner.passes_started.load(Ordering::SeqCst)
    }
}

impl SyncInner {
    async fn run_pass(&self, batch: SyncBatch) -> PassReport {
        self.passes_started.fetch_add(1, Ordering::SeqCst);
        let SyncBatch {
            table_id,
            records,
            mapping,
        } = batch;
        let mut report = PassReport::new(&table_id);

        for record in records {
            let mut row = RowRecord::bind(record, &mapping);
            report.scanned += 1;

            if !row.has(Role::Geocode) {
                debug!(%table_id, row_id = row.id(), "geocode column missing; stopping pass");
                report.unconfigured = true;
                break;
            }
            if !row.get(Role::Geocode).is_truthy() {
                report.opted_out += 1;
                continue;
            }

            let address = row.get(Role::Address).as_text().unwrap_or_default();
            let cached = row.get(Role::GeocodedAddress);
            if cached.is_truthy() && cached.as_text().as_deref() != Some(address.as_str()) {
                row.clear(Role::Longitude);
                row.clear(Role::Latitude);
                report.invalidated += 1;
            }

            if address.is_empty() || !self.policy.is_unset(&row.get(Role::Longitude)) {
                continue;
            }
            if row.column(Role::Longitude).is_none() || row.column(Role::Latitude).is_none() {
                warn!(%table_id, "longitude or latitude column not mapped; stopping pass");
                report.unconfigured = true;
                break;
            }

            report.lookups += 1;
            match self.geocoder.geocode(&address).await {
                Ok(coordinate) => {
                    let update = coordinate_update(&row, coordinate, &address);
                    match self.store.apply_update(&table_id, row.id(), update).await {
                        Ok(()) => report.updates += 1,
                        Err(err) => {
                            warn!(?err, %table_id, row_id = row.id(), "failed to write coordinates");
                            report.update_failures += 1;
                        }
                    }
                }
                Err(err) => {
                    warn!(?err, %table_id, row_id = row.id(), %address, "geocoding failed");
                    report.lookup_failures += 1;
                }
            }
            self.pacer.pause().await;
        }

        info!(
            %table_id,
            scanned = report.scanned,
            lookups = report.lookups,
            updates = report.updates,
            failures = report.lookup_failures + report.update_failures,
            unconfigured = report.unconfigured,
            "sync pass finished"
        );
        self.note(JournalEvent::PassCompleted(report.clone()));
        report
    }

    fn note(&self, event: JournalEvent) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.append(event) {
                warn!(?err, "failed to journal sync event");
            }
        }
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown")
}

fn coordinate_update(row: &RowRecord, coordinate: Coordinate, address: &str) -> FieldValues {
    let mut update = FieldValues::new();
    if let Some(column) = row.column(Role::Longitude) {
        update.insert(column.to_string(), json!(coordinate.lng));
    }
    if let Some(column) = row.column(Role::Latitude) {
        update.insert(column.to_string(), json!(coordinate.lat));
    }
    if let Some(column) = row.column(Role::GeocodedAddress) {
        update.insert(column.to_string(), json!(address));
    }
    update
}
