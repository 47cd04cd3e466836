//! Lifecycle controller: installs and removes tracing hooks in a host
//! framework.
//!
//! A host framework exposes its patchable entry points as [`HookSlot`]s.
//! An [`Instrumentor`] describes one framework target: its version, the
//! supported version range and the [`Patch`]es that route the framework's
//! entry points through an [`EventTracer`]. The
//! [`InstrumentationController`] applies those patches as one atomic unit and
//! keeps them in a process-wide patch table keyed by target name, so a target
//! is never instrumented twice even through distinct controllers.

use crate::capture::DEFAULT_MAX_STATE_SIZE;
use crate::error::{InstrumentationError, InstrumentationResult, PatchError};
use crate::exporter::{ConsoleExporter, ExporterConfig, SpanExporter};
use crate::registry::RunRegistryConfig;
use crate::tracer::{EventTracer, TracerConfig};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use semver::{Version, VersionReq};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

pub const ENV_SERVICE_NAME: &str = "TRACEHOOK_SERVICE_NAME";
pub const ENV_CAPTURE_STATE: &str = "TRACEHOOK_CAPTURE_STATE";
pub const ENV_CAPTURE_INPUT: &str = "TRACEHOOK_CAPTURE_INPUT";
pub const ENV_MAX_STATE_SIZE: &str = "TRACEHOOK_MAX_STATE_SIZE";

// ============================================================================
// Hook surface
// ============================================================================

/// A patchable entry point of a host framework.
///
/// The framework dispatches through [`get`](Self::get); instrumentation swaps
/// the handler behind it. Identity is by `Arc` pointer, so restoring an
/// original is observable with [`Arc::ptr_eq`].
pub struct HookSlot<H: ?Sized> {
    entry_point: String,
    handler: RwLock<Arc<H>>,
}

impl<H: ?Sized> HookSlot<H> {
    pub fn new(entry_point: impl Into<String>, handler: Arc<H>) -> Self {
        Self {
            entry_point: entry_point.into(),
            handler: RwLock::new(handler),
        }
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Current handler.
    pub fn get(&self) -> Arc<H> {
        self.handler.read().clone()
    }

    /// Unconditionally install `handler`, returning the previous one.
    pub fn replace(&self, handler: Arc<H>) -> Arc<H> {
        std::mem::replace(&mut *self.handler.write(), handler)
    }

    /// Install `new` only if the slot still holds `current`.
    ///
    /// Returns the displaced handler, or hands `new` back on mismatch.
    pub fn compare_and_swap(&self, current: &Arc<H>, new: Arc<H>) -> Result<Arc<H>, Arc<H>> {
        let mut handler = self.handler.write();
        if Arc::ptr_eq(&*handler, current) {
            Ok(std::mem::replace(&mut *handler, new))
        } else {
            Err(new)
        }
    }
}

impl<H: ?Sized> fmt::Debug for HookSlot<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookSlot")
            .field("entry_point", &self.entry_point)
            .finish_non_exhaustive()
    }
}

/// One reversible modification of a framework entry point.
pub trait Patch: Send {
    fn entry_point(&self) -> &str;

    fn apply(&mut self) -> Result<(), PatchError>;

    /// Restore the exact original handler.
    fn revert(&mut self) -> Result<(), PatchError>;

    fn is_applied(&self) -> bool;
}

struct Installed<H: ?Sized> {
    original: Arc<H>,
    replacement: Arc<H>,
}

/// Patch that wraps the handler of a [`HookSlot`].
///
/// `wrap` receives the original handler and returns the replacement that
/// forwards to it. Revert refuses to clobber a handler installed by someone
/// else after this patch.
pub struct SlotPatch<H: ?Sized> {
    slot: Arc<HookSlot<H>>,
    wrap: Box<dyn Fn(Arc<H>) -> Arc<H> + Send + Sync>,
    installed: Option<Installed<H>>,
}

impl<H: ?Sized> SlotPatch<H> {
    pub fn new<F>(slot: Arc<HookSlot<H>>, wrap: F) -> Self
    where
        F: Fn(Arc<H>) -> Arc<H> + Send + Sync + 'static,
    {
        Self {
            slot,
            wrap: Box::new(wrap),
            installed: None,
        }
    }
}

impl<H> Patch for SlotPatch<H>
where
    H: ?Sized + Send + Sync + 'static,
{
    fn entry_point(&self) -> &str {
        self.slot.entry_point()
    }

    fn apply(&mut self) -> Result<(), PatchError> {
        if self.installed.is_some() {
            return Err(PatchError::InvalidState {
                entry_point: self.slot.entry_point().to_string(),
                expected: "reverted",
                actual: "applied",
            });
        }

        let original = self.slot.get();
        let replacement = (self.wrap)(original.clone());
        self.slot
            .compare_and_swap(&original, replacement.clone())
            .map_err(|_| PatchError::SlotMismatch(self.slot.entry_point().to_string()))?;

        self.installed = Some(Installed {
            original,
            replacement,
        });
        Ok(())
    }

    fn revert(&mut self) -> Result<(), PatchError> {
        let Some(installed) = self.installed.take() else {
            return Err(PatchError::InvalidState {
                entry_point: self.slot.entry_point().to_string(),
                expected: "applied",
                actual: "reverted",
            });
        };

        match self
            .slot
            .compare_and_swap(&installed.replacement, installed.original.clone())
        {
            Ok(_) => Ok(()),
            Err(_) => {
                let entry_point = self.slot.entry_point().to_string();
                self.installed = Some(installed);
                Err(PatchError::SlotMismatch(entry_point))
            }
        }
    }

    fn is_applied(&self) -> bool {
        self.installed.is_some()
    }
}

/// Describes how to instrument one host framework target.
pub trait Instrumentor: Send + Sync {
    /// Framework target name, the key of the patch table.
    fn target(&self) -> &str;

    /// Version reported by the installed framework.
    fn framework_version(&self) -> Version;

    /// Versions these patches are known to work with.
    fn supported_versions(&self) -> VersionReq;

    /// Build the patches that route entry points through `tracer`.
    fn patches(&self, tracer: &EventTracer) -> Result<Vec<Box<dyn Patch>>, PatchError>;
}

// ============================================================================
// Options
// ============================================================================

/// Options for [`InstrumentationController::instrument`].
#[derive(Clone)]
pub struct InstrumentOptions {
    /// Sink for finished spans; a summary console exporter when unset.
    pub exporter: Option<Arc<dyn SpanExporter>>,
    pub capture_state: bool,
    pub capture_input: bool,
    /// Byte limit of one state snapshot.
    pub max_state_size: usize,
    pub service_name: String,
    pub registry: RunRegistryConfig,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        Self {
            exporter: None,
            capture_state: true,
            capture_input: true,
            max_state_size: DEFAULT_MAX_STATE_SIZE,
            service_name: "tracehook".to_string(),
            registry: RunRegistryConfig::default(),
        }
    }
}

impl InstrumentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `TRACEHOOK_*` environment variables.
    pub fn from_env() -> InstrumentationResult<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, typically the process environment.
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> InstrumentationResult<Self> {
        if let Some(name) = lookup(ENV_SERVICE_NAME) {
            self.service_name = name;
        }
        if let Some(raw) = lookup(ENV_CAPTURE_STATE) {
            self.capture_state = parse_flag(ENV_CAPTURE_STATE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_CAPTURE_INPUT) {
            self.capture_input = parse_flag(ENV_CAPTURE_INPUT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_STATE_SIZE) {
            self.max_state_size = raw.trim().parse().map_err(|_| {
                InstrumentationError::InvalidOptions(format!(
                    "{} must be a byte count, got '{}'",
                    ENV_MAX_STATE_SIZE, raw
                ))
            })?;
        }
        Ok(self)
    }

    pub fn with_exporter(mut self, exporter: Arc<dyn SpanExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn with_capture_state(mut self, enabled: bool) -> Self {
        self.capture_state = enabled;
        self
    }

    pub fn with_capture_input(mut self, enabled: bool) -> Self {
        self.capture_input = enabled;
        self
    }

    pub fn with_max_state_size(mut self, max_bytes: usize) -> Self {
        self.max_state_size = max_bytes;
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_registry(mut self, registry: RunRegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    pub fn validate(&self) -> InstrumentationResult<()> {
        if self.max_state_size == 0 {
            return Err(InstrumentationError::InvalidOptions(
                "max_state_size must be greater than zero".to_string(),
            ));
        }
        if self.service_name.trim().is_empty() {
            return Err(InstrumentationError::InvalidOptions(
                "service_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tracer_config(&self) -> TracerConfig {
        TracerConfig::new(self.service_name.clone())
            .with_capture_state(self.capture_state)
            .with_capture_input(self.capture_input)
            .with_max_state_size(self.max_state_size)
            .with_registry(self.registry.clone())
    }

    fn build_tracer(&self) -> EventTracer {
        let exporter = self.exporter.clone().unwrap_or_else(|| {
            Arc::new(
                ConsoleExporter::new(ExporterConfig::new(self.service_name.clone()))
                    .with_summary_only(),
            )
        });
        EventTracer::new(self.tracer_config(), exporter)
    }
}

impl fmt::Debug for InstrumentOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentOptions")
            .field("exporter", &self.exporter.as_ref().map(|_| "<dyn SpanExporter>"))
            .field("capture_state", &self.capture_state)
            .field("capture_input", &self.capture_input)
            .field("max_state_size", &self.max_state_size)
            .field("service_name", &self.service_name)
            .field("registry", &self.registry)
            .finish()
    }
}

fn parse_flag(key: &str, raw: &str) -> InstrumentationResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(InstrumentationError::InvalidOptions(format!(
            "{} must be a boolean, got '{}'",
            key, raw
        ))),
    }
}

// ============================================================================
// Controller
// ============================================================================

/// One patched entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    pub entry_point: String,
    pub installed: bool,
    pub installed_at: DateTime<Utc>,
}

struct PatchSet {
    patches: Vec<Box<dyn Patch>>,
    records: Vec<PatchRecord>,
    tracer: EventTracer,
}

enum TableEntry {
    /// 补丁正在安装，表锁之外进行
    /// Patches are being installed outside the table lock
    Installing,
    Active(PatchSet),
}

impl TableEntry {
    fn active(&self) -> Option<&PatchSet> {
        match self {
            TableEntry::Active(set) => Some(set),
            TableEntry::Installing => None,
        }
    }
}

// 全局补丁表；只在短暂的查找和插入期间加锁，从不在锁内调用 Instrumentor 或 Patch
// Global patch table; locked only for lookups and inserts, never while an
// Instrumentor or Patch runs
lazy_static::lazy_static! {
    static ref PATCH_TABLE: Mutex<HashMap<String, TableEntry>> = Mutex::new(HashMap::new());
}

/// Targets that currently hold an active patch set.
pub fn instrumented_targets() -> Vec<String> {
    let mut targets: Vec<String> = PATCH_TABLE
        .lock()
        .iter()
        .filter(|(_, entry)| entry.active().is_some())
        .map(|(target, _)| target.clone())
        .collect();
    targets.sort();
    targets
}

/// Claim on a target while its patches are installed. Released on drop
/// unless committed.
struct Reservation {
    target: String,
    committed: bool,
}

impl Reservation {
    fn acquire(target: &str) -> InstrumentationResult<Self> {
        let mut table = PATCH_TABLE.lock();
        if table.contains_key(target) {
            return Err(InstrumentationError::AlreadyInstrumented {
                target: target.to_string(),
            });
        }
        table.insert(target.to_string(), TableEntry::Installing);
        Ok(Self {
            target: target.to_string(),
            committed: false,
        })
    }

    fn commit(mut self, set: PatchSet) {
        PATCH_TABLE
            .lock()
            .insert(self.target.clone(), TableEntry::Active(set));
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            PATCH_TABLE.lock().remove(&self.target);
        }
    }
}

/// Installs and removes the patch set of one framework target.
#[derive(Clone)]
pub struct InstrumentationController {
    instrumentor: Arc<dyn Instrumentor>,
}

impl InstrumentationController {
    pub fn new(instrumentor: impl Instrumentor + 'static) -> Self {
        Self {
            instrumentor: Arc::new(instrumentor),
        }
    }

    pub fn from_arc(instrumentor: Arc<dyn Instrumentor>) -> Self {
        Self { instrumentor }
    }

    pub fn target(&self) -> &str {
        self.instrumentor.target()
    }

    /// Install every patch of the target, or none of them.
    ///
    /// The target is claimed before its patches are built; a second attempt
    /// during installation fails with `AlreadyInstrumented`.
    pub fn instrument(&self, options: InstrumentOptions) -> InstrumentationResult<EventTracer> {
        let target = self.instrumentor.target().to_string();
        let reservation = Reservation::acquire(&target)?;

        options.validate()?;

        let version = self.instrumentor.framework_version();
        let supported = self.instrumentor.supported_versions();
        if !supported.matches(&version) {
            return Err(InstrumentationError::UnsupportedVersion {
                target,
                version: version.to_string(),
                supported: supported.to_string(),
            });
        }

        let tracer = options.build_tracer();
        let mut patches = self.instrumentor.patches(&tracer).map_err(|source| {
            InstrumentationError::PatchFailed {
                entry_point: target.clone(),
                source,
            }
        })?;

        for index in 0..patches.len() {
            if let Err(source) = patches[index].apply() {
                let entry_point = patches[index].entry_point().to_string();
                error!(
                    "Failed to patch '{}' of '{}': {}; rolling back {} patch(es)",
                    entry_point, target, source, index
                );
                rollback(&mut patches[..index]);
                return Err(InstrumentationError::PatchFailed {
                    entry_point,
                    source,
                });
            }
            debug!(entry_point = patches[index].entry_point(), "Patched entry point");
        }

        let installed_at = Utc::now();
        let records = patches
            .iter()
            .map(|patch| PatchRecord {
                entry_point: patch.entry_point().to_string(),
                installed: patch.is_applied(),
                installed_at,
            })
            .collect();

        info!(
            "Instrumented '{}' {} ({} entry points)",
            target,
            version,
            patches.len()
        );
        reservation.commit(PatchSet {
            patches,
            records,
            tracer: tracer.clone(),
        });
        Ok(tracer)
    }

    /// Restore every original entry point in reverse installation order.
    ///
    /// Spans already emitted and the exporter stay untouched. A patch whose
    /// original cannot be restored is reported after all others are
    /// reverted; the target counts as uninstrumented either way.
    pub fn uninstrument(&self) -> InstrumentationResult<()> {
        let target = self.instrumentor.target().to_string();
        let mut set = {
            let mut table = PATCH_TABLE.lock();
            match table.remove(&target) {
                Some(TableEntry::Active(set)) => set,
                Some(TableEntry::Installing) => {
                    table.insert(target.clone(), TableEntry::Installing);
                    return Err(InstrumentationError::NotInstrumented { target });
                }
                None => return Err(InstrumentationError::NotInstrumented { target }),
            }
        };

        let mut first_failure = None;
        for patch in set.patches.iter_mut().rev() {
            if let Err(source) = patch.revert() {
                error!("Failed to restore '{}': {}", patch.entry_point(), source);
                if first_failure.is_none() {
                    first_failure = Some(InstrumentationError::PatchFailed {
                        entry_point: patch.entry_point().to_string(),
                        source,
                    });
                }
            }
        }

        info!("Uninstrumented '{}'", target);
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_instrumented(&self) -> bool {
        PATCH_TABLE
            .lock()
            .get(self.instrumentor.target())
            .is_some_and(|entry| entry.active().is_some())
    }

    /// Tracer wired into the active patch set.
    pub fn tracer(&self) -> Option<EventTracer> {
        PATCH_TABLE
            .lock()
            .get(self.instrumentor.target())
            .and_then(TableEntry::active)
            .map(|set| set.tracer.clone())
    }

    pub fn patch_records(&self) -> Vec<PatchRecord> {
        PATCH_TABLE
            .lock()
            .get(self.instrumentor.target())
            .and_then(TableEntry::active)
            .map(|set| set.records.clone())
            .unwrap_or_default()
    }

    pub fn patched_entry_points(&self) -> Vec<String> {
        self.patch_records()
            .into_iter()
            .map(|record| record.entry_point)
            .collect()
    }
}

impl fmt::Debug for InstrumentationController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentationController")
            .field("target", &self.instrumentor.target())
            .finish()
    }
}

fn rollback(patches: &mut [Box<dyn Patch>]) {
    for patch in patches.iter_mut().rev() {
        if let Err(e) = patch.revert() {
            error!("Rollback of '{}' failed: {}", patch.entry_point(), e);
        }
    }
}
