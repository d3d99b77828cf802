//! Dynamic metric registry.
//!
//! Series are discovered at runtime: each distinct (name, label-name set)
//! becomes a [`SeriesInstance`] the first time it is observed, and every
//! instance holds the last value written for each concrete label assignment.
//! The registry is shared by all topic workers (writers) and the scrape
//! handler (reader); all access goes through its methods.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::{ConflictPolicy, FilterConfig, RegistryConfig};
use crate::mapping::{LabelSet, ResolvedSample, SeriesIdentity};

/// Registry failures. None of them are fatal to the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("metric '{name}' has labels {existing:?}, rejecting labels {rejected:?}")]
    LabelConflict {
        name: String,
        existing: Vec<String>,
        rejected: Vec<String>,
    },

    #[error("label assignment does not match labels {expected:?} of '{name}'")]
    LabelMismatch { name: String, expected: Vec<String> },

    #[error("max series limit ({0}) reached")]
    CapacityExceeded(usize),
}

/// What happened to a recorded sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The value was stored.
    Stored,
    /// The sample was dropped by the configured filters.
    Filtered,
}

/// One live series: an identity plus the last value per label assignment.
#[derive(Debug)]
pub struct SeriesInstance {
    identity: SeriesIdentity,
    help: String,
    /// Keyed by label values in `identity.label_names` order.
    values: RwLock<BTreeMap<Vec<String>, f64>>,
}

impl SeriesInstance {
    fn new(identity: SeriesIdentity, help: String) -> Self {
        Self {
            identity,
            help,
            values: RwLock::new(BTreeMap::new()),
        }
    }

    /// Identity the series is exposed under.
    pub fn identity(&self) -> &SeriesIdentity {
        &self.identity
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    /// Number of label assignments held.
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    /// Current value for a label assignment.
    pub fn get(&self, labels: &LabelSet) -> Option<f64> {
        if !self.identity.matches(labels) {
            return None;
        }
        let key: Vec<String> = labels.values().cloned().collect();
        self.values.read().get(&key).copied()
    }

    fn key_for(&self, labels: &LabelSet) -> Result<Vec<String>, RegistryError> {
        if !self.identity.matches(labels) {
            return Err(RegistryError::LabelMismatch {
                name: self.identity.name.clone(),
                expected: self.identity.label_names.clone(),
            });
        }
        // LabelSet iterates in sorted key order, same as label_names
        Ok(labels.values().cloned().collect())
    }

    fn samples(&self) -> Vec<(LabelSet, f64)> {
        let values = self.values.read();
        values
            .iter()
            .map(|(key, value)| {
                let labels = self
                    .identity
                    .label_names
                    .iter()
                    .cloned()
                    .zip(key.iter().cloned())
                    .collect();
                (labels, *value)
            })
            .collect()
    }
}

/// Point-in-time copy of one series.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSnapshot {
    pub identity: SeriesIdentity,
    pub help: String,
    /// Label assignments with their last value, ordered by label values.
    pub samples: Vec<(LabelSet, f64)>,
}

/// Filter for resolved samples.
pub struct MetricFilter {
    include_metrics: Vec<glob::Pattern>,
    exclude_metrics: Vec<glob::Pattern>,
    include_namespaces: Vec<String>,
    exclude_namespaces: Vec<String>,
}

impl MetricFilter {
    /// Create a new filter from configuration. Invalid glob patterns are
    /// skipped with a warning.
    pub fn new(config: &FilterConfig) -> Self {
        let compile = |patterns: &[String]| -> Vec<glob::Pattern> {
            patterns
                .iter()
                .filter_map(|p| match glob::Pattern::new(p) {
                    Ok(pattern) => Some(pattern),
                    Err(e) => {
                        warn!(pattern = %p, error = %e, "Ignoring invalid metric pattern");
                        None
                    }
                })
                .collect()
        };

        Self {
            include_metrics: compile(&config.include_metrics),
            exclude_metrics: compile(&config.exclude_metrics),
            include_namespaces: config.include_namespaces.clone(),
            exclude_namespaces: config.exclude_namespaces.clone(),
        }
    }

    /// Check if a sample should be recorded.
    pub fn should_include(&self, sample: &ResolvedSample) -> bool {
        let name = sample.identity.name.as_str();
        let namespace = sample.namespace.as_str();

        if !self.include_namespaces.is_empty()
            && !self.include_namespaces.iter().any(|n| n == namespace)
        {
            return false;
        }
        if self.exclude_namespaces.iter().any(|n| n == namespace) {
            return false;
        }

        if !self.include_metrics.is_empty() && !self.include_metrics.iter().any(|p| p.matches(name))
        {
            return false;
        }
        if self.exclude_metrics.iter().any(|p| p.matches(name)) {
            return false;
        }

        true
    }
}

impl Default for MetricFilter {
    fn default() -> Self {
        Self::new(&FilterConfig::default())
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Samples offered to the registry.
    pub records_received: u64,
    /// Samples stored.
    pub records_accepted: u64,
    /// Samples dropped by filters.
    pub records_filtered: u64,
    /// Samples rejected by the label-conflict policy.
    pub label_conflicts: u64,
    /// Samples rejected because max_series was reached.
    pub records_dropped_max_series: u64,
    /// Series instances created.
    pub series_created: u64,
}

#[derive(Default)]
struct Inner {
    /// Requested identity to the instance serving it. Under the qualify
    /// policy a conflicting identity maps to its renamed instance.
    by_identity: HashMap<SeriesIdentity, Arc<SeriesInstance>>,
    /// Exposed name to its instance; one shape per exposed name.
    by_name: HashMap<String, Arc<SeriesInstance>>,
}

/// Thread-safe registry of dynamically discovered series.
pub struct MetricRegistry {
    inner: RwLock<Inner>,
    config: RegistryConfig,
    filter: MetricFilter,
    /// Label assignments across all instances, bounded by `max_series`.
    samples: AtomicUsize,
    stats: RwLock<RegistryStats>,
    /// Rejected shapes already reported at warn level.
    reported_conflicts: Mutex<HashSet<SeriesIdentity>>,
}

/// Create a shareable registry handle.
pub type SharedRegistry = Arc<MetricRegistry>;

impl MetricRegistry {
    pub fn new(config: RegistryConfig, filter_config: FilterConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            config,
            filter: MetricFilter::new(&filter_config),
            samples: AtomicUsize::new(0),
            stats: RwLock::new(RegistryStats::default()),
            reported_conflicts: Mutex::new(HashSet::new()),
        }
    }

    /// Return the instance for `identity`, creating it on first use.
    ///
    /// A name already registered with a different label-name set is handled
    /// by the configured [`ConflictPolicy`]. `help` is only used on creation.
    pub fn get_or_create(
        &self,
        identity: &SeriesIdentity,
        help: &str,
    ) -> Result<Arc<SeriesInstance>, RegistryError> {
        if let Some(instance) = self.inner.read().by_identity.get(identity) {
            return Ok(instance.clone());
        }

        let mut inner = self.inner.write();
        if let Some(instance) = inner.by_identity.get(identity) {
            return Ok(instance.clone());
        }

        let exposed = match inner.by_name.get(&identity.name) {
            None => identity.clone(),
            Some(existing) => match self.config.label_conflict {
                ConflictPolicy::Reject => {
                    let existing = existing.identity().label_names.clone();
                    drop(inner);
                    return Err(self.conflict(identity, existing));
                }
                ConflictPolicy::Qualify => {
                    let qualified = identity.renamed(qualified_name(identity));
                    if let Some(taken) = inner.by_name.get(&qualified.name) {
                        let existing = taken.identity().label_names.clone();
                        drop(inner);
                        return Err(self.conflict(identity, existing));
                    }
                    qualified
                }
            },
        };

        let instance = Arc::new(SeriesInstance::new(exposed.clone(), help.to_string()));
        inner.by_name.insert(exposed.name.clone(), instance.clone());
        inner.by_identity.insert(identity.clone(), instance.clone());
        drop(inner);

        self.stats.write().series_created += 1;
        debug!(
            name = %exposed.name,
            labels = ?exposed.label_names,
            "Registered new series"
        );

        Ok(instance)
    }

    /// Store `value` for a label assignment of `instance` (last write wins).
    pub fn set(
        &self,
        instance: &SeriesInstance,
        labels: &LabelSet,
        value: f64,
    ) -> Result<(), RegistryError> {
        let key = instance.key_for(labels)?;
        let mut values = instance.values.write();

        if let Some(slot) = values.get_mut(&key) {
            *slot = value;
            return Ok(());
        }

        let max = self.config.max_series;
        if self.samples.fetch_add(1, Ordering::AcqRel) >= max {
            self.samples.fetch_sub(1, Ordering::AcqRel);
            return Err(RegistryError::CapacityExceeded(max));
        }
        values.insert(key, value);
        Ok(())
    }

    /// Filter, register and store one resolved sample.
    pub fn record(&self, sample: &ResolvedSample) -> Result<RecordOutcome, RegistryError> {
        self.stats.write().records_received += 1;

        if !self.filter.should_include(sample) {
            self.stats.write().records_filtered += 1;
            trace!(name = %sample.identity.name, "Sample filtered out");
            return Ok(RecordOutcome::Filtered);
        }

        let help = format!("{} ({})", sample.identity.name, sample.unit);
        let instance = self.get_or_create(&sample.identity, &help)?;

        match self.set(&instance, &sample.labels, sample.value) {
            Ok(()) => {
                self.stats.write().records_accepted += 1;
                Ok(RecordOutcome::Stored)
            }
            Err(e @ RegistryError::CapacityExceeded(_)) => {
                self.stats.write().records_dropped_max_series += 1;
                warn!(
                    max_series = self.config.max_series,
                    name = %sample.identity.name,
                    "Max series limit reached, dropping new series"
                );
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Copy every series for exposition, ordered by exposed name.
    ///
    /// Each instance is copied atomically; instances are not frozen together.
    pub fn snapshot(&self) -> Vec<SeriesSnapshot> {
        let instances: Vec<Arc<SeriesInstance>> =
            self.inner.read().by_name.values().cloned().collect();

        let mut snapshot: Vec<SeriesSnapshot> = instances
            .iter()
            .map(|instance| SeriesSnapshot {
                identity: instance.identity.clone(),
                help: instance.help.clone(),
                samples: instance.samples(),
            })
            .collect();
        snapshot.sort_by(|a, b| a.identity.cmp(&b.identity));
        snapshot
    }

    /// Current value of one label assignment, if present.
    pub fn value(&self, identity: &SeriesIdentity, labels: &LabelSet) -> Option<f64> {
        let instance = self.inner.read().by_identity.get(identity).cloned()?;
        instance.get(labels)
    }

    /// Number of label assignments across all series.
    pub fn series_count(&self) -> usize {
        self.samples.load(Ordering::Acquire)
    }

    /// Number of registered series instances.
    pub fn instance_count(&self) -> usize {
        self.inner.read().by_name.len()
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        self.stats.read().clone()
    }

    fn conflict(&self, identity: &SeriesIdentity, existing: Vec<String>) -> RegistryError {
        self.stats.write().label_conflicts += 1;

        let first_report = self.reported_conflicts.lock().insert(identity.clone());
        if first_report {
            warn!(
                name = %identity.name,
                existing = ?existing,
                rejected = ?identity.label_names,
                "Metric observed with a second label set, keeping the first"
            );
        } else {
            debug!(name = %identity.name, "Rejected conflicting label set again");
        }

        RegistryError::LabelConflict {
            name: identity.name.clone(),
            existing,
            rejected: identity.label_names.clone(),
        }
    }
}

/// `{name}_{hash}` where hash is FNV-1a (32 bit) of the comma-joined label names.
pub fn qualified_name(identity: &SeriesIdentity) -> String {
    format!(
        "{}_{:08x}",
        identity.name,
        fnv1a32(identity.label_names.join(",").as_bytes())
    )
}

fn fnv1a32(bytes: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u32::from(*b)).wrapping_mul(PRIME))
}
