//! Capability detection.
//!
//! The detector decides which interception primitives are usable on this
//! host by *exercising* them. A primitive that is advertised but fails when
//! used is reported as `DetectedButNonfunctional`, never as supported.
//!
//! The current matrix lives in a process-scoped [`CapabilityRegistry`]. It is
//! computed at startup and only changes through [`CapabilityRegistry::refresh`].

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub mod probes;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CommandNotify,
    FsIntercept,
    NetIntercept,
}

impl Capability {
    pub const ALL: [Capability; 3] = [
        Capability::CommandNotify,
        Capability::FsIntercept,
        Capability::NetIntercept,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::CommandNotify => "command_notify",
            Capability::FsIntercept => "fs_intercept",
            Capability::NetIntercept => "net_intercept",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityState {
    Supported,
    DetectedButNonfunctional,
    Unsupported,
}

impl CapabilityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityState::Supported => "supported",
            CapabilityState::DetectedButNonfunctional => "detected_but_nonfunctional",
            CapabilityState::Unsupported => "unsupported",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityStatus {
    pub state: CapabilityState,
    pub advertised: bool,
    pub detail: String,
}

/// Per-capability degraded flags, frozen into each session at creation.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DegradedFlags {
    pub command: bool,
    pub file: bool,
    pub network: bool,
}

impl DegradedFlags {
    pub fn for_capability(&self, capability: Capability) -> bool {
        match capability {
            Capability::CommandNotify => self.command,
            Capability::FsIntercept => self.file,
            Capability::NetIntercept => self.network,
        }
    }

    pub fn any(&self) -> bool {
        self.command || self.file || self.network
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityMatrix {
    pub computed_at_ms: u64,
    pub entries: BTreeMap<Capability, CapabilityStatus>,
}

impl CapabilityMatrix {
    /// Builds a matrix from explicit states. Missing capabilities read as unsupported.
    pub fn from_states(states: &[(Capability, CapabilityState)]) -> Self {
        let entries = states
            .iter()
            .map(|(capability, state)| {
                (
                    *capability,
                    CapabilityStatus {
                        state: *state,
                        advertised: *state != CapabilityState::Unsupported,
                        detail: "configured".to_string(),
                    },
                )
            })
            .collect();
        Self {
            computed_at_ms: crate::now_ms(),
            entries,
        }
    }

    pub fn all_supported() -> Self {
        Self::from_states(
            &Capability::ALL.map(|capability| (capability, CapabilityState::Supported)),
        )
    }

    pub fn state(&self, capability: Capability) -> CapabilityState {
        self.entries
            .get(&capability)
            .map(|status| status.state)
            .unwrap_or(CapabilityState::Unsupported)
    }

    pub fn is_supported(&self, capability: Capability) -> bool {
        self.state(capability) == CapabilityState::Supported
    }

    pub fn degraded_flags(&self) -> DegradedFlags {
        DegradedFlags {
            command: !self.is_supported(Capability::CommandNotify),
            file: !self.is_supported(Capability::FsIntercept),
            network: !self.is_supported(Capability::NetIntercept),
        }
    }
}

/// One active probe for one interception primitive.
pub trait Probe: Send + Sync {
    fn capability(&self) -> Capability;

    /// Passive check: does the host claim to provide the primitive?
    fn advertised(&self) -> bool;

    /// Exercise the primitive in a disposable context. Any resource the probe
    /// acquires must be released before this returns, on every path.
    fn exercise(&self) -> Result<String>;
}

pub struct CapabilityDetector {
    probes: Vec<Arc<dyn Probe>>,
    timeout: Duration,
}

impl CapabilityDetector {
    pub fn new(timeout: Duration) -> Self {
        Self::with_probes(probes::default_probes(timeout), timeout)
    }

    pub fn with_probes(probes: Vec<Arc<dyn Probe>>, timeout: Duration) -> Self {
        Self { probes, timeout }
    }

    /// Runs every probe. Never fails: a broken probe yields a degraded entry.
    pub fn detect(&self) -> CapabilityMatrix {
        let mut entries = BTreeMap::new();
        for probe in &self.probes {
            let status = run_probe(Arc::clone(probe), self.timeout);
            log::info!(
                "capability {}: {} ({})",
                probe.capability(),
                status.state.as_str(),
                status.detail
            );
            entries.insert(probe.capability(), status);
        }
        for capability in Capability::ALL {
            entries.entry(capability).or_insert_with(|| CapabilityStatus {
                state: CapabilityState::Unsupported,
                advertised: false,
                detail: "no probe registered".to_string(),
            });
        }
        CapabilityMatrix {
            computed_at_ms: crate::now_ms(),
            entries,
        }
    }
}

fn run_probe(probe: Arc<dyn Probe>, timeout: Duration) -> CapabilityStatus {
    let advertised = probe.advertised();
    let (tx, rx) = mpsc::channel();
    let worker = Arc::clone(&probe);
    let spawned = std::thread::Builder::new()
        .name(format!("probe-{}", probe.capability()))
        .spawn(move || {
            let _ = tx.send(worker.exercise());
        });

    let outcome = match spawned {
        Ok(_) => match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                Err(anyhow!("probe timed out after {} ms", timeout.as_millis()))
            }
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("probe aborted")),
        },
        Err(err) => Err(anyhow!("failed to start probe thread: {}", err)),
    };
    classify(advertised, outcome)
}

fn classify(advertised: bool, outcome: Result<String>) -> CapabilityStatus {
    match outcome {
        Ok(detail) => CapabilityStatus {
            state: CapabilityState::Supported,
            advertised,
            detail,
        },
        Err(err) => CapabilityStatus {
            state: if advertised {
                CapabilityState::DetectedButNonfunctional
            } else {
                CapabilityState::Unsupported
            },
            advertised,
            detail: format!("{:#}", err),
        },
    }
}

/// Daemon-wide capability state.
pub struct CapabilityRegistry {
    detector: Option<CapabilityDetector>,
    current: RwLock<Arc<CapabilityMatrix>>,
}

impl CapabilityRegistry {
    /// Detects immediately and keeps the detector for later refreshes.
    pub fn detect_with(detector: CapabilityDetector) -> Self {
        let matrix = detector.detect();
        Self {
            detector: Some(detector),
            current: RwLock::new(Arc::new(matrix)),
        }
    }

    /// A registry pinned to a known matrix; `refresh` keeps it unchanged.
    pub fn fixed(matrix: CapabilityMatrix) -> Self {
        Self {
            detector: None,
            current: RwLock::new(Arc::new(matrix)),
        }
    }

    pub fn current(&self) -> Arc<CapabilityMatrix> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    pub fn refresh(&self) -> Arc<CapabilityMatrix> {
        let Some(detector) = &self.detector else {
            return self.current();
        };
        let matrix = Arc::new(detector.detect());
        match self.current.write() {
            Ok(mut guard) => *guard = Arc::clone(&matrix),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&matrix),
        }
        matrix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProbe {
        capability: Capability,
        advertised: bool,
        works: bool,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl FakeProbe {
        fn new(capability: Capability, advertised: bool, works: bool) -> Self {
            Self {
                capability,
                advertised,
                works,
                delay: Duration::ZERO,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Probe for FakeProbe {
        fn capability(&self) -> Capability {
            self.capability
        }

        fn advertised(&self) -> bool {
            self.advertised
        }

        fn exercise(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.works {
                Ok("exercised".to_string())
            } else {
                Err(anyhow!("install rejected"))
            }
        }
    }

    #[test]
    fn advertised_but_failing_probe_is_nonfunctional() {
        let detector = CapabilityDetector::with_probes(
            vec![
                Arc::new(FakeProbe::new(Capability::CommandNotify, true, false)),
                Arc::new(FakeProbe::new(Capability::FsIntercept, false, false)),
                Arc::new(FakeProbe::new(Capability::NetIntercept, true, true)),
            ],
            Duration::from_secs(1),
        );
        let matrix = detector.detect();
        assert_eq!(
            matrix.state(Capability::CommandNotify),
            CapabilityState::DetectedButNonfunctional
        );
        assert_eq!(
            matrix.state(Capability::FsIntercept),
            CapabilityState::Unsupported
        );
        assert_eq!(
            matrix.state(Capability::NetIntercept),
            CapabilityState::Supported
        );
        let flags = matrix.degraded_flags();
        assert!(flags.command && flags.file && !flags.network);
    }

    #[test]
    fn slow_probe_times_out_without_blocking_detection() {
        let mut slow = FakeProbe::new(Capability::FsIntercept, true, true);
        slow.delay = Duration::from_millis(500);
        let detector =
            CapabilityDetector::with_probes(vec![Arc::new(slow)], Duration::from_millis(50));
        let matrix = detector.detect();
        let status = &matrix.entries[&Capability::FsIntercept];
        assert_eq!(status.state, CapabilityState::DetectedButNonfunctional);
        assert!(status.detail.contains("timed out"));
    }

    #[test]
    fn missing_probes_are_reported_unsupported() {
        let detector = CapabilityDetector::with_probes(Vec::new(), Duration::from_millis(10));
        let matrix = detector.detect();
        for capability in Capability::ALL {
            assert_eq!(matrix.state(capability), CapabilityState::Unsupported);
        }
    }

    #[test]
    fn refresh_recomputes_matrix() {
        let probe = FakeProbe::new(Capability::NetIntercept, true, true);
        let calls = Arc::clone(&probe.calls);
        let registry = CapabilityRegistry::detect_with(CapabilityDetector::with_probes(
            vec![Arc::new(probe)],
            Duration::from_secs(1),
        ));
        let first = registry.current();
        let second = registry.refresh();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&second, &registry.current()));
    }

    #[test]
    fn fixed_registry_ignores_refresh() {
        let registry = CapabilityRegistry::fixed(CapabilityMatrix::all_supported());
        let before = registry.current();
        assert!(Arc::ptr_eq(&before, &registry.refresh()));
        assert!(!before.degraded_flags().any());
    }
}
