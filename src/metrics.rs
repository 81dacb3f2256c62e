//! Prometheus text exposition.
//!
//! Intent counters are incremented by the shims as events are recorded.
//! Everything else is owned by other components and copied into gauges at
//! scrape time.

use anyhow::{anyhow, Result};
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::time::Instant;

use crate::audit::Outcome;
use crate::capability::{CapabilityMatrix, CapabilityState};
use crate::intent::IntentKind;

pub struct Metrics {
    started: Instant,
    registry: Registry,
    intents: IntCounterVec,
    sessions: IntGaugeVec,
    pending_approvals: IntGauge,
    audit_write_failures: IntGauge,
    audit_degraded: IntGauge,
    capabilities: IntGaugeVec,
    uptime: IntGauge,
}

/// Point-in-time values owned by other components.
pub struct Gauges<'a> {
    pub active_sessions: usize,
    pub suspended_sessions: usize,
    pub terminated_sessions: usize,
    pub pending_approvals: usize,
    pub audit_write_failures: u64,
    pub audit_degraded: bool,
    pub capabilities: &'a CapabilityMatrix,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let intents = IntCounterVec::new(
            Opts::new(
                "agentgate_intents_total",
                "Intents processed by shim and outcome",
            ),
            &["shim", "outcome"],
        )?;
        registry.register(Box::new(intents.clone()))?;

        let sessions = IntGaugeVec::new(
            Opts::new("agentgate_sessions", "Sessions by lifecycle state"),
            &["state"],
        )?;
        registry.register(Box::new(sessions.clone()))?;

        let pending_approvals = IntGauge::new(
            "agentgate_pending_approvals",
            "Intents waiting for operator approval",
        )?;
        registry.register(Box::new(pending_approvals.clone()))?;

        let audit_write_failures = IntGauge::new(
            "agentgate_audit_write_failures",
            "Audit appends that failed since startup",
        )?;
        registry.register(Box::new(audit_write_failures.clone()))?;

        let audit_degraded = IntGauge::new(
            "agentgate_audit_degraded",
            "1 when the last audit append failed",
        )?;
        registry.register(Box::new(audit_degraded.clone()))?;

        let capabilities = IntGaugeVec::new(
            Opts::new(
                "agentgate_capability_supported",
                "1 when the interception primitive works",
            ),
            &["capability", "state"],
        )?;
        registry.register(Box::new(capabilities.clone()))?;

        let uptime = IntGauge::new(
            "agentgate_uptime_seconds",
            "Seconds since the daemon started",
        )?;
        registry.register(Box::new(uptime.clone()))?;

        Ok(Self {
            started: Instant::now(),
            registry,
            intents,
            sessions,
            pending_approvals,
            audit_write_failures,
            audit_degraded,
            capabilities,
            uptime,
        })
    }

    pub fn record_intent(&self, kind: IntentKind, outcome: Outcome) {
        self.intents
            .with_label_values(&[kind.as_str(), outcome.as_str()])
            .inc();
    }

    pub fn intent_count(&self, kind: IntentKind, outcome: Outcome) -> u64 {
        self.intents
            .with_label_values(&[kind.as_str(), outcome.as_str()])
            .get()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn render(&self, gauges: &Gauges<'_>) -> Result<String> {
        for (state, count) in [
            ("active", gauges.active_sessions),
            ("suspended", gauges.suspended_sessions),
            ("terminated", gauges.terminated_sessions),
        ] {
            self.sessions
                .with_label_values(&[state])
                .set(saturating_i64(count as u64));
        }
        self.pending_approvals
            .set(saturating_i64(gauges.pending_approvals as u64));
        self.audit_write_failures
            .set(saturating_i64(gauges.audit_write_failures));
        self.audit_degraded.set(i64::from(gauges.audit_degraded));

        // A refresh can move a capability to another state label.
        self.capabilities.reset();
        for (capability, status) in &gauges.capabilities.entries {
            let capability = capability.to_string();
            self.capabilities
                .with_label_values(&[capability.as_str(), status.state.as_str()])
                .set(i64::from(status.state == CapabilityState::Supported));
        }
        self.uptime.set(saturating_i64(self.uptime_secs()));

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| anyhow!("failed to encode metrics: {}", e))?;
        String::from_utf8(buffer).map_err(|e| anyhow!("failed to encode metrics: {}", e))
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_counters_and_capabilities() {
        let metrics = Metrics::new().unwrap();
        metrics.record_intent(IntentKind::Exec, Outcome::Denied);
        metrics.record_intent(IntentKind::Exec, Outcome::Denied);
        metrics.record_intent(IntentKind::NetConnect, Outcome::Allowed);
        assert_eq!(metrics.intent_count(IntentKind::Exec, Outcome::Denied), 2);

        let matrix = CapabilityMatrix::all_supported();
        let text = metrics
            .render(&Gauges {
                active_sessions: 1,
                suspended_sessions: 0,
                terminated_sessions: 2,
                pending_approvals: 0,
                audit_write_failures: 0,
                audit_degraded: false,
                capabilities: &matrix,
            })
            .unwrap();
        assert!(text.contains("# TYPE agentgate_intents_total counter"));
        assert!(text.contains("agentgate_intents_total{outcome=\"denied\",shim=\"exec\"} 2"));
        assert!(text.contains("agentgate_sessions{state=\"terminated\"} 2"));
        assert!(text.contains(
            "agentgate_capability_supported{capability=\"command_notify\",state=\"supported\"} 1"
        ));
    }
}
