//! Warning detector: turns engine observations into [`Warning`] records.
//!
//! Stateless. Every rule is a separate method so the engine can trigger them
//! independently; messages are deterministic so a re-run of the same
//! observation yields the same content key.

use crate::config::{Threshold, TimingConfig};
use crate::expectation::PendingExpectation;
use crate::types::{EraId, SessionId, Severity, Warning, WarningType};

/// Where a warning is pinned in the timeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Anchor {
    pub era_id: Option<EraId>,
    pub session_id: Option<SessionId>,
    pub block_number: u64,
}

impl Anchor {
    pub fn block(block_number: u64) -> Self {
        Self {
            block_number,
            ..Self::default()
        }
    }

    pub fn era(mut self, era: Option<EraId>) -> Self {
        self.era_id = era;
        self
    }

    pub fn session(mut self, session: Option<SessionId>) -> Self {
        self.session_id = session;
        self
    }
}

/// Which timing rule a measurement belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingMetric {
    SessionReport,
    EraActivation,
    Election,
}

impl TimingMetric {
    fn unit(&self) -> &'static str {
        match self {
            Self::Election => "blocks",
            _ => "ms",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::SessionReport => "session report",
            Self::EraActivation => "era activation",
            Self::Election => "election",
        }
    }
}

impl Threshold {
    /// Severity for an observed `elapsed`, or `None` when within the limit.
    pub fn evaluate(&self, elapsed: u64) -> Option<Severity> {
        if elapsed <= self.limit {
            None
        } else if elapsed <= self.limit.saturating_add(self.soft_margin) {
            Some(Severity::Info)
        } else {
            Some(Severity::Warning)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WarningDetector {
    timing: TimingConfig,
}

impl WarningDetector {
    pub fn new(timing: TimingConfig) -> Self {
        Self { timing }
    }

    fn threshold(&self, metric: TimingMetric) -> Threshold {
        match metric {
            TimingMetric::SessionReport => self.timing.session_report_ms,
            TimingMetric::EraActivation => self.timing.era_activation_ms,
            TimingMetric::Election => self.timing.election_blocks,
        }
    }

    /// A pending expectation's deadline passed without its event.
    ///
    /// Anchored at the trigger block and the expectation's own key.
    pub fn missing_event(&self, exp: &PendingExpectation, era: Option<EraId>, now_ms: i64) -> Warning {
        let anchor = Anchor::block(exp.registered_block)
            .era(exp.key.era_id().or(era))
            .session(exp.key.session_id());
        build(
            anchor,
            WarningType::MissingEvent,
            Severity::Warning,
            format!(
                "expected {} on {} for {} before {}",
                exp.expected_event, exp.expected_chain, exp.key, exp.deadline
            ),
            now_ms,
        )
    }

    /// A tracked event contradicts the current era/session state.
    pub fn unexpected_event(&self, anchor: Anchor, message: impl Into<String>, now_ms: i64) -> Warning {
        build(anchor, WarningType::UnexpectedEvent, Severity::Error, message.into(), now_ms)
    }

    /// An explicit election failure or verifier rejection.
    pub fn election_issue(&self, anchor: Anchor, message: impl Into<String>, now_ms: i64) -> Warning {
        build(anchor, WarningType::ElectionIssue, Severity::Error, message.into(), now_ms)
    }

    /// The completion event arrived, but late. `None` when within the limit.
    ///
    /// A negative `elapsed` (completion observed before its trigger) never warns.
    pub fn timing(
        &self,
        metric: TimingMetric,
        elapsed: i64,
        anchor: Anchor,
        now_ms: i64,
    ) -> Option<Warning> {
        let elapsed = u64::try_from(elapsed).ok()?;
        let threshold = self.threshold(metric);
        let severity = threshold.evaluate(elapsed)?;
        Some(build(
            anchor,
            WarningType::Timing,
            severity,
            format!(
                "{} took {}{unit}, limit {}{unit}",
                metric.label(),
                elapsed,
                threshold.limit,
                unit = metric.unit()
            ),
            now_ms,
        ))
    }
}

fn build(anchor: Anchor, kind: WarningType, severity: Severity, message: String, now_ms: i64) -> Warning {
    Warning {
        era_id: anchor.era_id,
        session_id: anchor.session_id,
        block_number: anchor.block_number,
        kind,
        severity,
        message,
        timestamp: now_ms,
    }
}
