//! Report - Per-node outcomes of a create or destroy run

use std::collections::BTreeMap;
use std::fmt;

/// How a single resource or service ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    Created,
    Updated,
    Replaced,
    /// Inputs already matched; nothing was applied
    Unchanged,
    Destroyed,
    /// The node ran and its external call failed
    Failed(String),
    /// A declared parent is neither in the batch nor persisted
    Skipped(String),
    /// Never started because these predecessors did not succeed
    Blocked(Vec<String>),
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated | Self::Replaced | Self::Unchanged | Self::Destroyed
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Blocked(_))
    }
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Replaced => write!(f, "replaced"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Destroyed => write!(f, "destroyed"),
            Self::Failed(message) => write!(f, "failed: {}", message),
            Self::Skipped(reason) => write!(f, "skipped: {}", reason),
            Self::Blocked(predecessors) => write!(f, "blocked by {}", predecessors.join(", ")),
        }
    }
}

/// Outcome of every node touched by one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub resources: BTreeMap<String, NodeOutcome>,
    pub services: BTreeMap<String, NodeOutcome>,
}

pub type CreateReport = Report;
pub type DestroyReport = Report;

impl Report {
    /// True iff no node failed or was blocked
    pub fn is_success(&self) -> bool {
        self.resources
            .values()
            .chain(self.services.values())
            .all(|o| !o.is_failure())
    }

    pub fn resource(&self, name: &str) -> Option<&NodeOutcome> {
        self.resources.get(name)
    }

    pub fn service(&self, name: &str) -> Option<&NodeOutcome> {
        self.services.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.services.is_empty()
    }

    /// Generate a summary of the Report for display
    pub fn summary(&self) -> ReportSummary {
        let mut summary = ReportSummary::default();
        for outcome in self.resources.values().chain(self.services.values()) {
            match outcome {
                NodeOutcome::Created => summary.created += 1,
                NodeOutcome::Updated => summary.updated += 1,
                NodeOutcome::Replaced => summary.replaced += 1,
                NodeOutcome::Unchanged => summary.unchanged += 1,
                NodeOutcome::Destroyed => summary.destroyed += 1,
                NodeOutcome::Failed(_) => summary.failed += 1,
                NodeOutcome::Skipped(_) => summary.skipped += 1,
                NodeOutcome::Blocked(_) => summary.blocked += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub created: usize,
    pub updated: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub destroyed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub blocked: usize,
}

impl fmt::Display for ReportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} replaced, {} destroyed, {} failed",
            self.created, self.updated, self.replaced, self.destroyed, self.failed
        )?;
        if self.skipped > 0 {
            write!(f, ", {} skipped", self.skipped)?;
        }
        if self.blocked > 0 {
            write!(f, ", {} blocked", self.blocked)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_ignores_skipped() {
        let mut report = Report::default();
        report.resources.insert("a".into(), NodeOutcome::Created);
        report
            .resources
            .insert("c".into(), NodeOutcome::Skipped("missing parent b".into()));
        assert!(report.is_success());

        report
            .services
            .insert("api".into(), NodeOutcome::Blocked(vec!["a".into()]));
        assert!(!report.is_success());
    }

    #[test]
    fn test_summary() {
        let mut report = Report::default();
        report.resources.insert("a".into(), NodeOutcome::Destroyed);
        report
            .resources
            .insert("b".into(), NodeOutcome::Failed("boom".into()));
        report
            .resources
            .insert("c".into(), NodeOutcome::Blocked(vec!["b".into()]));

        let summary = report.summary();
        assert_eq!(summary.destroyed, 1);
        assert_eq!(
            summary.to_string(),
            "0 created, 0 updated, 0 replaced, 1 destroyed, 1 failed, 1 blocked"
        );
    }
}
