//! End-of-run accounting: counts by failure kind and a remediation hint for the dominant one.

use crate::model::{ErrorKind, ItemResult};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub by_kind: BTreeMap<ErrorKind, usize>,
    /// Failed items as `(original_index, title, kind)`, in collection order.
    pub failures: Vec<(usize, String, ErrorKind)>,
}

impl RunSummary {
    pub fn from_results(results: &[ItemResult]) -> Self {
        let mut summary = RunSummary::default();
        let mut ordered: Vec<&ItemResult> = results.iter().collect();
        ordered.sort_by_key(|r| r.original_index);
        for r in ordered {
            match r.error_kind() {
                None => summary.succeeded += 1,
                Some(kind) => {
                    summary.failed += 1;
                    *summary.by_kind.entry(kind).or_insert(0) += 1;
                    summary.failures.push((r.original_index, r.title.clone(), kind));
                }
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }

    /// The kind behind more than half of the failures, if any.
    pub fn dominant_kind(&self) -> Option<ErrorKind> {
        self.by_kind
            .iter()
            .find(|(_, count)| **count * 2 > self.failed)
            .map(|(&kind, _)| kind)
    }

    pub fn hint(&self) -> Option<&'static str> {
        self.dominant_kind().map(remediation_hint)
    }
}

/// What the user can do about a run dominated by `kind`.
pub fn remediation_hint(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::AuthOrPermission => {
            "Most items need a login or purchase. Refresh the cookie (--cookie or COLLATE_COOKIE) and check that the account has access."
        }
        ErrorKind::Timeout => {
            "Most items timed out. Raise --timeout, lower --concurrency or increase --delay."
        }
        ErrorKind::NotFound => {
            "Most items were not found. Check the collection id and --item-address-template."
        }
        ErrorKind::EmptyContent => {
            "Most items had no readable content. Check content_selectors in the config file."
        }
        ErrorKind::RenderFailure => {
            "Most items failed to render. Check that the output directory is writable and has free space."
        }
        ErrorKind::Cancelled => {
            "The run was interrupted. Run it again to fetch the remaining items."
        }
        ErrorKind::Unknown => {
            "Most items failed for unclassified reasons. Re-run with --verbose for details."
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Succeeded: {}/{}", self.succeeded, self.total())?;
        if self.failed > 0 {
            writeln!(f, "Failed:    {}", self.failed)?;
            for (kind, count) in &self.by_kind {
                writeln!(f, "  {:<20} {}", kind.to_string(), count)?;
            }
            for (index, title, kind) in &self.failures {
                writeln!(f, "  #{} {} [{}]", index + 1, title, kind)?;
            }
            if let Some(hint) = self.hint() {
                writeln!(f, "Hint: {}", hint)?;
            }
        }
        Ok(())
    }
}
