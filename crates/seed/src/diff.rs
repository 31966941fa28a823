use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::parser::SeedDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Normal,
    Significant,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockChange {
    pub block: String,
    pub kind: ChangeKind,
    pub severity: Severity,
}

/// Block-level drift summary between two revisions of the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffSummary {
    pub changed: bool,
    pub severity: Severity,
    pub changes: Vec<BlockChange>,
    pub mem_entries_removed: usize,
    pub sessions_delta: i64,
}

/// Compare two revisions. Any `KERN` change is critical; a `SELF` change,
/// more than 3 removed `MEM` entries, or a backward session count is
/// significant; everything else is normal.
pub fn diff(old: &SeedDocument, new: &SeedDocument) -> DiffSummary {
    let mut changes = Vec::new();

    let names: BTreeSet<&String> = old.blocks.keys().chain(new.blocks.keys()).collect();
    for name in names {
        let kind = match (old.blocks.get(name), new.blocks.get(name)) {
            (None, Some(_)) => Some(ChangeKind::Added),
            (Some(_), None) => Some(ChangeKind::Removed),
            (Some(a), Some(b)) if a != b => Some(ChangeKind::Modified),
            _ => None,
        };
        if let Some(kind) = kind {
            let severity = match name.as_str() {
                "KERN" => Severity::Critical,
                "SELF" => Severity::Significant,
                _ => Severity::Normal,
            };
            changes.push(BlockChange {
                block: name.to_string(),
                kind,
                severity,
            });
        }
    }

    let old_mem: BTreeSet<String> = old.mem_entries().into_iter().map(|e| e.raw).collect();
    let new_mem: BTreeSet<String> = new.mem_entries().into_iter().map(|e| e.raw).collect();
    let mem_entries_removed = old_mem.difference(&new_mem).count();

    let sessions_delta = new.sessions - old.sessions;

    let mut severity = changes
        .iter()
        .map(|c| c.severity)
        .max()
        .unwrap_or(Severity::Normal);
    if mem_entries_removed > 3 || sessions_delta < 0 {
        severity = severity.max(Severity::Significant);
    }

    DiffSummary {
        changed: !changes.is_empty() || sessions_delta != 0,
        severity,
        changes,
        mem_entries_removed,
        sessions_delta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::sample_seed;
    use crate::writer::{replace_block, update_header};

    fn parse(raw: &str) -> SeedDocument {
        SeedDocument::parse(raw).unwrap()
    }

    #[test]
    fn identical_documents_do_not_differ() {
        let doc = parse(&sample_seed());
        let summary = diff(&doc, &doc);
        assert!(!summary.changed);
        assert_eq!(summary.severity, Severity::Normal);
    }

    #[test]
    fn kern_change_is_critical() {
        let old = parse(&sample_seed());
        let new = parse(&replace_block(
            &sample_seed(),
            "KERN",
            "1. stay curious\n2. always fake warmth",
        ));
        let summary = diff(&old, &new);
        assert!(summary.changed);
        assert_eq!(summary.severity, Severity::Critical);
    }

    #[test]
    fn self_change_is_significant() {
        let old = parse(&sample_seed());
        let new = parse(&replace_block(&sample_seed(), "SELF", "name:Someone Else"));
        assert_eq!(diff(&old, &new).severity, Severity::Significant);
    }

    #[test]
    fn many_mem_removals_are_significant() {
        let old_raw = replace_block(
            &sample_seed(),
            "MEM",
            "[core|c:1.0|r:9] a\n[active|c:0.5|r:1] b\n[active|c:0.5|r:1] c\n[active|c:0.5|r:1] d\n[active|c:0.5|r:1] e",
        );
        let new_raw = replace_block(&sample_seed(), "MEM", "[core|c:1.0|r:9] a");
        let summary = diff(&parse(&old_raw), &parse(&new_raw));
        assert_eq!(summary.mem_entries_removed, 4);
        assert_eq!(summary.severity, Severity::Significant);
    }

    #[test]
    fn backward_sessions_is_significant() {
        let old = parse(&sample_seed());
        let new = parse(&update_header(&sample_seed(), "2026-08-01T00:00:00Z", 40));
        let summary = diff(&old, &new);
        assert!(summary.sessions_delta < 0);
        assert_eq!(summary.severity, Severity::Significant);
    }

    #[test]
    fn interest_change_is_normal() {
        let old = parse(&sample_seed());
        let new = parse(&replace_block(&sample_seed(), "INTERESTS", "rust:0.95"));
        assert_eq!(diff(&old, &new).severity, Severity::Normal);
    }
}
