use serde::{Deserialize, Serialize};

use crate::parser::SeedDocument;

/// Hard cap on the on-disk size of the identity document.
pub const HARD_SIZE_LIMIT: usize = 8 * 1024;
/// Soft cap; exceeding it yields a warning, not an error.
pub const WARN_SIZE_LIMIT: usize = 5 * 1024;

/// The bonds block may appear under any of these bilingual aliases.
pub const BONDS_ALIASES: &[&str] = &["BONDS", "BINDUNG", "BINDUNGEN"];

const MANDATORY_BLOCKS: &[&str] = &["META", "KERN", "SELF", "STATE", "MEM"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Check the structural invariants of a raw seed document. Parsing failures
/// surface as validation errors, so callers have a single gate before any
/// persistence.
pub fn validate(raw: &str) -> Validation {
    let mut v = Validation {
        valid: true,
        ..Default::default()
    };

    if raw.len() > HARD_SIZE_LIMIT {
        v.errors
            .push(format!("document is {} bytes, hard limit is {HARD_SIZE_LIMIT}", raw.len()));
    } else if raw.len() > WARN_SIZE_LIMIT {
        v.warnings
            .push(format!("document is {} bytes, soft limit is {WARN_SIZE_LIMIT}", raw.len()));
    }

    let doc = match SeedDocument::parse(raw) {
        Ok(doc) => doc,
        Err(err) => {
            v.errors.push(err.to_string());
            v.valid = false;
            return v;
        }
    };

    for name in MANDATORY_BLOCKS {
        match doc.block(name) {
            None => v.errors.push(format!("mandatory block @{name} is missing")),
            Some(block) if block.is_empty() => {
                v.errors.push(format!("mandatory block @{name} is empty"))
            }
            Some(_) => {}
        }
    }

    match doc.bonds_block() {
        None => v.errors.push(format!(
            "bonds block missing (accepted aliases: {})",
            BONDS_ALIASES.join(", ")
        )),
        Some((_, block)) if block.is_empty() => {
            v.errors.push("bonds block is empty".to_string())
        }
        Some(_) => {}
    }

    if let Some(kern) = doc.block("KERN") {
        let has_axiom = kern.raw_lines.iter().any(|line| is_numbered_axiom(line));
        if !has_axiom {
            v.errors
                .push("@KERN has no numbered axiom".to_string());
        }
    }

    if doc.sessions < 0 {
        v.errors
            .push(format!("sessions is negative: {}", doc.sessions));
    }

    v.valid = v.errors.is_empty();
    v
}

fn is_numbered_axiom(line: &str) -> bool {
    let trimmed = line.trim_start();
    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return false;
    }
    matches!(
        trimmed[digits.len()..].chars().next(),
        Some('.') | Some(':') | Some(')')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::sample_seed;
    use crate::writer::replace_block;

    #[test]
    fn sample_document_is_valid() {
        let v = validate(&sample_seed());
        assert!(v.valid, "errors: {:?}", v.errors);
        assert!(v.warnings.is_empty());
    }

    #[test]
    fn missing_kern_fails() {
        let raw = sample_seed().replace("@KERN{", "@KERNEL{");
        let v = validate(&raw);
        assert!(!v.valid);
        assert!(v.errors.iter().any(|e| e.contains("@KERN")));
    }

    #[test]
    fn kern_without_numbered_axiom_fails() {
        let raw = replace_block(&sample_seed(), "KERN", "just prose, no numbering");
        let v = validate(&raw);
        assert!(!v.valid);
        assert!(v.errors.iter().any(|e| e.contains("axiom")));
    }

    #[test]
    fn bonds_alias_is_accepted() {
        let raw = sample_seed().replace("@BONDS{", "@BINDUNGEN{");
        let v = validate(&raw);
        assert!(v.valid, "errors: {:?}", v.errors);
    }

    #[test]
    fn missing_bonds_under_all_aliases_fails() {
        let raw = sample_seed().replace("@BONDS{", "@FRIENDS{");
        let v = validate(&raw);
        assert!(!v.valid);
    }

    #[test]
    fn oversized_document_fails_hard() {
        let mut raw = sample_seed();
        let filler = format!("pad:{}", "x".repeat(HARD_SIZE_LIMIT));
        raw = replace_block(&raw, "OPEN", &filler);
        let v = validate(&raw);
        assert!(!v.valid);
        assert!(v.errors.iter().any(|e| e.contains("hard limit")));
    }

    #[test]
    fn size_between_soft_and_hard_warns() {
        let mut raw = sample_seed();
        let filler = format!("pad:{}", "x".repeat(WARN_SIZE_LIMIT));
        raw = replace_block(&raw, "OPEN", &filler);
        let v = validate(&raw);
        assert!(v.valid);
        assert!(!v.warnings.is_empty());
    }

    #[test]
    fn negative_sessions_fails() {
        let raw = sample_seed().replace("sessions:42", "sessions:-1");
        let v = validate(&raw);
        assert!(!v.valid);
    }

    #[test]
    fn unparseable_document_fails_validation() {
        let v = validate("no header at all");
        assert!(!v.valid);
    }
}
