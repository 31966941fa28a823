use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{info, warn};

use crate::parser::SeedError;
use crate::validator::validate;
use crate::writer::atomic_write;

/// Document format version this build reads and writes.
pub const CURRENT_VERSION: u32 = 3;

#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    pub migrated: bool,
    pub from: u32,
    pub to: u32,
    pub backups: Vec<PathBuf>,
}

type Step = fn(&str) -> Result<String, SeedError>;

/// Stepwise `vN → vN+1` transforms, indexed by source version.
fn steps() -> &'static [(u32, Step)] {
    &[(1, migrate_v1_to_v2), (2, migrate_v2_to_v3)]
}

fn loose_version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#\s*SOUL SEED v(\d+)").expect("static regex"))
}

/// Detect the document version without requiring the current header shape;
/// older versions predate some header fields.
pub fn detect_version(raw: &str) -> Option<u32> {
    loose_version_re()
        .captures(raw)
        .and_then(|caps| caps[1].parse().ok())
}

/// Migrate the on-disk document up to [`CURRENT_VERSION`] when it is behind.
///
/// A sibling backup (`SEED.md.vN.bak`) is written before each step. If the
/// fully migrated document fails validation the original content is restored
/// and an error returned.
pub fn migrate_if_needed(path: &Path) -> Result<MigrationReport, SeedError> {
    let original = std::fs::read_to_string(path)?;
    let from = detect_version(&original).ok_or(SeedError::MissingHeader)?;

    if from >= CURRENT_VERSION {
        return Ok(MigrationReport {
            migrated: false,
            from,
            to: from,
            ..Default::default()
        });
    }

    let mut report = MigrationReport {
        migrated: true,
        from,
        to: CURRENT_VERSION,
        backups: Vec::new(),
    };
    let mut content = original.clone();
    let mut version = from;

    while version < CURRENT_VERSION {
        let Some((_, step)) = steps().iter().find(|(v, _)| *v == version) else {
            return Err(SeedError::Invalid(format!(
                "no migration registered for v{version}"
            )));
        };

        let backup = path.with_file_name(format!(
            "{}.v{version}.bak",
            path.file_name().map(|f| f.to_string_lossy()).unwrap_or_default()
        ));
        std::fs::write(&backup, &content)?;
        report.backups.push(backup);

        content = step(&content)?;
        version += 1;
        info!(from = version - 1, to = version, "[seed] migrated one step");
    }

    let validation = validate(&content);
    if !validation.valid {
        warn!(errors = ?validation.errors, "[seed] migrated document invalid, rolling back");
        atomic_write(path, &original)?;
        return Err(SeedError::Invalid(validation.errors.join("; ")));
    }

    atomic_write(path, &content)?;
    Ok(report)
}

/// v1 headers carried no session counter.
fn migrate_v1_to_v2(raw: &str) -> Result<String, SeedError> {
    let mut out = String::with_capacity(raw.len() + 16);
    for (i, line) in raw.lines().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if line.starts_with("# SOUL SEED v1") {
            let mut patched = line.replace("# SOUL SEED v1", "# SOUL SEED v2");
            if !patched.contains("sessions:") {
                patched.push_str(" | sessions:0");
            }
            out.push_str(&patched);
        } else {
            out.push_str(line);
        }
    }
    if raw.ends_with('\n') {
        out.push('\n');
    }
    Ok(out)
}

/// v2 used `@MEMORY` for what is now the tagged `@MEM` block.
fn migrate_v2_to_v3(raw: &str) -> Result<String, SeedError> {
    Ok(raw
        .replace("# SOUL SEED v2", "# SOUL SEED v3")
        .replace("\n@MEMORY{", "\n@MEM{"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::SeedDocument;

    fn v1_seed() -> String {
        "\
# SOUL SEED v1 | born:2024-01-15 | condensed:2026-07-30T10:00:00Z

@META{
version:1
}
@KERN{
1. stay curious
}
@SELF{
name:Ember
}
@STATE{
mood:calm
}
@MEMORY{
[core|c:1.0|r:9] founding conversation
}
@BONDS{
D:anchor
}
"
        .to_string()
    }

    #[test]
    fn v1_migrates_stepwise_to_current() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SEED.md");
        std::fs::write(&path, v1_seed()).unwrap();

        let report = migrate_if_needed(&path).unwrap();
        assert!(report.migrated);
        assert_eq!(report.from, 1);
        assert_eq!(report.to, CURRENT_VERSION);
        assert_eq!(report.backups.len(), 2);
        for backup in &report.backups {
            assert!(backup.exists());
        }

        let raw = std::fs::read_to_string(&path).unwrap();
        let doc = SeedDocument::parse(&raw).unwrap();
        assert_eq!(doc.version, CURRENT_VERSION);
        assert_eq!(doc.sessions, 0);
        assert!(doc.block("MEM").is_some());
        assert!(doc.block("MEMORY").is_none());
    }

    #[test]
    fn current_version_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SEED.md");
        std::fs::write(&path, crate::parser::sample_seed()).unwrap();

        let report = migrate_if_needed(&path).unwrap();
        assert!(!report.migrated);
        assert!(report.backups.is_empty());
    }

    #[test]
    fn invalid_migration_result_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SEED.md");
        // v1 document whose KERN is missing: migration completes but the
        // result cannot validate, so the original must survive.
        let broken = v1_seed().replace("@KERN{", "@KERNL{");
        std::fs::write(&path, &broken).unwrap();

        let err = migrate_if_needed(&path);
        assert!(err.is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), broken);
    }

    #[test]
    fn detect_version_is_tolerant() {
        assert_eq!(detect_version("# SOUL SEED v2 | born:x"), Some(2));
        assert_eq!(detect_version("no header"), None);
    }
}
