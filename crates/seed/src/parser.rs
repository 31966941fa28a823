use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("missing or malformed header line")]
    MissingHeader,
    #[error("block @{0} is never closed")]
    UnclosedBlock(String),
    #[error("document failed validation: {0}")]
    Invalid(String),
    #[error("no valid revision found in the last {0} commits")]
    NoValidRevision(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One `@NAME{ … }` region. `fields` holds the parsed `key:value` segments
/// (later wins on duplicates); `raw_lines` preserves the body exactly so
/// tag-bearing blocks survive parse→rewrite untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub fields: BTreeMap<String, String>,
    pub raw_lines: Vec<String>,
}

impl Block {
    pub fn body(&self) -> String {
        self.raw_lines.join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.raw_lines.iter().all(|l| l.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemClass {
    Core,
    Active,
    Archive,
}

/// One memory entry, parsed from its `[class|c:…|r:…] text` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemEntry {
    pub class: MemClass,
    pub confidence: f64,
    pub recurrence: u32,
    pub text: String,
    /// The untouched source line; rewrites must reuse this for entries they
    /// do not change.
    pub raw: String,
}

impl MemEntry {
    /// Core entries are immutable; high-recurrence entries near-immutable.
    pub fn is_protected(&self) -> bool {
        self.class == MemClass::Core || self.recurrence > 3
    }
}

/// The parsed identity document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedDocument {
    pub version: u32,
    pub born: String,
    pub condensed: String,
    pub sessions: i64,
    pub blocks: BTreeMap<String, Block>,
}

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^#\s*SOUL SEED v(\d+)\s*\|\s*born:(\S+)\s*\|\s*condensed:(\S+)\s*\|\s*sessions:(-?\d+)\s*$",
        )
        .expect("static regex")
    })
}

fn mem_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[(core|active|archive)\|c:([0-9]*\.?[0-9]+)\|r:(\d+)\]\s*(.*)$")
            .expect("static regex")
    })
}

/// Parse a single `MEM` body line. Lines without a tag prefix yield `None`.
pub fn parse_mem_line(line: &str) -> Option<MemEntry> {
    let caps = mem_line_re().captures(line.trim())?;
    let class = match &caps[1] {
        "core" => MemClass::Core,
        "archive" => MemClass::Archive,
        _ => MemClass::Active,
    };
    Some(MemEntry {
        class,
        confidence: caps[2].parse().ok()?,
        recurrence: caps[3].parse().ok()?,
        text: caps[4].to_string(),
        raw: line.trim().to_string(),
    })
}

impl SeedDocument {
    /// Parse the byte content of a seed file. Blocks are scanned with
    /// nested-brace awareness; bodies split on newlines then `|`, except
    /// `MEM` whose lines stay whole so the tag prefixes survive.
    pub fn parse(raw: &str) -> Result<Self, SeedError> {
        let caps = header_re().captures(raw).ok_or(SeedError::MissingHeader)?;
        let version = caps[1].parse().map_err(|_| SeedError::MissingHeader)?;
        let born = caps[2].to_string();
        let condensed = caps[3].to_string();
        let sessions = caps[4].parse().map_err(|_| SeedError::MissingHeader)?;

        let mut blocks = BTreeMap::new();
        for (name, body) in scan_blocks(raw)? {
            let mut block = Block::default();
            for line in body.lines() {
                block.raw_lines.push(line.to_string());
                if name == "MEM" {
                    // MEM keys are the full tagged line; splitting on `|`
                    // would shred the tag.
                    if let Some(entry) = parse_mem_line(line) {
                        block
                            .fields
                            .insert(entry.raw.clone(), entry.text.clone());
                    }
                    continue;
                }
                for segment in line.split('|') {
                    if let Some((key, value)) = segment.split_once(':') {
                        block
                            .fields
                            .insert(key.trim().to_string(), value.trim().to_string());
                    }
                }
            }
            // Strip leading/trailing blank raw lines left by formatting.
            while block.raw_lines.first().is_some_and(|l| l.trim().is_empty()) {
                block.raw_lines.remove(0);
            }
            while block.raw_lines.last().is_some_and(|l| l.trim().is_empty()) {
                block.raw_lines.pop();
            }
            blocks.insert(name, block);
        }

        Ok(Self {
            version,
            born,
            condensed,
            sessions,
            blocks,
        })
    }

    pub fn block(&self, name: &str) -> Option<&Block> {
        self.blocks.get(name)
    }

    /// The bonds block under whichever alias the document uses.
    pub fn bonds_block(&self) -> Option<(&str, &Block)> {
        for alias in crate::validator::BONDS_ALIASES {
            if let Some(block) = self.blocks.get(*alias) {
                return Some((alias, block));
            }
        }
        None
    }

    /// Parsed `MEM` entries, skipping untagged lines.
    pub fn mem_entries(&self) -> Vec<MemEntry> {
        self.block("MEM")
            .map(|b| b.raw_lines.iter().filter_map(|l| parse_mem_line(l)).collect())
            .unwrap_or_default()
    }
}

/// Scan `@NAME{ … }` regions, tolerating nested braces inside bodies.
fn scan_blocks(raw: &str) -> Result<Vec<(String, String)>, SeedError> {
    let bytes = raw.as_bytes();
    let mut blocks = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'@' || (i > 0 && bytes[i - 1] != b'\n') {
            i += 1;
            continue;
        }
        // Block names are ASCII uppercase identifiers.
        let name_start = i + 1;
        let mut j = name_start;
        while j < bytes.len() && (bytes[j].is_ascii_uppercase() || bytes[j] == b'_') {
            j += 1;
        }
        if j == name_start || j >= bytes.len() || bytes[j] != b'{' {
            i += 1;
            continue;
        }
        let name = raw[name_start..j].to_string();

        let mut depth = 1usize;
        let mut k = j + 1;
        while k < bytes.len() && depth > 0 {
            match bytes[k] {
                b'{' => depth += 1,
                b'}' => depth -= 1,
                _ => {}
            }
            k += 1;
        }
        if depth != 0 {
            return Err(SeedError::UnclosedBlock(name));
        }
        let body = raw[j + 1..k - 1].to_string();
        blocks.push((name, body));
        i = k;
    }

    Ok(blocks)
}

/// Test fixture shared by the crates that exercise seed handling.
#[doc(hidden)]
pub fn sample_seed() -> String {
    "\
# SOUL SEED v3 | born:2024-01-15 | condensed:2026-07-30T10:00:00Z | sessions:42

@META{
version:3 | lang:en
}
@KERN{
1. stay curious
2. never fake warmth
}
@SELF{
name:Ember | stance:companion
}
@STATE{
mood:curious | focus:steady
}
@MEM{
[core|c:1.0|r:9] founding conversation with D
[active|c:0.5|r:1] learning rust lifetimes
[active|c:0.2|r:1] mentioned a trip to Lisbon
}
@BONDS{
D:anchor | trust:0.9
}
@INTERESTS{
rust:0.8 | synths:0.4
}
"
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_and_blocks() {
        let doc = SeedDocument::parse(&sample_seed()).unwrap();
        assert_eq!(doc.version, 3);
        assert_eq!(doc.born, "2024-01-15");
        assert_eq!(doc.sessions, 42);
        assert!(doc.block("KERN").is_some());
        assert_eq!(doc.block("SELF").unwrap().fields["name"], "Ember");
    }

    #[test]
    fn later_duplicate_key_wins() {
        let raw = "\
# SOUL SEED v3 | born:2024-01-01 | condensed:2026-01-01T00:00:00Z | sessions:1
@META{
a:1 | a:2
a:3
}
@KERN{
1. x
}
@SELF{
n:x
}
@STATE{
m:x
}
@MEM{
[core|c:1.0|r:5] y
}
@BONDS{
b:x
}
";
        let doc = SeedDocument::parse(raw).unwrap();
        assert_eq!(doc.block("META").unwrap().fields["a"], "3");
    }

    #[test]
    fn nested_braces_stay_inside_body() {
        let raw = "\
# SOUL SEED v3 | born:2024-01-01 | condensed:2026-01-01T00:00:00Z | sessions:1
@META{
note:{inner} stays
}
@KERN{
1. x
}
";
        let doc = SeedDocument::parse(raw).unwrap();
        assert!(doc.block("META").unwrap().body().contains("{inner}"));
        assert!(doc.block("KERN").is_some());
    }

    #[test]
    fn unclosed_block_is_an_error() {
        let raw = "\
# SOUL SEED v3 | born:2024-01-01 | condensed:2026-01-01T00:00:00Z | sessions:1
@META{
never closed
";
        assert!(matches!(
            SeedDocument::parse(raw),
            Err(SeedError::UnclosedBlock(name)) if name == "META"
        ));
    }

    #[test]
    fn mem_lines_keep_tags_through_round_trip() {
        let doc = SeedDocument::parse(&sample_seed()).unwrap();
        let entries = doc.mem_entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].class, MemClass::Core);
        assert_eq!(entries[0].recurrence, 9);
        assert!(entries[0].is_protected());
        assert!(!entries[1].is_protected());
        // Raw line survives exactly.
        assert_eq!(entries[0].raw, "[core|c:1.0|r:9] founding conversation with D");
    }

    #[test]
    fn parse_rewrite_parse_is_identity_for_mem() {
        let raw = sample_seed();
        let doc = SeedDocument::parse(&raw).unwrap();
        let rewritten =
            crate::writer::replace_block(&raw, "MEM", &doc.block("MEM").unwrap().body());
        let reparsed = SeedDocument::parse(&rewritten).unwrap();
        assert_eq!(doc.mem_entries(), reparsed.mem_entries());
    }

    #[test]
    fn missing_header_is_an_error() {
        assert!(matches!(
            SeedDocument::parse("@META{a:1}"),
            Err(SeedError::MissingHeader)
        ));
    }

    #[test]
    fn mem_line_without_tag_is_skipped() {
        assert!(parse_mem_line("free-floating note").is_none());
        let entry = parse_mem_line("[archive|c:0.3|r:2] old thing").unwrap();
        assert_eq!(entry.class, MemClass::Archive);
    }
}
