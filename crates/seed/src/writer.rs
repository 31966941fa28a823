use std::path::Path;

use crate::parser::SeedError;

/// Replace the body of `@name{ … }` in `content`, appending the block when
/// it is absent. Idempotent: replacing with the same body is a fixpoint.
pub fn replace_block(content: &str, name: &str, new_body: &str) -> String {
    let body = new_body.trim_matches('\n');
    match find_block_span(content, name) {
        Some((open, close)) => {
            let mut out = String::with_capacity(content.len() + body.len());
            out.push_str(&content[..open]);
            out.push('\n');
            out.push_str(body);
            out.push('\n');
            out.push_str(&content[close..]);
            out
        }
        None => {
            let mut out = content.trim_end_matches('\n').to_string();
            out.push_str(&format!("\n@{name}{{\n{body}\n}}\n"));
            out
        }
    }
}

/// Replace several blocks in one pass over the document.
pub fn replace_blocks<'a>(
    content: &str,
    replacements: impl IntoIterator<Item = (&'a str, String)>,
) -> String {
    let mut out = content.to_string();
    for (name, body) in replacements {
        out = replace_block(&out, name, &body);
    }
    out
}

/// Patch the header's `condensed` timestamp and `sessions` counter.
pub fn update_header(content: &str, condensed: &str, sessions: i64) -> String {
    let mut out = String::with_capacity(content.len());
    let mut patched = false;
    for (i, line) in content.lines().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if !patched && line.starts_with("# SOUL SEED v") {
            let rewritten: Vec<String> = line
                .split('|')
                .map(|segment| {
                    let trimmed = segment.trim();
                    if trimmed.starts_with("condensed:") {
                        format!(" condensed:{condensed} ")
                    } else if trimmed.starts_with("sessions:") {
                        format!(" sessions:{sessions}")
                    } else {
                        segment.to_string()
                    }
                })
                .collect();
            out.push_str(rewritten.join("|").trim_end());
            patched = true;
        } else {
            out.push_str(line);
        }
    }
    if content.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Crash-safe persistence: write a `.tmp` sibling, fsync, rename over the
/// target. A crash before the rename leaves the original untouched.
pub fn atomic_write(path: &Path, content: &str) -> Result<(), SeedError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "seed".to_string());
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    let result = (|| {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        Ok::<(), std::io::Error>(())
    })();

    if let Err(err) = result {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

/// Locate the byte span of a block's body: (after `{`, before `}`).
fn find_block_span(content: &str, name: &str) -> Option<(usize, usize)> {
    let bytes = content.as_bytes();
    let needle = format!("@{name}{{");
    let mut search_from = 0;

    loop {
        let rel = content[search_from..].find(&needle)?;
        let at = search_from + rel;
        // Must start a line.
        if at > 0 && bytes[at - 1] != b'\n' {
            search_from = at + 1;
            continue;
        }
        let open = at + needle.len();
        let mut depth = 1usize;
        let mut k = open;
        while k < bytes.len() && depth > 0 {
            match bytes[k] {
                b'{' => depth += 1,
                b'}' => depth -= 1,
                _ => {}
            }
            k += 1;
        }
        if depth != 0 {
            return None;
        }
        return Some((open, k - 1));
    }
}
