//! Component config patching
//!
//! Component configs use a text key-value format where the component declares
//! its identity as `name: "<string>"`. After a component is renamed, its
//! config and any file referencing it must follow.

use std::fs;
use std::path::Path;
use regex::{Captures, Regex};
use tracing::debug;

use common::error::{Error, Result};

use crate::naming::NameMapping;

/// Extension of component config files
pub const CONFIG_EXTENSION: &str = "pbtxt";

/// Returns true if the path names a component config file
pub fn is_config_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(CONFIG_EXTENSION)
}

fn name_declaration(old: &str) -> Result<Regex> {
    Regex::new(&format!(r#"(?m)^(\s*name\s*:\s*)["']{}["']"#, regex::escape(old)))
        .map_err(|e| Error::Internal(format!("Invalid name pattern for {}: {}", old, e)))
}

/// Bracket nesting level at `offset`, ignoring brackets inside quoted strings
fn depth_at(content: &str, offset: usize) -> usize {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in content[..offset].chars() {
        match quote {
            Some(_) if escaped => escaped = false,
            Some(_) if c == '\\' => escaped = true,
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => quote = Some(c),
                '{' | '[' => depth += 1,
                '}' | ']' => depth = depth.saturating_sub(1),
                _ => {}
            },
        }
    }

    depth
}

/// Rewrites the top-level `name: "<old>"` declaration of a config file to `new`
///
/// Only a declaration outside any `{}` or `[]` block is replaced, so tensor
/// or parameter names nested in the file are untouched wherever they appear.
/// Returns whether the file changed; a second call with the same pair finds
/// nothing to replace.
pub fn patch_name(path: &Path, old: &str, new: &str) -> Result<bool> {
    let content = fs::read_to_string(path)?;
    let pattern = name_declaration(old)?;

    let declaration = pattern
        .captures_iter(&content)
        .find(|caps| caps.get(0).map_or(false, |m| depth_at(&content, m.start()) == 0));

    let (range, prefix) = match declaration {
        Some(caps) => match (caps.get(0), caps.get(1)) {
            (Some(whole), Some(prefix)) => (whole.range(), prefix.as_str().to_string()),
            _ => return Ok(false),
        },
        None => return Ok(false),
    };

    let mut patched = String::with_capacity(content.len() + new.len());
    patched.push_str(&content[..range.start]);
    patched.push_str(&format!("{}\"{}\"", prefix, new));
    patched.push_str(&content[range.end..]);
    fs::write(path, patched.as_bytes())?;

    debug!("Patched name {} -> {} in {}", old, new, path.display());

    Ok(true)
}

/// Replaces every literal occurrence of `old` with `new`
///
/// Meant for files outside the config format, such as scripts. Occurrences
/// of `old` lying inside an existing `new` are skipped, so a second call with
/// the same pair is a no-op even when `new` contains `old`.
pub fn patch_all_occurrences(path: &Path, old: &str, new: &str) -> Result<bool> {
    if old.is_empty() || old == new {
        return Ok(false);
    }

    let content = fs::read_to_string(path)?;
    if !content.contains(old) {
        return Ok(false);
    }

    let done: Vec<(usize, usize)> = if new.contains(old) {
        content.match_indices(new).map(|(i, m)| (i, i + m.len())).collect()
    } else {
        Vec::new()
    };

    let mut patched = String::with_capacity(content.len());
    let mut last = 0;
    let mut replaced = 0;
    for (start, m) in content.match_indices(old) {
        let end = start + m.len();
        if done.iter().any(|&(s, e)| start < e && s < end) {
            continue;
        }
        patched.push_str(&content[last..start]);
        patched.push_str(new);
        last = end;
        replaced += 1;
    }

    if replaced == 0 {
        return Ok(false);
    }
    patched.push_str(&content[last..]);
    fs::write(path, patched.as_bytes())?;

    debug!("Replaced {} occurrences of {} with {} in {}", replaced, old, new, path.display());

    Ok(true)
}

/// Substitutes every mapping entry as a quoted token (`"old"` and `'old'`)
///
/// Quoted tokens never match inside a canonical name, which keeps repeated
/// application a no-op.
pub fn patch_references(path: &Path, mapping: &NameMapping) -> Result<bool> {
    let mut changed = false;
    for (old, new) in mapping.longest_first() {
        for quote in ['"', '\''] {
            let from = format!("{quote}{old}{quote}");
            let to = format!("{quote}{new}{quote}");
            changed |= patch_all_occurrences(path, &from, &to)?;
        }
    }
    Ok(changed)
}

/// Keys whose values name a runtime, never a component
const RESERVED_KEYS: [&str; 2] = ["platform", "backend"];

/// Substitutes mapping entries into the `key: "value"` fields of a config
///
/// A field is rewritten when its whole quoted value is an original name.
/// `platform` and `backend` fields are left alone, so a component that
/// happens to be called `ensemble` or `python` does not corrupt them.
pub fn patch_config_references(path: &Path, mapping: &NameMapping) -> Result<bool> {
    let pattern = Regex::new(r#"(?m)(\b([A-Za-z_][A-Za-z0-9_]*)\s*:\s*)(?:"([^"\n]*)"|'([^'\n]*)')"#)
        .map_err(|e| Error::Internal(format!("Invalid reference pattern: {}", e)))?;

    let content = fs::read_to_string(path)?;
    let mut changed = false;

    let patched = pattern.replace_all(&content, |caps: &Captures| {
        let (value, quote) = match (caps.get(3), caps.get(4)) {
            (Some(v), _) => (v.as_str(), '"'),
            (_, Some(v)) => (v.as_str(), '\''),
            _ => return caps[0].to_string(),
        };
        if RESERVED_KEYS.contains(&&caps[2]) {
            return caps[0].to_string();
        }
        match mapping.get(value) {
            Some(new) => {
                changed = true;
                format!("{}{quote}{new}{quote}", &caps[1])
            }
            None => caps[0].to_string(),
        }
    });

    if changed {
        fs::write(path, patched.as_bytes())?;
        debug!("Patched component references in {}", path.display());
    }

    Ok(changed)
}
