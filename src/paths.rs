//! Derived filesystem identity for rendered conversations.
//!
//! The destination of a message is a template string containing strftime
//! fields and the literal `{chat_title}` token, e.g. `%Y/{chat_title}` for one
//! file per year per conversation. The template is formatted with the
//! message's display time *first* and the token substituted *after*, so `%`
//! characters inside contact names are inert.
//!
//! Nothing here is persisted: paths are recomputed from the chat title on
//! every access, which is what makes rename migration possible at all.

use chrono::NaiveDateTime;
use eyre::{Result, eyre};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

pub const TITLE_TOKEN: &str = "{chat_title}";
pub const DEFAULT_TEMPLATE: &str = "{chat_title}";

/// Most filesystems cap a single name component at 255 bytes.
const MAX_NAME_BYTES: usize = 255;

/// Render the destination (relative to the output directory) for a message at
/// `when` in the conversation `title`. Unknown-date messages bucket at time zero.
pub fn render_destination(
    template: &str,
    title: &str,
    when: Option<NaiveDateTime>,
) -> Result<String> {
    let when = when.unwrap_or(NaiveDateTime::UNIX_EPOCH);
    let mut formatted = String::new();
    write!(formatted, "{}", when.format(template))
        .map_err(|_| eyre!("Invalid path template: {:?}", template))?;
    // Slashes inside a title would turn into spurious directories.
    Ok(formatted.replace(TITLE_TOKEN, &title.replace('/', "-")))
}

/// Fail early on templates chrono cannot format, before anything is written.
pub fn validate_template(template: &str) -> Result<()> {
    render_destination(template, "probe", None).map(|_| ())
}

pub fn html_path(out_dir: &Path, dest: &str) -> PathBuf {
    join_clamped(out_dir, dest, ".html")
}

pub fn attachments_dir(out_dir: &Path, dest: &str) -> PathBuf {
    join_clamped(out_dir, dest, "")
}

/// The final name component of the attachments directory, as used in hrefs
/// relative to the HTML file.
pub fn attachments_dir_name(dest: &str) -> String {
    clamp_component(final_component(dest), "")
}

fn final_component(dest: &str) -> &str {
    dest.rsplit('/').find(|p| !p.is_empty()).unwrap_or("untitled")
}

fn join_clamped(out_dir: &Path, dest: &str, ext: &str) -> PathBuf {
    let mut path = out_dir.to_path_buf();
    let components: Vec<&str> = dest
        .split('/')
        .filter(|p| !p.is_empty() && *p != "." && *p != "..")
        .collect();
    for dir in &components[..components.len().saturating_sub(1)] {
        path.push(dir);
    }
    path.push(clamp_component(final_component(dest), ext));
    path
}

/// Fit `name` + `ext` into the 255-byte component budget. Over-length names
/// are truncated word by word and tagged with a hash of the full name, so two
/// long titles sharing a prefix still derive distinct files.
fn clamp_component(name: &str, ext: &str) -> String {
    if name.len() + ext.len() <= MAX_NAME_BYTES {
        return format!("{}{}", name, ext);
    }

    let tag = hash_tag(name);
    let budget = MAX_NAME_BYTES.saturating_sub(ext.len() + tag.len());

    let mut stem = name;
    while stem.len() > budget {
        match stem.rfind(char::is_whitespace) {
            Some(i) => stem = stem[..i].trim_end(),
            None => break,
        }
    }
    let mut stem = stem.to_string();
    if stem.len() > budget {
        // One unbroken word: cut at a char boundary.
        let mut end = budget;
        while end > 0 && !stem.is_char_boundary(end) {
            end -= 1;
        }
        stem.truncate(end);
    }
    format!("{}{}{}", stem, tag, ext)
}

fn hash_tag(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let mut hex = String::with_capacity(8);
    for byte in &digest[..4] {
        let _ = write!(hex, "{:02x}", byte);
    }
    format!(" [#{}]", hex)
}
