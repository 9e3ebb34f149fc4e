//! Pulls conversation, message, and attachment facts out of the source
//! `chat.db`.
//!
//! The source is snapshotted to a temp file first (Messages may hold the live
//! database open) and then read with plain SELECTs mirroring its schema:
//! `chat` / `handle` / `chat_handle_join` for conversations and participants,
//! `message` / `chat_message_join` for rows, `attachment` /
//! `message_attachment_join` for files.

use crate::contacts::ContactResolver;
use crate::timestamp::{self, DisplayZone};
use chrono::NaiveDate;
use eyre::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use rusqlite::{Connection, OpenFlags, backup::Backup};
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Messages uses the object replacement character as an inline stand-in for
/// attachments; those are emitted as separate records.
const OBJECT_REPLACEMENT: char = '\u{FFFC}';

/// One message-or-attachment event, ready for the store.
#[derive(Debug, Clone)]
pub struct ExtractedRecord {
    pub chat_title: String,
    pub is_attachment: bool,
    pub attachment_mime_type: Option<String>,
    pub contact: Option<String>,
    pub is_from_me: bool,
    /// Canonical display timestamp, or the unknown-date sentinel.
    pub timestamp: String,
    /// Message text, or the attachment's source path. Null when the source
    /// lost the attachment row's filename.
    pub content: Option<String>,
    /// True when the conversation has more than one participant.
    pub is_group: bool,
    /// Set when the raw value was previously decodable under the wrong
    /// convention; the store deletes any row carrying this timestamp.
    pub legacy_timestamp: Option<String>,
}

pub enum TitleFilter {
    None,
    Substring(String),
    Pattern(Regex),
}

impl TitleFilter {
    pub fn matches(&self, title: &str) -> bool {
        match self {
            TitleFilter::None => true,
            TitleFilter::Substring(s) => title.contains(s.as_str()),
            TitleFilter::Pattern(re) => re.is_match(title),
        }
    }
}

pub struct ExtractOptions {
    pub zone: DisplayZone,
    /// Inclusive [start, stop] date range; rows outside are dropped entirely.
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    pub title_filter: TitleFilter,
    pub quiet: bool,
}

/// Copy the source database to a temp file with the SQLite backup API so a
/// live Messages session cannot race the export.
pub fn snapshot_source(db_path: &Path, quiet: bool) -> Result<NamedTempFile> {
    let spinner = if quiet {
        ProgressBar::hidden()
    } else {
        let s = ProgressBar::new_spinner();
        s.set_style(
            ProgressStyle::with_template("{spinner:.green} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        s.set_message("Snapshotting database...");
        s.enable_steady_tick(Duration::from_millis(80));
        s
    };

    let src = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .wrap_err_with(|| format!("Failed to open source database: {}", db_path.display()))?;

    let tmp = NamedTempFile::new().wrap_err("Failed to create temporary file")?;
    let mut dst =
        Connection::open(tmp.path()).wrap_err("Failed to open snapshot database connection")?;

    {
        let backup = Backup::new(&src, &mut dst).wrap_err("Failed to initialize backup")?;
        backup
            .run_to_completion(1000, Duration::from_millis(5), None)
            .wrap_err("Backup did not complete successfully")?;
    }

    drop(src);
    spinner.finish_and_clear();
    Ok(tmp)
}

/// Walk every conversation in the source and feed the resulting records to
/// `sink` in source order.
pub fn extract<F>(
    conn: &Connection,
    resolver: &mut ContactResolver,
    opts: &ExtractOptions,
    mut sink: F,
) -> Result<()>
where
    F: FnMut(ExtractedRecord) -> Result<()>,
{
    let total: u64 = conn
        .query_row("SELECT COUNT(*) FROM chat", [], |row| row.get::<_, i64>(0))
        .wrap_err("Failed to count conversations")? as u64;

    let pb = if opts.quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%)",
            )
            .unwrap()
            .progress_chars("=>-"),
        );
        bar.println(format!("Found {} conversations.", total));
        bar
    };

    let mut chats = conn
        .prepare("SELECT ROWID, guid FROM chat ORDER BY ROWID")
        .wrap_err("Failed to prepare chat query")?;
    let mut rows = chats.query([]).wrap_err("Failed to read chats")?;

    while let Some(row) = rows.next().wrap_err("Failed to read chat row")? {
        let chat_id: i64 = row.get(0)?;
        let guid: String = row.get(1)?;
        extract_chat(conn, resolver, opts, chat_id, &guid, &mut sink)?;
        pb.inc(1);
    }

    pb.finish_and_clear();
    Ok(())
}

fn extract_chat<F>(
    conn: &Connection,
    resolver: &mut ContactResolver,
    opts: &ExtractOptions,
    chat_id: i64,
    guid: &str,
    sink: &mut F,
) -> Result<()>
where
    F: FnMut(ExtractedRecord) -> Result<()>,
{
    let mut participants = Vec::new();
    let mut stmt = conn
        .prepare(
            "SELECT id FROM handle WHERE ROWID IN
                 (SELECT handle_id FROM chat_handle_join WHERE chat_id = ?1)",
        )
        .wrap_err("Failed to prepare participant query")?;
    let mut rows = stmt.query([chat_id]).wrap_err("Failed to read participants")?;
    while let Some(row) = rows.next().wrap_err("Failed to read participant row")? {
        let raw: String = row.get(0)?;
        participants.push(resolver.resolve(&raw));
    }

    let is_group = participants.len() > 1;
    participants.sort();
    let chat_title = if participants.is_empty() {
        // No resolvable participants: fall back to the trailing GUID component.
        guid.rsplit(';').next().unwrap_or(guid).to_string()
    } else {
        participants.join(", ")
    };

    if !opts.title_filter.matches(&chat_title) {
        return Ok(());
    }

    let mut stmt = conn
        .prepare(
            "SELECT
                message.ROWID,
                message.is_from_me,
                message.date,
                message.text,
                message.attributedBody,
                handle.id,
                message.cache_has_attachments
             FROM message LEFT JOIN handle ON message.handle_id = handle.ROWID
             WHERE message.ROWID IN
                 (SELECT message_id FROM chat_message_join WHERE chat_id = ?1)
             ORDER BY message.ROWID",
        )
        .wrap_err("Failed to prepare message query")?;
    let mut rows = stmt.query([chat_id]).wrap_err("Failed to read messages")?;

    while let Some(row) = rows.next().wrap_err("Failed to read message row")? {
        let message_id: i64 = row.get(0)?;
        let is_from_me: bool = row.get::<_, i64>(1)? != 0;
        let raw_date: i64 = row.get(2)?;
        let text: Option<String> = row.get(3)?;
        let body: Option<Vec<u8>> = row.get(4)?;
        let contact: Option<String> = row.get(5)?;
        let has_attachments: bool = row.get::<_, i64>(6)? != 0;

        let reconciled = timestamp::reconcile(raw_date, opts.zone);
        if let Some((start, stop)) = opts.date_range {
            match reconciled.naive {
                Some(n) if n.date() >= start && n.date() <= stop => {}
                _ => continue,
            }
        }

        let mut content = clean_text(text.as_deref().unwrap_or(""));
        if content.is_empty()
            && let Some(body) = &body
            && let Some(salvaged) = salvage_text(body)
        {
            content = salvaged;
        }

        if !content.is_empty() {
            sink(ExtractedRecord {
                chat_title: chat_title.clone(),
                is_attachment: false,
                attachment_mime_type: None,
                contact: contact.clone(),
                is_from_me,
                timestamp: reconciled.display.clone(),
                content: Some(content),
                is_group,
                legacy_timestamp: reconciled.legacy_display.clone(),
            })?;
        }

        if has_attachments {
            extract_attachments(
                conn,
                message_id,
                &chat_title,
                contact.as_deref(),
                is_from_me,
                &reconciled.display,
                reconciled.legacy_display.as_deref(),
                is_group,
                sink,
            )?;
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn extract_attachments<F>(
    conn: &Connection,
    message_id: i64,
    chat_title: &str,
    contact: Option<&str>,
    is_from_me: bool,
    timestamp: &str,
    legacy_timestamp: Option<&str>,
    is_group: bool,
    sink: &mut F,
) -> Result<()>
where
    F: FnMut(ExtractedRecord) -> Result<()>,
{
    let mut stmt = conn
        .prepare(
            "SELECT attachment.filename, attachment.mime_type
             FROM message_attachment_join
             LEFT JOIN attachment ON message_attachment_join.attachment_id = attachment.ROWID
             WHERE message_attachment_join.message_id = ?1",
        )
        .wrap_err("Failed to prepare attachment query")?;
    let mut rows = stmt.query([message_id]).wrap_err("Failed to read attachments")?;

    while let Some(row) = rows.next().wrap_err("Failed to read attachment row")? {
        let filename: Option<String> = row.get(0)?;
        let mime_type: Option<String> = row.get(1)?;
        sink(ExtractedRecord {
            chat_title: chat_title.to_string(),
            is_attachment: true,
            attachment_mime_type: mime_type,
            contact: contact.map(str::to_string),
            is_from_me,
            timestamp: timestamp.to_string(),
            content: filename,
            is_group,
            legacy_timestamp: legacy_timestamp.map(str::to_string),
        })?;
    }

    Ok(())
}

/// Strip attachment placeholders and surrounding whitespace.
pub fn clean_text(text: &str) -> String {
    text.replace(OBJECT_REPLACEMENT, "").trim().to_string()
}

/// Best-effort plain-text recovery from an `attributedBody` archive.
///
/// Stage one reads the length-prefixed string that follows the `NSString`
/// class marker in the typedstream layout. Stage two gives up on structure and
/// takes the longest printable-ASCII run, flagged as recovered. Failure of
/// both is fine — the message simply has no salvageable text.
pub fn salvage_text(payload: &[u8]) -> Option<String> {
    if let Some(text) = typedstream_string(payload) {
        return Some(text);
    }
    longest_printable_run(payload).map(|run| format!("[recovered] {}", run))
}

fn typedstream_string(payload: &[u8]) -> Option<String> {
    const MARKER: &[u8] = b"NSString";
    // Five bytes of class-chain framing sit between the marker and the length.
    const FRAMING: usize = 5;

    let pos = payload
        .windows(MARKER.len())
        .position(|w| w == MARKER)?;
    let rest = payload.get(pos + MARKER.len() + FRAMING..)?;
    let (len, rest) = match *rest.first()? {
        // 0x81 escapes to a little-endian u16 length.
        0x81 => {
            let len = u16::from_le_bytes([*rest.get(1)?, *rest.get(2)?]) as usize;
            (len, rest.get(3..)?)
        }
        byte => (byte as usize, rest.get(1..)?),
    };
    let text = std::str::from_utf8(rest.get(..len)?).ok()?.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn longest_printable_run(payload: &[u8]) -> Option<String> {
    const MIN_RUN: usize = 12;
    let mut best: &[u8] = &[];
    let mut start = None;
    for (i, &b) in payload.iter().enumerate() {
        if (b' '..=b'~').contains(&b) {
            start.get_or_insert(i);
        } else if let Some(s) = start.take()
            && i - s > best.len()
        {
            best = &payload[s..i];
        }
    }
    if let Some(s) = start
        && payload.len() - s > best.len()
    {
        best = &payload[s..];
    }
    if best.len() < MIN_RUN {
        return None;
    }
    std::str::from_utf8(best).ok().map(|s| s.trim().to_string())
}
