//! Renders the store into self-contained HTML conversation files.
//!
//! Output is regenerated from scratch on every run; the store is the source of
//! truth and the HTML is a pure projection of it. With a bucketing path
//! template one conversation can span several files, so open documents are
//! keyed by destination rather than by title.

use crate::attachments::{self, Outcome};
use crate::contacts::ContactResolver;
use crate::paths;
use crate::store::{Store, StoredMessage};
use crate::timestamp;
use chrono::NaiveDateTime;
use eyre::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const BANNER_FORMAT: &str = "%-m/%-d/%Y, %-I:%M %p";
/// A banner separates bubbles when conversation pauses longer than this.
const GAP_SECONDS: i64 = 60 * 60;

pub struct RenderOptions {
    pub out_dir: PathBuf,
    pub template: String,
    /// False when the attachment files are known to be absent, e.g. a copied
    /// database exported on another machine.
    pub attachments_available: bool,
    pub quiet: bool,
    pub verbose: bool,
}

#[derive(Default)]
pub struct RenderStats {
    pub conversations: usize,
    pub files_written: usize,
    pub attachments_copied: usize,
    pub attachments_missing: usize,
    pub attachment_errors: usize,
}

struct Doc {
    writer: BufWriter<File>,
    /// Unix time of the previous bubble, for the hour-gap banner.
    last_time: i64,
    last_participant: Option<String>,
    /// Name of the sibling attachments directory, as used in hrefs.
    dir_name: String,
}

pub fn render_store(
    store: &Store,
    resolver: &mut ContactResolver,
    opts: &RenderOptions,
) -> Result<RenderStats> {
    let titles = store.chat_titles()?;
    let mut stats = RenderStats::default();

    let pb = if opts.quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(titles.len() as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%)",
            )
            .unwrap()
            .progress_chars("=>-"),
        );
        bar.println(format!("Rendering {} conversations.", titles.len()));
        bar
    };

    for title in titles {
        render_title(store, resolver, opts, &title, &mut stats)?;
        stats.conversations += 1;
        pb.inc(1);
    }

    pb.finish_and_clear();
    Ok(stats)
}

fn render_title(
    store: &Store,
    resolver: &mut ContactResolver,
    opts: &RenderOptions,
    title: &str,
    stats: &mut RenderStats,
) -> Result<()> {
    // "A, B" is three people counting ourselves; a bare title is a one-on-one.
    let participant_count = title.matches(", ").count() + 2;
    let mut docs: HashMap<PathBuf, Doc> = HashMap::new();

    for message in store.messages_for_title(title)? {
        let when = timestamp::parse_display(&message.timestamp);
        let dest = paths::render_destination(&opts.template, title, when)?;
        let html_path = paths::html_path(&opts.out_dir, &dest);

        if !docs.contains_key(&html_path) {
            let doc = open_doc(&html_path, title, &dest)?;
            docs.insert(html_path.clone(), doc);
            stats.files_written += 1;
        }
        let doc = docs
            .get_mut(&html_path)
            .ok_or_else(|| eyre::eyre!("Document vanished: {}", html_path.display()))?;

        let this_time = when.map(|n| n.and_utc().timestamp()).unwrap_or(0);
        if this_time - doc.last_time > GAP_SECONDS {
            doc.last_participant = None;
            let banner = when
                .unwrap_or(NaiveDateTime::UNIX_EPOCH)
                .format(BANNER_FORMAT);
            writeln!(
                doc.writer,
                "\t\t\t<p class=\"timestamp\" data-timestamp=\"{}\">{}</p><br />",
                escape_html(&message.timestamp),
                banner,
            )?;
        }
        doc.last_time = this_time;

        if participant_count > 2
            && !message.is_from_me
            && message.contact != doc.last_participant
        {
            doc.last_participant = message.contact.clone();
            let nicename = resolver.resolve(message.contact.as_deref().unwrap_or(""));
            writeln!(
                doc.writer,
                "\t\t\t<p class=\"byline\">{}</p>",
                escape_html(&nicename)
            )?;
        }

        let from = if message.is_from_me {
            "self".to_string()
        } else {
            escape_html(message.contact.as_deref().unwrap_or(""))
        };
        let body = if message.is_attachment {
            attachment_body(opts, &message, &dest, &doc.dir_name, stats)
        } else {
            escape_html(message.content.as_deref().unwrap_or("").trim())
        };
        write!(
            doc.writer,
            "\t\t\t<p class=\"message\" data-from=\"{}\" data-timestamp=\"{}\">{}</p><br />\n",
            from,
            escape_html(&message.timestamp),
            body,
        )?;
    }

    for (path, mut doc) in docs {
        doc.writer.write_all(b"\t</body>\n</html>")?;
        doc.writer
            .flush()
            .wrap_err_with(|| format!("Failed to write: {}", path.display()))?;
    }
    Ok(())
}

/// Materialize the attachment and build the embed markup for it. Errors are
/// contained to the one message: the bubble becomes a note and the export
/// continues.
fn attachment_body(
    opts: &RenderOptions,
    message: &StoredMessage,
    dest: &str,
    dir_name: &str,
    stats: &mut RenderStats,
) -> String {
    let Some(source) = message.content.as_deref() else {
        stats.attachments_missing += 1;
        return "<em>Attachment unavailable</em>".to_string();
    };

    let dir = paths::attachments_dir(&opts.out_dir, dest);
    let outcome = match attachments::materialize(
        source,
        &dir,
        &message.timestamp,
        !opts.attachments_available,
    ) {
        Ok(outcome) => outcome,
        Err(err) => {
            stats.attachment_errors += 1;
            if opts.verbose {
                eprintln!("Attachment failed ({}): {:#}", source, err);
            }
            return format!(
                "<em>Attachment could not be copied: {}</em>",
                escape_html(source)
            );
        }
    };

    let name = match outcome {
        Outcome::Copied(name) => {
            stats.attachments_copied += 1;
            name
        }
        Outcome::AlreadyPresent(name) => name,
        Outcome::Missing => {
            stats.attachments_missing += 1;
            return format!("<em>Missing attachment: {}</em>", escape_html(source));
        }
    };

    let href = format!("{}/{}", escape_html(dir_name), escape_html(&name));
    let mime = message.attachment_mime_type.as_deref().unwrap_or("");
    if mime.starts_with("image") {
        format!("<img src=\"{}\" />", href)
    } else if mime.starts_with("video") {
        format!(
            "<video controls><source src=\"{}\" type=\"{}\"></video><br /><a href=\"{}\">{}</a>",
            href,
            escape_html(mime),
            href,
            escape_html(&name),
        )
    } else if mime.starts_with("audio") {
        format!(
            "<audio controls><source src=\"{}\" type=\"{}\"></audio><br /><a href=\"{}\">{}</a>",
            href,
            escape_html(mime),
            href,
            escape_html(&name),
        )
    } else {
        format!("<a href=\"{}\">{}</a>", href, escape_html(&name))
    }
}

fn open_doc(html_path: &Path, title: &str, dest: &str) -> Result<Doc> {
    if let Some(parent) = html_path.parent() {
        fs::create_dir_all(parent)
            .wrap_err_with(|| format!("Failed to create: {}", parent.display()))?;
    }
    let file = File::create(html_path)
        .wrap_err_with(|| format!("Failed to create: {}", html_path.display()))?;
    let mut writer = BufWriter::new(file);
    write!(
        writer,
        "<!doctype html>
<html>
\t<head>
\t\t<meta charset=\"UTF-8\">
\t\t<title>Conversation: {}</title>
\t\t<style type=\"text/css\">
\t\t
\t\tbody {{ font-family: \"Helvetica Neue\", sans-serif; font-size: 10pt; }}
\t\tp {{ margin: 0; clear: both; }}
\t\t.timestamp {{ text-align: center; color: #8e8e93; font-variant: small-caps; font-weight: bold; font-size: 9pt; }}
\t\t.byline {{ text-align: left; color: #8e8e93; font-size: 9pt; padding-left: 1ex; padding-top: 1ex; margin-bottom: 2px; }}
\t\timg {{ max-width: 100%; }}
\t\t.message {{ text-align: left; color: black; border-radius: 8px; background-color: #e1e1e1; padding: 6px; display: inline-block; max-width: 75%; margin-bottom: 5px; float: left; }}
\t\t.message[data-from=\"self\"] {{ text-align: right; background-color: #007aff; color: white; float: right;}}
\t\t
\t\t</style>
\t</head>
\t<body>
",
        escape_html(title)
    )?;
    Ok(Doc {
        writer,
        last_time: 0,
        last_participant: None,
        dir_name: paths::attachments_dir_name(dest),
    })
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            _ => out.push(c),
        }
    }
    out
}
