use chrono::NaiveDate;
use clap::Parser;
use eyre::{Context, Result, eyre};
use messages_archiver::config::load_file_config;
use messages_archiver::contacts::ContactResolver;
use messages_archiver::extract::{self, ExtractOptions, TitleFilter};
use messages_archiver::paths;
use messages_archiver::render::{self, RenderOptions};
use messages_archiver::store::{Reconciler, Store};
use messages_archiver::timestamp::DisplayZone;
use regex::Regex;
use rusqlite::{Connection, OpenFlags};
use std::fs;
use std::path::PathBuf;

const STORE_FILE: &str = "messages-archiver.db";

/// Archive macOS Messages conversations to browsable HTML files.
/// Safe to re-run: the archive grows incrementally and never duplicates.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory to write the archive into.
    /// Defaults to the current directory if not set in config.
    #[arg(short = 'o', long, value_name = "DIR")]
    output_directory: Option<PathBuf>,

    /// Path to the source Messages database (chat.db).
    /// Defaults to ~/Library/Messages/chat.db. Attachment files are assumed
    /// unavailable for an explicit path unless --force-attachments is given.
    #[arg(long, value_name = "PATH")]
    database: Option<PathBuf>,

    /// Path to a specific configuration file.
    /// Defaults to $XDG_CONFIG_HOME/messages-archiver/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Delete the local store and start the archive from scratch.
    #[arg(short = 'f', long)]
    flush: bool,

    /// Re-render HTML from the existing store without touching the source.
    #[arg(short = 'r', long)]
    rebuild: bool,

    /// Copy attachment files even when --database points elsewhere.
    #[arg(long)]
    force_attachments: bool,

    /// Only archive messages on or after this date (YYYY-MM-DD, inclusive).
    #[arg(long, value_name = "DATE")]
    date_start: Option<NaiveDate>,

    /// Only archive messages on or before this date (YYYY-MM-DD, inclusive).
    #[arg(long, value_name = "DATE")]
    date_stop: Option<NaiveDate>,

    /// IANA timezone for displayed timestamps (e.g. "Europe/Istanbul").
    /// Defaults to the local timezone.
    #[arg(long, value_name = "TZ")]
    timezone: Option<String>,

    /// Destination template: strftime fields plus the literal {chat_title}
    /// token, e.g. "%Y/{chat_title}" for one file per conversation per year.
    #[arg(long, value_name = "PATTERN")]
    path_template: Option<String>,

    /// Only archive conversations whose title contains this substring.
    #[arg(long = "match", value_name = "SUBSTRING", conflicts_with = "match_regex")]
    title_match: Option<String>,

    /// Only archive conversations whose title matches this regex.
    #[arg(long, value_name = "PATTERN")]
    match_regex: Option<String>,

    /// Print per-attachment failures as they happen.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress standard output (progress bars, summaries).
    #[arg(short, long)]
    quiet: bool,
}

fn default_source_path() -> Option<PathBuf> {
    dirs::home_dir().map(|d| d.join("Library/Messages/chat.db"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load config file (CLI path > default path)
    let file_cfg = load_file_config(cli.config.as_deref())?;

    // 2. Resolve everything fatal before mutating anything.
    let out_dir = cli
        .output_directory
        .or(file_cfg.output_directory)
        .unwrap_or_else(|| PathBuf::from("."));

    let zone = DisplayZone::parse(cli.timezone.as_deref().or(file_cfg.timezone.as_deref()))?;

    let template = cli
        .path_template
        .or(file_cfg.path_template)
        .unwrap_or_else(|| paths::DEFAULT_TEMPLATE.to_string());
    paths::validate_template(&template)?;

    let title_filter = if let Some(pattern) = &cli.match_regex {
        let re = Regex::new(pattern)
            .wrap_err_with(|| format!("Invalid --match-regex pattern: {:?}", pattern))?;
        TitleFilter::Pattern(re)
    } else if let Some(substring) = cli.title_match.clone() {
        TitleFilter::Substring(substring)
    } else {
        TitleFilter::None
    };

    // An explicit source lives on another machine as far as attachments are
    // concerned, unless the user says otherwise.
    let explicit_source = cli.database.is_some() || file_cfg.database.is_some();
    let attachments_available = !explicit_source || cli.force_attachments;

    let source = cli
        .database
        .or(file_cfg.database)
        .or_else(default_source_path)
        .ok_or_else(|| {
            eyre!("Could not determine the source database path.\nUse --database to specify it manually, or set database in config.toml.")
        })?;

    if !cli.rebuild && !source.exists() {
        return Err(eyre!(
            "Source database not found at: {}\nUse --database to specify the path manually.",
            source.display()
        ));
    }

    let date_range = match (cli.date_start, cli.date_stop) {
        (None, None) => None,
        (start, stop) => Some((
            start.unwrap_or(NaiveDate::MIN),
            stop.unwrap_or(NaiveDate::MAX),
        )),
    };

    // 3. Open the store.
    fs::create_dir_all(&out_dir)
        .wrap_err_with(|| format!("Failed to create: {}", out_dir.display()))?;
    let store_path = out_dir.join(STORE_FILE);
    if cli.flush && store_path.exists() {
        fs::remove_file(&store_path)
            .wrap_err_with(|| format!("Failed to flush store: {}", store_path.display()))?;
    }
    let store = Store::open(&store_path)?;
    let renamed = store.migrate_layout(&out_dir, &template)?;
    if renamed > 0 && !cli.quiet {
        println!("Layout migration renamed {} attachment files.", renamed);
    }

    let mut resolver = ContactResolver::open_default(cli.quiet);

    // 4. Sync the source into the store.
    if !cli.rebuild {
        let snapshot = extract::snapshot_source(&source, cli.quiet)?;
        let conn = Connection::open_with_flags(
            snapshot.path(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .wrap_err("Failed to open snapshot database")?;

        let opts = ExtractOptions {
            zone,
            date_range,
            title_filter,
            quiet: cli.quiet,
        };
        let mut reconciler = Reconciler::new(&store, &out_dir, &template);
        extract::extract(&conn, &mut resolver, &opts, |record| {
            reconciler.absorb(record)
        })?;

        let stats = &reconciler.stats;
        if !cli.quiet {
            println!(
                "Synced {} new messages ({} already archived, {} timestamps repaired).",
                stats.inserted, stats.skipped, stats.repaired
            );
            if stats.migrated_titles > 0 {
                println!(
                    "Migrated {} renamed conversations ({} rows).",
                    stats.migrated_titles, stats.retitled_rows
                );
            }
        }
    }

    let swept = store.dedup_sweep()?;
    if swept > 0 && !cli.quiet {
        println!("Removed {} duplicate rows.", swept);
    }

    // 5. Render the archive.
    let render_opts = RenderOptions {
        out_dir,
        template,
        attachments_available,
        quiet: cli.quiet,
        verbose: cli.verbose,
    };
    let stats = render::render_store(&store, &mut resolver, &render_opts)?;
    if !cli.quiet {
        println!(
            "Wrote {} files for {} conversations ({} attachments copied, {} missing).",
            stats.files_written,
            stats.conversations,
            stats.attachments_copied,
            stats.attachments_missing
        );
        if stats.attachment_errors > 0 {
            println!(
                "{} attachments failed to copy; re-run with --verbose for details.",
                stats.attachment_errors
            );
        }
    }

    Ok(())
}
