//! The durable local store and the reconciliation logic that keeps it
//! consistent across runs.
//!
//! A message's logical identity is the tuple
//! `(chat_title, contact, timestamp, content, is_from_me)`. The table carries
//! a UNIQUE constraint over it, but SQLite does not consider two NULLs equal
//! under UNIQUE, so the constraint cannot stop re-imports of rows with a NULL
//! contact or content. Uniqueness is therefore enforced here, with an
//! `IS`-comparison existence check before every insert, and a sweep afterwards
//! for anything that slipped in historically. Treat the declared constraint as
//! a hint, nothing more.
//!
//! Chat titles are recomputed from the address book on every run, so a contact
//! rename strands historical rows under the old title. The reconciler detects
//! this the first time it sees a contact in a one-on-one conversation and
//! migrates rows, the rendered HTML file, and the attachments directory over
//! to the new title. Group titles are left alone: reconciling a rename inside
//! a multi-party title is not supported.

use crate::extract::ExtractedRecord;
use crate::paths;
use crate::timestamp;
use eyre::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// Bumped when the store or the on-disk layout changes shape. Version 2
/// introduced timestamp-prefixed attachment filenames.
pub const SCHEMA_VERSION: i64 = 2;

pub struct Store {
    conn: Connection,
}

/// A message row as read back for rendering.
pub struct StoredMessage {
    pub is_attachment: bool,
    pub attachment_mime_type: Option<String>,
    pub contact: Option<String>,
    pub is_from_me: bool,
    pub timestamp: String,
    pub content: Option<String>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Store> {
        let conn = Connection::open(path)
            .wrap_err_with(|| format!("Failed to open store: {}", path.display()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                 message_id INTEGER PRIMARY KEY,
                 chat_title TEXT,
                 is_attachment INT DEFAULT 0,
                 attachment_mime_type TEXT,
                 contact TEXT,
                 is_from_me INT,
                 timestamp TEXT,
                 content TEXT,
                 UNIQUE (chat_title, contact, timestamp, content, is_from_me)
             );
             CREATE INDEX IF NOT EXISTS chat_title_index ON messages (chat_title);
             CREATE INDEX IF NOT EXISTS contact_index ON messages (contact);
             CREATE INDEX IF NOT EXISTS timestamp_index ON messages (timestamp);
             CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT);",
        )
        .wrap_err("Failed to create store schema")?;
        Ok(Store { conn })
    }

    /// Raw connection, for tests and diagnostics.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()
            .wrap_err("Failed to read schema version")?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    pub fn set_schema_version(&self, version: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
                params![version.to_string()],
            )
            .wrap_err("Failed to write schema version")?;
        Ok(())
    }

    pub fn message_count(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .wrap_err("Failed to count messages")
    }

    /// One-time migrations of previously-written data, gated on the stored
    /// version. A store that predates timestamp-prefixed attachment names gets
    /// its files renamed in place. The current version is recorded afterwards
    /// whether or not anything needed doing.
    pub fn migrate_layout(&self, out_dir: &Path, template: &str) -> Result<usize> {
        let effective = match self.schema_version()? {
            Some(v) => v,
            // Pre-versioning stores have rows but no meta entry.
            None if self.message_count()? > 0 => 1,
            None => SCHEMA_VERSION,
        };

        let mut renamed = 0usize;
        if effective < 2 {
            renamed = self.rename_bare_attachments(out_dir, template)?;
        }
        self.set_schema_version(SCHEMA_VERSION)?;
        Ok(renamed)
    }

    fn rename_bare_attachments(&self, out_dir: &Path, template: &str) -> Result<usize> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT chat_title, timestamp, content FROM messages
                 WHERE is_attachment = 1 AND content IS NOT NULL",
            )
            .wrap_err("Failed to prepare attachment listing")?;
        let mut rows = stmt.query([]).wrap_err("Failed to list attachments")?;

        let mut renamed = 0usize;
        while let Some(row) = rows.next().wrap_err("Failed to read attachment row")? {
            let title: String = row.get(0)?;
            let ts: String = row.get(1)?;
            let content: String = row.get(2)?;

            let dest = paths::render_destination(template, &title, timestamp::parse_display(&ts))?;
            let dir = paths::attachments_dir(out_dir, &dest);
            let base = Path::new(&content)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| content.clone());

            let old = dir.join(&base);
            let new = dir.join(format!("{} - {}", ts, base));
            if old.is_file() && !new.exists() {
                fs::rename(&old, &new)
                    .wrap_err_with(|| format!("Failed to rename: {}", old.display()))?;
                renamed += 1;
            }
        }
        Ok(renamed)
    }

    /// Insert unless an identical row exists, treating NULL as equal to NULL.
    /// Returns whether a row was added.
    pub fn insert_unique(&self, r: &ExtractedRecord) -> Result<bool> {
        let exists: bool = self
            .conn
            .query_row(
                "SELECT EXISTS (
                     SELECT 1 FROM messages
                     WHERE chat_title = ?1 AND contact IS ?2 AND timestamp = ?3
                       AND content IS ?4 AND is_from_me = ?5
                 )",
                params![r.chat_title, r.contact, r.timestamp, r.content, r.is_from_me],
                |row| row.get(0),
            )
            .wrap_err("Failed to check for an existing row")?;
        if exists {
            return Ok(false);
        }
        self.conn
            .execute(
                "INSERT INTO messages
                     (chat_title, is_attachment, attachment_mime_type, contact,
                      is_from_me, timestamp, content)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    r.chat_title,
                    r.is_attachment,
                    r.attachment_mime_type,
                    r.contact,
                    r.is_from_me,
                    r.timestamp,
                    r.content,
                ],
            )
            .wrap_err("Failed to insert message")?;
        Ok(true)
    }

    /// Remove a row stored under a timestamp that a previous run computed with
    /// the wrong decoding convention. The identity check misses these because
    /// the timestamp itself differs.
    pub fn delete_legacy(&self, r: &ExtractedRecord, legacy_timestamp: &str) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM messages
                 WHERE chat_title = ?1 AND contact IS ?2 AND timestamp = ?3
                   AND content IS ?4 AND is_from_me = ?5",
                params![
                    r.chat_title,
                    r.contact,
                    legacy_timestamp,
                    r.content,
                    r.is_from_me
                ],
            )
            .wrap_err("Failed to delete legacy-timestamp row")
    }

    /// Collapse groups of identity-equal rows down to one, looping until the
    /// table is clean. SQLite's GROUP BY does treat NULLs as equal, so this
    /// catches what the UNIQUE constraint could not.
    pub fn dedup_sweep(&self) -> Result<usize> {
        let mut total = 0usize;
        loop {
            let n = self
                .conn
                .execute(
                    "DELETE FROM messages WHERE message_id NOT IN (
                         SELECT MIN(message_id) FROM messages
                         GROUP BY chat_title, contact, timestamp, content, is_from_me
                     )",
                    [],
                )
                .wrap_err("Failed to sweep duplicates")?;
            total += n;
            if n == 0 {
                return Ok(total);
            }
        }
    }

    pub fn distinct_titles_for_contact(&self, contact: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT chat_title FROM messages WHERE contact = ?1")
            .wrap_err("Failed to prepare title query")?;
        let titles = stmt
            .query_map([contact], |row| row.get(0))
            .wrap_err("Failed to read titles")?
            .collect::<std::result::Result<Vec<String>, _>>()
            .wrap_err("Failed to collect titles")?;
        Ok(titles)
    }

    fn timestamps_for(&self, contact: &str, title: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT DISTINCT timestamp FROM messages
                 WHERE contact = ?1 AND chat_title = ?2",
            )
            .wrap_err("Failed to prepare timestamp query")?;
        let stamps = stmt
            .query_map(params![contact, title], |row| row.get(0))
            .wrap_err("Failed to read timestamps")?
            .collect::<std::result::Result<Vec<String>, _>>()
            .wrap_err("Failed to collect timestamps")?;
        Ok(stamps)
    }

    fn retitle(&self, contact: &str, old: &str, new: &str) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE messages SET chat_title = ?1 WHERE contact = ?2 AND chat_title = ?3",
                params![new, contact, old],
            )
            .wrap_err("Failed to retitle rows")
    }

    pub fn chat_titles(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT chat_title FROM messages GROUP BY chat_title ORDER BY chat_title ASC")
            .wrap_err("Failed to prepare title listing")?;
        let titles = stmt
            .query_map([], |row| row.get(0))
            .wrap_err("Failed to read titles")?
            .collect::<std::result::Result<Vec<String>, _>>()
            .wrap_err("Failed to collect titles")?;
        Ok(titles)
    }

    pub fn messages_for_title(&self, title: &str) -> Result<Vec<StoredMessage>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT is_attachment, attachment_mime_type, contact, is_from_me,
                        timestamp, content
                 FROM messages WHERE chat_title = ?1
                 ORDER BY timestamp ASC, message_id ASC",
            )
            .wrap_err("Failed to prepare message listing")?;
        let messages = stmt
            .query_map([title], |row| {
                Ok(StoredMessage {
                    is_attachment: row.get::<_, Option<i64>>(0)?.unwrap_or(0) != 0,
                    attachment_mime_type: row.get(1)?,
                    contact: row.get(2)?,
                    is_from_me: row.get::<_, i64>(3)? != 0,
                    timestamp: row.get(4)?,
                    content: row.get(5)?,
                })
            })
            .wrap_err("Failed to read messages")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .wrap_err("Failed to collect messages")?;
        Ok(messages)
    }
}

/// Per-contact rename-check state, tracked for one run only.
enum RenameCheck {
    Unchecked,
    Checked,
}

#[derive(Default)]
pub struct SyncStats {
    pub inserted: usize,
    pub skipped: usize,
    pub repaired: usize,
    pub retitled_rows: usize,
    pub migrated_titles: usize,
}

/// Feeds extracted records into the store, running the rename check once per
/// contact and the legacy-timestamp repair per record.
pub struct Reconciler<'a> {
    store: &'a Store,
    out_dir: PathBuf,
    template: String,
    rename_state: HashMap<String, RenameCheck>,
    pub stats: SyncStats,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a Store, out_dir: &Path, template: &str) -> Self {
        Reconciler {
            store,
            out_dir: out_dir.to_path_buf(),
            template: template.to_string(),
            rename_state: HashMap::new(),
            stats: SyncStats::default(),
        }
    }

    pub fn absorb(&mut self, record: ExtractedRecord) -> Result<()> {
        if !record.is_group
            && let Some(contact) = record.contact.clone()
        {
            let unchecked = matches!(
                self.rename_state
                    .entry(contact.clone())
                    .or_insert(RenameCheck::Unchecked),
                RenameCheck::Unchecked
            );
            if unchecked {
                self.migrate_renames(&contact, &record.chat_title)?;
                self.rename_state.insert(contact, RenameCheck::Checked);
            }
        }

        if let Some(legacy) = record.legacy_timestamp.clone() {
            self.stats.repaired += self.store.delete_legacy(&record, &legacy)?;
        }

        if self.store.insert_unique(&record)? {
            self.stats.inserted += 1;
        } else {
            self.stats.skipped += 1;
        }
        Ok(())
    }

    /// Move every row and artifact filed under a stale one-on-one title for
    /// `contact` over to `current_title`.
    fn migrate_renames(&mut self, contact: &str, current_title: &str) -> Result<()> {
        for old_title in self.store.distinct_titles_for_contact(contact)? {
            if old_title == current_title || old_title.contains(", ") {
                continue;
            }

            // Every destination the old title ever rendered into, paired with
            // where the same bucket lands under the new title.
            let mut dests: BTreeSet<(String, String)> = BTreeSet::new();
            for ts in self.store.timestamps_for(contact, &old_title)? {
                let when = timestamp::parse_display(&ts);
                dests.insert((
                    paths::render_destination(&self.template, &old_title, when)?,
                    paths::render_destination(&self.template, current_title, when)?,
                ));
            }

            for (old_dest, new_dest) in dests {
                let old_html = paths::html_path(&self.out_dir, &old_dest);
                if old_html.is_file() {
                    fs::remove_file(&old_html).wrap_err_with(|| {
                        format!("Failed to remove stale archive: {}", old_html.display())
                    })?;
                }
                move_no_clobber(
                    &paths::attachments_dir(&self.out_dir, &old_dest),
                    &paths::attachments_dir(&self.out_dir, &new_dest),
                )?;
            }

            self.stats.retitled_rows += self.store.retitle(contact, &old_title, current_title)?;
            self.stats.migrated_titles += 1;
        }
        Ok(())
    }
}

/// Move the contents of `old_dir` into `new_dir` without overwriting anything
/// already there, then remove `old_dir` if it ended up empty.
fn move_no_clobber(old_dir: &Path, new_dir: &Path) -> Result<()> {
    if !old_dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(new_dir)
        .wrap_err_with(|| format!("Failed to create: {}", new_dir.display()))?;
    for entry in
        fs::read_dir(old_dir).wrap_err_with(|| format!("Failed to read: {}", old_dir.display()))?
    {
        let entry = entry.wrap_err("Failed to read directory entry")?;
        let target = new_dir.join(entry.file_name());
        if target.exists() {
            continue;
        }
        fs::rename(entry.path(), &target)
            .wrap_err_with(|| format!("Failed to move: {}", entry.path().display()))?;
    }
    let empty = fs::read_dir(old_dir)
        .wrap_err_with(|| format!("Failed to re-read: {}", old_dir.display()))?
        .next()
        .is_none();
    if empty {
        fs::remove_dir(old_dir)
            .wrap_err_with(|| format!("Failed to remove: {}", old_dir.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        title: &str,
        contact: Option<&str>,
        ts: &str,
        content: Option<&str>,
    ) -> ExtractedRecord {
        ExtractedRecord {
            chat_title: title.to_string(),
            is_attachment: false,
            attachment_mime_type: None,
            contact: contact.map(str::to_string),
            is_from_me: false,
            timestamp: ts.to_string(),
            content: content.map(str::to_string),
            is_group: title.contains(", "),
            legacy_timestamp: None,
        }
    }

    fn open_store(dir: &Path) -> Store {
        Store::open(&dir.join("store.db")).unwrap()
    }

    #[test]
    fn insert_unique_is_idempotent_with_nulls() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());

        let r = record("Alice", None, "2019-06-15 12:00:00", None);
        assert!(store.insert_unique(&r).unwrap());
        assert!(!store.insert_unique(&r).unwrap());
        assert_eq!(store.message_count().unwrap(), 1);

        let with_contact = record("Alice", Some("+15551234567"), "2019-06-15 12:00:00", None);
        assert!(store.insert_unique(&with_contact).unwrap());
        assert_eq!(store.message_count().unwrap(), 2);
    }

    #[test]
    fn dedup_sweep_collapses_null_bearing_duplicates() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());

        // Force duplicates past the UNIQUE constraint the way a buggy old run
        // could: NULL contact makes the constraint blind.
        for _ in 0..3 {
            store
                .connection()
                .execute(
                    "INSERT INTO messages (chat_title, contact, is_from_me, timestamp, content)
                     VALUES ('Alice', NULL, 0, '2019-06-15 12:00:00', NULL)",
                    [],
                )
                .unwrap();
        }
        assert_eq!(store.message_count().unwrap(), 3);
        assert_eq!(store.dedup_sweep().unwrap(), 2);
        assert_eq!(store.message_count().unwrap(), 1);
        assert_eq!(store.dedup_sweep().unwrap(), 0);
    }

    #[test]
    fn legacy_timestamp_rows_are_repaired() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        let mut rec = Reconciler::new(&store, tmp.path(), paths::DEFAULT_TEMPLATE);

        // An old run stored this row under the wrongly-decoded timestamp.
        let stale = record("Alice", Some("+1555"), "4086-01-01 00:00:00", Some("hi"));
        store.insert_unique(&stale).unwrap();

        let mut fixed = record("Alice", Some("+1555"), "2019-06-15 12:00:00", Some("hi"));
        fixed.legacy_timestamp = Some("4086-01-01 00:00:00".to_string());
        rec.absorb(fixed).unwrap();

        assert_eq!(rec.stats.repaired, 1);
        assert_eq!(store.message_count().unwrap(), 1);
        let ts: String = store
            .connection()
            .query_row("SELECT timestamp FROM messages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(ts, "2019-06-15 12:00:00");
    }

    #[test]
    fn rename_migration_moves_rows_and_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path();
        let store = open_store(out);

        store
            .insert_unique(&record(
                "Alice",
                Some("+1555"),
                "2019-06-15 12:00:00",
                Some("old message"),
            ))
            .unwrap();
        fs::write(out.join("Alice.html"), b"stale").unwrap();
        fs::create_dir_all(out.join("Alice")).unwrap();
        fs::write(out.join("Alice/2019-06-15 12:00:00 - a.jpg"), b"img").unwrap();

        let mut rec = Reconciler::new(&store, out, paths::DEFAULT_TEMPLATE);
        rec.absorb(record(
            "Alice Smith",
            Some("+1555"),
            "2019-06-16 09:00:00",
            Some("new message"),
        ))
        .unwrap();

        assert_eq!(rec.stats.migrated_titles, 1);
        assert_eq!(rec.stats.retitled_rows, 1);
        let titles = store.chat_titles().unwrap();
        assert_eq!(titles, vec!["Alice Smith".to_string()]);
        assert!(!out.join("Alice.html").exists());
        assert!(!out.join("Alice").exists());
        assert!(
            out.join("Alice Smith/2019-06-15 12:00:00 - a.jpg")
                .is_file()
        );
    }

    #[test]
    fn rename_migration_never_clobbers_destination_files() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path();
        let store = open_store(out);

        store
            .insert_unique(&record(
                "Alice",
                Some("+1555"),
                "2019-06-15 12:00:00",
                Some("old"),
            ))
            .unwrap();
        fs::create_dir_all(out.join("Alice")).unwrap();
        fs::write(out.join("Alice/shared.jpg"), b"from old").unwrap();
        fs::create_dir_all(out.join("Alice Smith")).unwrap();
        fs::write(out.join("Alice Smith/shared.jpg"), b"already here").unwrap();

        let mut rec = Reconciler::new(&store, out, paths::DEFAULT_TEMPLATE);
        rec.absorb(record(
            "Alice Smith",
            Some("+1555"),
            "2019-06-16 09:00:00",
            Some("new"),
        ))
        .unwrap();

        // Destination kept; blocked source stays; old dir survives non-empty.
        assert_eq!(
            fs::read(out.join("Alice Smith/shared.jpg")).unwrap(),
            b"already here"
        );
        assert_eq!(fs::read(out.join("Alice/shared.jpg")).unwrap(), b"from old");
        assert!(out.join("Alice").is_dir());
    }

    #[test]
    fn group_titles_are_excluded_from_migration() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path();
        let store = open_store(out);

        store
            .insert_unique(&record(
                "Alice, Bob",
                Some("+1555"),
                "2019-06-15 12:00:00",
                Some("group history"),
            ))
            .unwrap();

        let mut rec = Reconciler::new(&store, out, paths::DEFAULT_TEMPLATE);
        rec.absorb(record(
            "Alice Smith",
            Some("+1555"),
            "2019-06-16 09:00:00",
            Some("direct message"),
        ))
        .unwrap();

        let mut titles = store.chat_titles().unwrap();
        titles.sort();
        assert_eq!(
            titles,
            vec!["Alice Smith".to_string(), "Alice, Bob".to_string()]
        );
    }

    #[test]
    fn rename_check_runs_once_per_contact() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path();
        let store = open_store(out);
        let mut rec = Reconciler::new(&store, out, paths::DEFAULT_TEMPLATE);

        rec.absorb(record(
            "Alice Smith",
            Some("+1555"),
            "2019-06-16 09:00:00",
            Some("one"),
        ))
        .unwrap();

        // A stale title appearing mid-run is not re-checked; the next run
        // catches it.
        store
            .insert_unique(&record(
                "Alice",
                Some("+1555"),
                "2019-06-15 12:00:00",
                Some("late arrival"),
            ))
            .unwrap();
        rec.absorb(record(
            "Alice Smith",
            Some("+1555"),
            "2019-06-16 10:00:00",
            Some("two"),
        ))
        .unwrap();
        assert_eq!(rec.stats.migrated_titles, 0);

        let mut rec2 = Reconciler::new(&store, out, paths::DEFAULT_TEMPLATE);
        rec2.absorb(record(
            "Alice Smith",
            Some("+1555"),
            "2019-06-16 11:00:00",
            Some("three"),
        ))
        .unwrap();
        assert_eq!(rec2.stats.migrated_titles, 1);
    }

    #[test]
    fn fresh_store_starts_at_current_version() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        store
            .migrate_layout(tmp.path(), paths::DEFAULT_TEMPLATE)
            .unwrap();
        assert_eq!(store.schema_version().unwrap(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn versionless_store_gets_attachment_names_migrated() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path();
        let store = open_store(out);

        let mut att = record(
            "Alice",
            Some("+1555"),
            "2019-06-15 12:00:00",
            Some("~/Library/Messages/Attachments/ab/photo.jpg"),
        );
        att.is_attachment = true;
        store.insert_unique(&att).unwrap();

        fs::create_dir_all(out.join("Alice")).unwrap();
        fs::write(out.join("Alice/photo.jpg"), b"img").unwrap();

        let renamed = store.migrate_layout(out, paths::DEFAULT_TEMPLATE).unwrap();
        assert_eq!(renamed, 1);
        assert!(!out.join("Alice/photo.jpg").exists());
        assert!(out.join("Alice/2019-06-15 12:00:00 - photo.jpg").is_file());
        assert_eq!(store.schema_version().unwrap(), Some(SCHEMA_VERSION));

        // Second call is a no-op: version already current.
        assert_eq!(
            store.migrate_layout(out, paths::DEFAULT_TEMPLATE).unwrap(),
            0
        );
    }

    #[test]
    fn rename_skipped_when_target_name_taken() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path();
        let store = open_store(out);

        let mut att = record("Alice", Some("+1555"), "2019-06-15 12:00:00", Some("photo.jpg"));
        att.is_attachment = true;
        store.insert_unique(&att).unwrap();

        fs::create_dir_all(out.join("Alice")).unwrap();
        fs::write(out.join("Alice/photo.jpg"), b"bare").unwrap();
        fs::write(out.join("Alice/2019-06-15 12:00:00 - photo.jpg"), b"taken").unwrap();

        assert_eq!(store.migrate_layout(out, paths::DEFAULT_TEMPLATE).unwrap(), 0);
        assert_eq!(fs::read(out.join("Alice/photo.jpg")).unwrap(), b"bare");
    }
}
