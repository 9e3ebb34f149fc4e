//! Best-effort resolution of raw contact identifiers (phone numbers, email
//! addresses) to display names via the local AddressBook stores.
//!
//! Lookups are expensive and the books do not change mid-run, so results are
//! memoized on the resolver for the rest of the run. A missing AddressBook is
//! not an error — identities simply pass through unresolved.

use rusqlite::{Connection, OpenFlags};
use std::collections::HashMap;
use std::path::PathBuf;

pub struct ContactResolver {
    memo: HashMap<String, String>,
    books: Vec<Connection>,
}

impl ContactResolver {
    /// Open every AddressBook database reachable under the user's Library,
    /// including per-account sources. Absence of all of them is fine.
    pub fn open_default(quiet: bool) -> Self {
        let mut books = Vec::new();
        for path in default_book_paths() {
            match Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            ) {
                Ok(conn) => books.push(conn),
                Err(_) => continue,
            }
        }
        if books.is_empty() && !quiet {
            eprintln!("No address book found; contact identifiers will be shown as-is.");
        }
        ContactResolver { memo: HashMap::new(), books }
    }

    /// Resolver over explicit connections. Used by tests.
    pub fn from_connections(books: Vec<Connection>) -> Self {
        ContactResolver { memo: HashMap::new(), books }
    }

    /// Resolver with no books at all: every identity passes through.
    pub fn passthrough() -> Self {
        Self::from_connections(Vec::new())
    }

    /// Map a raw identity to a display name, falling back to the identity
    /// itself. Empty input is returned unchanged.
    pub fn resolve(&mut self, raw: &str) -> String {
        if raw.is_empty() {
            return raw.to_string();
        }
        if let Some(hit) = self.memo.get(raw) {
            return hit.clone();
        }
        let name = self
            .lookup(raw)
            .unwrap_or_else(|| raw.to_string());
        self.memo.insert(raw.to_string(), name.clone());
        name
    }

    fn lookup(&self, raw: &str) -> Option<String> {
        for book in &self.books {
            let hit = if raw.contains('@') {
                lookup_email(book, raw)
            } else {
                lookup_phone(book, raw)
            };
            if hit.is_some() {
                return hit;
            }
        }
        None
    }
}

fn default_book_paths() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    let root = home.join("Library/Application Support/AddressBook");
    let mut paths = vec![root.join("AddressBook-v22.abcddb")];
    if let Ok(entries) = std::fs::read_dir(root.join("Sources")) {
        for entry in entries.flatten() {
            paths.push(entry.path().join("AddressBook-v22.abcddb"));
        }
    }
    paths.retain(|p| p.exists());
    paths
}

fn lookup_email(book: &Connection, address: &str) -> Option<String> {
    let mut stmt = book
        .prepare(
            "SELECT ZABCDRECORD.ZFIRSTNAME, ZABCDRECORD.ZLASTNAME, ZABCDRECORD.ZORGANIZATION
             FROM ZABCDEMAILADDRESS
             LEFT JOIN ZABCDRECORD ON ZABCDEMAILADDRESS.ZOWNER = ZABCDRECORD.Z_PK
             WHERE ZABCDEMAILADDRESS.ZADDRESS = ?1",
        )
        .ok()?;
    let mut rows = stmt.query([address]).ok()?;
    while let Ok(Some(row)) = rows.next() {
        if let Some(name) = compose_name(
            row.get(0).ok().flatten(),
            row.get(1).ok().flatten(),
            row.get(2).ok().flatten(),
        ) {
            return Some(name);
        }
    }
    None
}

fn lookup_phone(book: &Connection, number: &str) -> Option<String> {
    let forms = phone_forms(number);
    let mut stmt = book
        .prepare("SELECT ZOWNER, ZFULLNUMBER FROM ZABCDPHONENUMBER")
        .ok()?;
    let mut rows = stmt.query([]).ok()?;
    while let Ok(Some(row)) = rows.next() {
        let owner: Option<i64> = row.get(0).ok().flatten();
        let full: Option<String> = row.get(1).ok().flatten();
        let (Some(owner), Some(full)) = (owner, full) else {
            continue;
        };
        if phone_forms(&full).iter().any(|f| forms.contains(f))
            && let Some(name) = record_name(book, owner)
        {
            return Some(name);
        }
    }
    None
}

fn record_name(book: &Connection, owner: i64) -> Option<String> {
    let mut stmt = book
        .prepare(
            "SELECT ZFIRSTNAME, ZLASTNAME, ZORGANIZATION FROM ZABCDRECORD WHERE Z_PK = ?1",
        )
        .ok()?;
    let mut rows = stmt.query([owner]).ok()?;
    while let Ok(Some(row)) = rows.next() {
        if let Some(name) = compose_name(
            row.get(0).ok().flatten(),
            row.get(1).ok().flatten(),
            row.get(2).ok().flatten(),
        ) {
            return Some(name);
        }
    }
    None
}

/// "First Last", with the organization appended as "First Last (Org)" or used
/// alone when there is no personal name.
fn compose_name(
    first: Option<String>,
    last: Option<String>,
    org: Option<String>,
) -> Option<String> {
    let mut name = format!(
        "{} {}",
        first.as_deref().unwrap_or(""),
        last.as_deref().unwrap_or("")
    )
    .trim()
    .to_string();
    if let Some(org) = org.filter(|o| !o.trim().is_empty()) {
        if name.is_empty() {
            name = org.trim().to_string();
        } else {
            name = format!("{} ({})", name, org.trim());
        }
    }
    (!name.is_empty()).then_some(name)
}

/// The comparison forms of a phone number: as given, digits only, and digits
/// only with a leading +1 country code stripped.
fn phone_forms(number: &str) -> Vec<String> {
    let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
    let stripped: String = number
        .strip_prefix("+1")
        .unwrap_or(number)
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    let mut forms = vec![number.to_string(), digits, stripped];
    forms.dedup();
    forms
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_book() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE ZABCDRECORD (Z_PK INTEGER PRIMARY KEY, ZFIRSTNAME TEXT, ZLASTNAME TEXT, ZORGANIZATION TEXT);
             CREATE TABLE ZABCDPHONENUMBER (ZOWNER INTEGER, ZFULLNUMBER TEXT);
             CREATE TABLE ZABCDEMAILADDRESS (ZOWNER INTEGER, ZADDRESS TEXT);
             INSERT INTO ZABCDRECORD VALUES (1, 'Alice', 'Smith', NULL);
             INSERT INTO ZABCDRECORD VALUES (2, NULL, NULL, 'Acme Corp');
             INSERT INTO ZABCDRECORD VALUES (3, 'Bob', NULL, 'Widgets Inc');
             INSERT INTO ZABCDPHONENUMBER VALUES (1, '(555) 123-4567');
             INSERT INTO ZABCDPHONENUMBER VALUES (2, '+1 555 987 6543');
             INSERT INTO ZABCDEMAILADDRESS VALUES (3, 'bob@widgets.example');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn phone_matches_across_formatting() {
        let mut r = ContactResolver::from_connections(vec![fixture_book()]);
        assert_eq!(r.resolve("+15551234567"), "Alice Smith");
        assert_eq!(r.resolve("5559876543"), "Acme Corp");
    }

    #[test]
    fn email_matches_exactly() {
        let mut r = ContactResolver::from_connections(vec![fixture_book()]);
        assert_eq!(r.resolve("bob@widgets.example"), "Bob (Widgets Inc)");
        assert_eq!(r.resolve("BOB@widgets.example"), "BOB@widgets.example");
    }

    #[test]
    fn miss_passes_through() {
        let mut r = ContactResolver::from_connections(vec![fixture_book()]);
        assert_eq!(r.resolve("+90 555 000 0000"), "+90 555 000 0000");
        assert_eq!(r.resolve(""), "");
    }

    #[test]
    fn memo_survives_book_loss() {
        let mut r = ContactResolver::from_connections(vec![fixture_book()]);
        assert_eq!(r.resolve("+15551234567"), "Alice Smith");
        r.books.clear();
        assert_eq!(r.resolve("+15551234567"), "Alice Smith");
    }

    #[test]
    fn phone_form_variants() {
        assert_eq!(
            phone_forms("+1 (555) 123-4567"),
            vec![
                "+1 (555) 123-4567".to_string(),
                "15551234567".to_string(),
                "5551234567".to_string()
            ]
        );
    }
}
