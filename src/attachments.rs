//! Copies attachment source files into a conversation's attachments directory
//! under collision-safe names.
//!
//! Target names are prefixed with the message timestamp so files exported from
//! different machines (or re-imported backups) cannot collide on basename
//! alone. A directory-valued source is zipped on the fly. Collisions are
//! resolved by content: a byte-identical file already at the target counts as
//! materialized, anything else probes `name-2.ext`, `name-3.ext`, … for a free
//! or identical slot.

use eyre::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use walkdir::WalkDir;
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

pub enum Outcome {
    /// Freshly copied under this name.
    Copied(String),
    /// An identical file was already present under this name.
    AlreadyPresent(String),
    /// Source gone and never materialized; render a placeholder.
    Missing,
}

impl Outcome {
    pub fn name(&self) -> Option<&str> {
        match self {
            Outcome::Copied(n) | Outcome::AlreadyPresent(n) => Some(n),
            Outcome::Missing => None,
        }
    }
}

/// Materialize `source` (a path as recorded in the source database, possibly
/// `~`-prefixed) into `dest_dir`. With `assume_missing` the source filesystem
/// is never consulted — used when exporting from a copied-over database on a
/// machine that does not have the attachment files.
pub fn materialize(
    source: &str,
    dest_dir: &Path,
    timestamp: &str,
    assume_missing: bool,
) -> Result<Outcome> {
    let expanded = expand_home(source);
    let mut base = basename(source);

    let meta = if assume_missing {
        None
    } else {
        fs::metadata(&expanded).ok()
    };

    let Some(meta) = meta else {
        // Deleted upstream. If an earlier run already copied it, keep that.
        let name = target_name(timestamp, &base);
        if dest_dir.join(&name).is_file() {
            return Ok(Outcome::AlreadyPresent(name));
        }
        return Ok(Outcome::Missing);
    };

    // A directory attachment becomes a zip of its contents, archived relative
    // to its parent so internal paths stay directory-relative.
    let zipped;
    let copy_source: &Path = if meta.is_dir() {
        zipped = zip_directory(&expanded)
            .wrap_err_with(|| format!("Failed to zip directory: {}", expanded.display()))?;
        base.push_str(".zip");
        zipped.path()
    } else {
        &expanded
    };

    fs::create_dir_all(dest_dir)
        .wrap_err_with(|| format!("Failed to create: {}", dest_dir.display()))?;

    let (stem, ext) = split_extension(&base);
    let mut suffix = 1usize;
    loop {
        let name = if suffix == 1 {
            target_name(timestamp, &base)
        } else {
            target_name(timestamp, &format!("{}-{}{}", stem, suffix, ext))
        };
        let candidate = dest_dir.join(&name);
        if !candidate.exists() {
            fs::copy(copy_source, &candidate).wrap_err_with(|| {
                format!("Failed to copy attachment to: {}", candidate.display())
            })?;
            return Ok(Outcome::Copied(name));
        }
        if same_content(&candidate, copy_source)? {
            prune_identical_suffixes(dest_dir, timestamp, stem, ext, suffix + 1, copy_source)?;
            return Ok(Outcome::AlreadyPresent(name));
        }
        suffix += 1;
    }
}

/// Earlier versions of this tool could copy the same attachment several times
/// under bumped suffixes. Walk the rest of the suffix sequence and delete any
/// entry that is byte-identical to the source; different files stay.
fn prune_identical_suffixes(
    dest_dir: &Path,
    timestamp: &str,
    stem: &str,
    ext: &str,
    from: usize,
    source: &Path,
) -> Result<()> {
    let mut suffix = from;
    loop {
        let name = target_name(timestamp, &format!("{}-{}{}", stem, suffix, ext));
        let candidate = dest_dir.join(&name);
        if !candidate.exists() {
            return Ok(());
        }
        if same_content(&candidate, source)? {
            fs::remove_file(&candidate)
                .wrap_err_with(|| format!("Failed to remove duplicate: {}", candidate.display()))?;
        }
        suffix += 1;
    }
}

fn target_name(timestamp: &str, base: &str) -> String {
    format!("{} - {}", timestamp, base)
}

fn basename(source: &str) -> String {
    Path::new(source)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string())
}

/// Split off the final extension, dot included. `"photo.jpg"` → `("photo", ".jpg")`,
/// `"README"` → `("README", "")`.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => (stem, &name[stem.len()..]),
        _ => (name, ""),
    }
}

pub fn expand_home(source: &str) -> PathBuf {
    if let Some(rest) = source.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(source)
}

fn same_content(a: &Path, b: &Path) -> Result<bool> {
    let (ma, mb) = (
        fs::metadata(a).wrap_err_with(|| format!("Failed to stat: {}", a.display()))?,
        fs::metadata(b).wrap_err_with(|| format!("Failed to stat: {}", b.display()))?,
    );
    if ma.len() != mb.len() {
        return Ok(false);
    }
    Ok(file_digest(a)? == file_digest(b)?)
}

fn file_digest(path: &Path) -> Result<[u8; 32]> {
    let mut file =
        File::open(path).wrap_err_with(|| format!("Failed to open: {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .wrap_err_with(|| format!("Failed to hash: {}", path.display()))?;
    Ok(hasher.finalize().into())
}

/// Zip `dir` into a temp file with entries named relative to the directory's
/// parent. Entries are walked in sorted order with a fixed modification time
/// so an unchanged directory zips to identical bytes on every run, keeping the
/// content-hash dedup effective.
fn zip_directory(dir: &Path) -> Result<NamedTempFile> {
    let tmp = NamedTempFile::new().wrap_err("Failed to create temporary zip file")?;
    let file = tmp.reopen().wrap_err("Failed to reopen temporary zip file")?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    let root = dir.parent().unwrap_or(Path::new(""));
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.wrap_err("Failed to walk directory")?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .wrap_err("Walked entry outside the archive root")?;
        let name = rel.to_string_lossy().replace('\\', "/");
        if entry.file_type().is_dir() {
            writer.add_directory(name, options)?;
        } else {
            writer.start_file(name, options)?;
            let mut f = File::open(entry.path())
                .wrap_err_with(|| format!("Failed to open: {}", entry.path().display()))?;
            io::copy(&mut f, &mut writer)
                .wrap_err_with(|| format!("Failed to archive: {}", entry.path().display()))?;
        }
    }
    writer.finish().wrap_err("Failed to finish zip archive")?;
    Ok(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: &str = "2019-06-15 12:00:00";

    fn setup() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let src_dir = tmp.path().join("src");
        let dest = tmp.path().join("dest");
        fs::create_dir_all(&src_dir).unwrap();
        fs::create_dir_all(&dest).unwrap();
        (tmp, src_dir, dest)
    }

    #[test]
    fn fresh_copy_gets_timestamp_prefix() {
        let (_tmp, src_dir, dest) = setup();
        let src = src_dir.join("photo.jpg");
        fs::write(&src, b"pixels").unwrap();

        let out = materialize(src.to_str().unwrap(), &dest, TS, false).unwrap();
        let name = out.name().unwrap().to_string();
        assert!(matches!(out, Outcome::Copied(_)));
        assert_eq!(name, format!("{} - photo.jpg", TS));
        assert_eq!(fs::read(dest.join(&name)).unwrap(), b"pixels");
    }

    #[test]
    fn identical_existing_file_is_not_recopied() {
        let (_tmp, src_dir, dest) = setup();
        let src = src_dir.join("photo.jpg");
        fs::write(&src, b"pixels").unwrap();
        fs::write(dest.join(format!("{} - photo.jpg", TS)), b"pixels").unwrap();

        let out = materialize(src.to_str().unwrap(), &dest, TS, false).unwrap();
        assert!(matches!(out, Outcome::AlreadyPresent(_)));
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 1);
    }

    #[test]
    fn different_existing_file_bumps_the_suffix() {
        let (_tmp, src_dir, dest) = setup();
        let src = src_dir.join("photo.jpg");
        fs::write(&src, b"new pixels").unwrap();
        fs::write(dest.join(format!("{} - photo.jpg", TS)), b"old pixels!").unwrap();

        let out = materialize(src.to_str().unwrap(), &dest, TS, false).unwrap();
        assert_eq!(out.name(), Some(format!("{} - photo-2.jpg", TS).as_str()));

        // A third, different file lands on -3.
        let other = src_dir.join("photo.jpg");
        fs::write(&other, b"third set!").unwrap();
        let out = materialize(other.to_str().unwrap(), &dest, TS, false).unwrap();
        assert_eq!(out.name(), Some(format!("{} - photo-3.jpg", TS).as_str()));
    }

    #[test]
    fn suffixed_identical_copy_is_reused_not_duplicated() {
        let (_tmp, src_dir, dest) = setup();
        let src = src_dir.join("photo.jpg");
        fs::write(&src, b"new pixels").unwrap();
        fs::write(dest.join(format!("{} - photo.jpg", TS)), b"old pixels!").unwrap();

        materialize(src.to_str().unwrap(), &dest, TS, false).unwrap();
        let again = materialize(src.to_str().unwrap(), &dest, TS, false).unwrap();
        assert!(matches!(again, Outcome::AlreadyPresent(_)));
        assert_eq!(again.name(), Some(format!("{} - photo-2.jpg", TS).as_str()));
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 2);
    }

    #[test]
    fn stale_duplicate_copies_are_pruned() {
        let (_tmp, src_dir, dest) = setup();
        let src = src_dir.join("photo.jpg");
        fs::write(&src, b"pixels").unwrap();
        fs::write(dest.join(format!("{} - photo.jpg", TS)), b"pixels").unwrap();
        fs::write(dest.join(format!("{} - photo-2.jpg", TS)), b"pixels").unwrap();
        fs::write(dest.join(format!("{} - photo-3.jpg", TS)), b"other!").unwrap();
        fs::write(dest.join(format!("{} - photo-4.jpg", TS)), b"pixels").unwrap();

        let out = materialize(src.to_str().unwrap(), &dest, TS, false).unwrap();
        assert_eq!(out.name(), Some(format!("{} - photo.jpg", TS).as_str()));
        assert!(!dest.join(format!("{} - photo-2.jpg", TS)).exists());
        assert!(dest.join(format!("{} - photo-3.jpg", TS)).exists());
        assert!(!dest.join(format!("{} - photo-4.jpg", TS)).exists());
    }

    #[test]
    fn missing_source_with_prior_copy_counts_as_present() {
        let (_tmp, src_dir, dest) = setup();
        let gone = src_dir.join("gone.mov");
        fs::write(dest.join(format!("{} - gone.mov", TS)), b"earlier copy").unwrap();

        let out = materialize(gone.to_str().unwrap(), &dest, TS, false).unwrap();
        assert!(matches!(out, Outcome::AlreadyPresent(_)));
    }

    #[test]
    fn missing_source_without_prior_copy_is_missing() {
        let (_tmp, src_dir, dest) = setup();
        let gone = src_dir.join("gone.mov");
        let out = materialize(gone.to_str().unwrap(), &dest, TS, false).unwrap();
        assert!(matches!(out, Outcome::Missing));
    }

    #[test]
    fn assume_missing_never_touches_the_source() {
        let (_tmp, src_dir, dest) = setup();
        let src = src_dir.join("photo.jpg");
        fs::write(&src, b"pixels").unwrap();
        let out = materialize(src.to_str().unwrap(), &dest, TS, true).unwrap();
        assert!(matches!(out, Outcome::Missing));
    }

    #[test]
    fn directory_source_is_zipped_deterministically() {
        let (_tmp, src_dir, dest) = setup();
        let bundle = src_dir.join("voicemail.bundle");
        fs::create_dir_all(bundle.join("inner")).unwrap();
        fs::write(bundle.join("a.txt"), b"alpha").unwrap();
        fs::write(bundle.join("inner/b.txt"), b"beta").unwrap();

        let first = materialize(bundle.to_str().unwrap(), &dest, TS, false).unwrap();
        assert_eq!(
            first.name(),
            Some(format!("{} - voicemail.bundle.zip", TS).as_str())
        );
        // Re-running finds the identical archive instead of copying a -2.
        let second = materialize(bundle.to_str().unwrap(), &dest, TS, false).unwrap();
        assert!(matches!(second, Outcome::AlreadyPresent(_)));
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 1);
    }

    #[test]
    fn extension_splitting() {
        assert_eq!(split_extension("photo.jpg"), ("photo", ".jpg"));
        assert_eq!(split_extension("archive.tar.gz"), ("archive.tar", ".gz"));
        assert_eq!(split_extension("README"), ("README", ""));
        assert_eq!(split_extension(".hidden"), (".hidden", ""));
    }
}
