//! Directory to zip archive builder.
//!
//! Every regular file below the source root is stored under its path relative
//! to the root, deflate-compressed. Symlinks to files are followed, symlinks to
//! directories are not descended, and a dangling symlink fails the build.
//! A failed build never leaves a partial archive behind.

use chrono::{DateTime, Utc};
use common::{JobId, ARCHIVE_EXTENSION};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Source path does not exist: {}", .0.display())]
    SourceNotFound(PathBuf),
    #[error("Source path is not a directory: {}", .0.display())]
    SourceNotADirectory(PathBuf),
    #[error("Error while creating backup {}: {source}", .path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// `job_{id}_{YYYYMMDD_HHMMSS}.zip` inside `destination_dir`, UTC, second resolution.
pub fn backup_filename(job_id: JobId, destination_dir: &Path, now: DateTime<Utc>) -> PathBuf {
    destination_dir.join(format!(
        "job_{}_{}.{}",
        job_id,
        now.format("%Y%m%d_%H%M%S"),
        ARCHIVE_EXTENSION
    ))
}

/// Archives `source` into `destination`, returning a message naming the file.
pub fn build_archive(source: &Path, destination: &Path) -> Result<String, ArchiveError> {
    if !source.exists() {
        return Err(ArchiveError::SourceNotFound(source.to_path_buf()));
    }
    if !source.is_dir() {
        return Err(ArchiveError::SourceNotADirectory(source.to_path_buf()));
    }

    let write_failure = |source: io::Error| ArchiveError::WriteFailure {
        path: destination.to_path_buf(),
        source,
    };

    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_failure)?;
    }

    // Never reuse an existing file: a same-second rerun must not clobber an
    // archive that an earlier run already recorded.
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(destination)
        .map_err(write_failure)?;
    match write_zip(file, source, destination) {
        Ok(count) => {
            log::debug!("Archived {} files from {:?} into {:?}", count, source, destination);
            Ok(format!("Backup created: {} ({} files)", destination.display(), count))
        }
        Err(e) => {
            remove_partial(destination);
            Err(write_failure(e))
        }
    }
}

fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::debug!("Removed partial archive {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Could not remove partial archive {:?}: {}", path, e),
    }
}

fn write_zip(file: File, root: &Path, destination: &Path) -> io::Result<usize> {
    let mut writer = ZipWriter::new(file);
    // The archive may live below the source root; never archive it into itself.
    let skip = fs::canonicalize(destination).ok();
    let count = add_directory(&mut writer, root, root, skip.as_deref())?;
    let mut file = writer.finish().map_err(zip_error)?;
    file.flush()?;
    file.sync_all()?;
    Ok(count)
}

fn add_directory<W: Write + Seek>(
    writer: &mut ZipWriter<W>,
    root: &Path,
    dir: &Path,
    skip: Option<&Path>,
) -> io::Result<usize> {
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    let mut count = 0;
    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            count += add_directory(writer, root, &path, skip)?;
            continue;
        }

        // Follows symlinks; a dangling link surfaces here as NotFound.
        let metadata = fs::metadata(&path)?;
        if metadata.is_dir() {
            log::debug!("Not descending into symlinked directory {:?}", path);
            continue;
        }
        if !metadata.is_file() {
            log::debug!("Skipping special file {:?}", path);
            continue;
        }
        if let Some(skip) = skip {
            if fs::canonicalize(&path).ok().as_deref() == Some(skip) {
                continue;
            }
        }

        add_file(writer, root, &path, metadata.len())?;
        count += 1;
    }
    Ok(count)
}

fn add_file<W: Write + Seek>(
    writer: &mut ZipWriter<W>,
    root: &Path,
    path: &Path,
    len: u64,
) -> io::Result<()> {
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(6))
        .large_file(len >= u32::MAX as u64);

    writer.start_file(entry_name(root, path)?, options).map_err(zip_error)?;
    let mut input = File::open(path)?;
    io::copy(&mut input, writer)?;
    Ok(())
}

/// Zip entry names always use `/` separators.
fn entry_name(root: &Path, path: &Path) -> io::Result<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

fn zip_error(e: zip::result::ZipError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn write(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    fn entry_names(archive: &Path) -> BTreeSet<String> {
        let file = File::open(archive).unwrap();
        let zip = zip::ZipArchive::new(file).unwrap();
        zip.file_names().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_backup_filename_format() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let path = backup_filename(JobId(7), Path::new("/backups"), now);
        assert_eq!(path, PathBuf::from("/backups/job_7_20240102_030405.zip"));
    }

    #[test]
    fn test_archives_every_file_with_relative_paths() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("a.txt"), "alpha");
        write(&src.path().join("nested/b.txt"), "beta");
        write(&src.path().join("nested/deeper/c.bin"), "gamma");
        fs::create_dir_all(src.path().join("empty")).unwrap();

        let out = dst.path().join("out.zip");
        let message = build_archive(src.path(), &out).unwrap();
        assert!(message.contains("out.zip"));

        let expected: BTreeSet<String> = ["a.txt", "nested/b.txt", "nested/deeper/c.bin"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(entry_names(&out), expected);

        let mut zip = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        let entry = zip.by_name("nested/b.txt").unwrap();
        assert_eq!(entry.compression(), zip::CompressionMethod::Deflated);
        assert_eq!(entry.size(), 4);
    }

    #[test]
    fn test_creates_missing_destination_directories() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("a.txt"), "alpha");

        let out = dst.path().join("x/y/z/out.zip");
        build_archive(src.path(), &out).unwrap();
        assert!(out.is_file());
    }

    #[test]
    fn test_missing_source_creates_nothing() {
        let dst = tempfile::tempdir().unwrap();
        let out = dst.path().join("sub/out.zip");

        let err = build_archive(&dst.path().join("nope"), &out).unwrap_err();
        assert!(matches!(err, ArchiveError::SourceNotFound(_)));
        assert!(err.to_string().starts_with("Source path does not exist"));
        assert!(!out.exists());
        assert!(!dst.path().join("sub").exists());
    }

    #[test]
    fn test_source_must_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        write(&file, "x");

        let err = build_archive(&file, &dir.path().join("out.zip")).unwrap_err();
        assert!(matches!(err, ArchiveError::SourceNotADirectory(_)));
        assert!(!dir.path().join("out.zip").exists());
    }

    #[test]
    fn test_empty_source_produces_empty_archive() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let out = dst.path().join("out.zip");

        build_archive(src.path(), &out).unwrap();
        assert!(entry_names(&out).is_empty());
    }

    #[test]
    fn test_archive_inside_source_is_not_archived() {
        let src = tempfile::tempdir().unwrap();
        write(&src.path().join("a.txt"), "alpha");
        let out = src.path().join("backups/out.zip");

        build_archive(src.path(), &out).unwrap();
        let names = entry_names(&out);
        assert_eq!(names.len(), 1);
        assert!(names.contains("a.txt"));
    }

    #[test]
    fn test_existing_archive_is_never_overwritten() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("a.txt"), "alpha");
        let out = dst.path().join("out.zip");
        fs::write(&out, "earlier archive").unwrap();

        let err = build_archive(src.path(), &out).unwrap_err();
        assert!(matches!(err, ArchiveError::WriteFailure { .. }));
        assert_eq!(fs::read_to_string(&out).unwrap(), "earlier archive");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_failure_removes_partial_archive() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("a.txt"), "alpha");
        // Sorted after a.txt, so the archive already has content when it fails.
        std::os::unix::fs::symlink(src.path().join("missing"), src.path().join("z-dangling")).unwrap();

        let out = dst.path().join("out.zip");
        let err = build_archive(src.path(), &out).unwrap_err();
        assert!(matches!(err, ArchiveError::WriteFailure { .. }));
        assert!(!out.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_policy() {
        let src = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(&src.path().join("a.txt"), "alpha");
        write(&outside.path().join("linked.txt"), "linked");
        write(&outside.path().join("dir/inner.txt"), "inner");
        std::os::unix::fs::symlink(outside.path().join("linked.txt"), src.path().join("link.txt")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("dir"), src.path().join("linkdir")).unwrap();

        let out = dst.path().join("out.zip");
        build_archive(src.path(), &out).unwrap();

        let names = entry_names(&out);
        assert!(names.contains("link.txt"));
        assert!(!names.iter().any(|n| n.starts_with("linkdir")));
        assert_eq!(names.len(), 2);
    }
}
