//! Release archive extraction (tar.gz and zip)

use super::fetcher::FetchedArchive;
use crate::error::ProvisionError;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use zip::ZipArchive;

/// Supported archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    /// Detect the format from magic bytes, falling back to the file name
    pub fn detect(header: &[u8], file_name: Option<&str>) -> Option<Self> {
        if header.starts_with(&[0x1f, 0x8b]) {
            return Some(Self::TarGz);
        }
        if header.starts_with(b"PK\x03\x04") {
            return Some(Self::Zip);
        }
        let name = file_name?.to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

/// Extract a fetched archive into `target`, replacing whatever is there.
///
/// A single top-level directory in the archive (as in GitHub tag archives)
/// is stripped so the tool ends up directly under `target`.
pub fn extract_archive(archive: &FetchedArchive, target: &Path) -> Result<PathBuf, ProvisionError> {
    let mut file = File::open(archive.file.path()).map_err(ProvisionError::extraction)?;
    let mut header = [0u8; 4];
    let read = read_header(&mut file, &mut header).map_err(ProvisionError::extraction)?;
    file.seek(SeekFrom::Start(0))
        .map_err(ProvisionError::extraction)?;

    let format = ArchiveFormat::detect(&header[..read], archive.file_name.as_deref())
        .ok_or_else(|| ProvisionError::extraction("unrecognized archive format"))?;
    debug!(?format, target = %target.display(), "extracting release");

    let parent = target
        .parent()
        .ok_or_else(|| ProvisionError::extraction("extraction target has no parent"))?;
    std::fs::create_dir_all(parent).map_err(ProvisionError::extraction)?;

    // Unpack next to the target so the final move is a rename on one filesystem
    let staging = tempfile::Builder::new()
        .prefix(".extract-")
        .tempdir_in(parent)
        .map_err(ProvisionError::extraction)?;

    match format {
        ArchiveFormat::TarGz => unpack_tar_gz(file, staging.path())?,
        ArchiveFormat::Zip => unpack_zip(file, staging.path())?,
    }

    let root = single_top_level_dir(staging.path())
        .map_err(ProvisionError::extraction)?
        .unwrap_or_else(|| staging.path().to_path_buf());

    if target.exists() {
        warn!(target = %target.display(), "replacing existing extraction");
        std::fs::remove_dir_all(target).map_err(ProvisionError::extraction)?;
    }
    std::fs::rename(&root, target).map_err(ProvisionError::extraction)?;

    Ok(target.to_path_buf())
}

fn read_header(file: &mut File, header: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < header.len() {
        match file.read(&mut header[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Entries must stay inside the extraction directory
fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn unpack_tar_gz(file: File, dest: &Path) -> Result<(), ProvisionError> {
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let entries = archive.entries().map_err(ProvisionError::extraction)?;

    let mut count = 0usize;
    for entry in entries {
        let mut entry = entry.map_err(ProvisionError::extraction)?;
        let path = entry.path().map_err(ProvisionError::extraction)?.into_owned();
        if !is_contained(&path) {
            return Err(ProvisionError::extraction(format!(
                "archive entry escapes extraction directory: {}",
                path.display()
            )));
        }
        entry.unpack_in(dest).map_err(ProvisionError::extraction)?;
        count += 1;
    }

    if count == 0 {
        return Err(ProvisionError::extraction("archive is empty"));
    }
    debug!(entries = count, "tar.gz unpacked");
    Ok(())
}

fn unpack_zip(file: File, dest: &Path) -> Result<(), ProvisionError> {
    let mut archive = ZipArchive::new(file).map_err(ProvisionError::extraction)?;
    if archive.is_empty() {
        return Err(ProvisionError::extraction("archive is empty"));
    }

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(ProvisionError::extraction)?;
        let relative = entry.enclosed_name().ok_or_else(|| {
            ProvisionError::extraction(format!(
                "archive entry escapes extraction directory: {}",
                entry.name()
            ))
        })?;
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(ProvisionError::extraction)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(ProvisionError::extraction)?;
        }
        let mut out = File::create(&out_path).map_err(ProvisionError::extraction)?;
        io::copy(&mut entry, &mut out).map_err(ProvisionError::extraction)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode))
                .map_err(ProvisionError::extraction)?;
        }
    }

    debug!(entries = archive.len(), "zip unpacked");
    Ok(())
}

/// The only entry of `dir`, when that entry is a directory
fn single_top_level_dir(dir: &Path) -> io::Result<Option<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)?;
    let first = match entries.next() {
        Some(entry) => entry?,
        None => return Ok(None),
    };
    if entries.next().is_some() || !first.file_type()?.is_dir() {
        return Ok(None);
    }
    Ok(Some(first.path()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn tar_gz(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn fetched(bytes: &[u8], name: &str) -> FetchedArchive {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        FetchedArchive {
            file,
            file_name: Some(name.to_string()),
            size: bytes.len() as u64,
        }
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(ArchiveFormat::detect(&[0x1f, 0x8b, 8, 0], None), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect(b"PK\x03\x04", None), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::detect(b"????", Some("v1.tgz")), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect(b"????", Some("notes.txt")), None);
    }

    #[test]
    fn test_tar_gz_strips_top_level_dir() {
        let bytes = tar_gz(&[
            ("teaspoon-0.3.0/teaspoon.py", b"print('hi')"),
            ("teaspoon-0.3.0/environment.yml", b"dependencies: []"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("teaspoon-0.3.0");

        extract_archive(&fetched(&bytes, "0.3.0.tar.gz"), &target).unwrap();
        assert!(target.join("teaspoon.py").is_file());
        assert!(target.join("environment.yml").is_file());
    }

    #[test]
    fn test_zip_extracts_flat_archive() {
        let mut buffer = Vec::new();
        {
            let mut zip = ZipWriter::new(std::io::Cursor::new(&mut buffer));
            let options = SimpleFileOptions::default();
            zip.start_file("teaspoon.py", options).unwrap();
            zip.write_all(b"print('hi')").unwrap();
            zip.start_file("tablespoon.py", options).unwrap();
            zip.write_all(b"print('hi')").unwrap();
            zip.finish().unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("tool");

        extract_archive(&fetched(&buffer, "0.3.0.zip"), &target).unwrap();
        assert!(target.join("teaspoon.py").is_file());
        assert!(target.join("tablespoon.py").is_file());
    }

    #[test]
    fn test_corrupt_archive_is_extraction_error() {
        let mut bytes = vec![0x1f, 0x8b];
        bytes.extend_from_slice(b"definitely not deflate data");
        let dir = tempfile::tempdir().unwrap();
        let err = extract_archive(&fetched(&bytes, "0.3.0.tar.gz"), &dir.path().join("t"))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Extraction { .. }));
    }

    #[test]
    fn test_stale_target_replaced() {
        let bytes = tar_gz(&[("pkg/new.txt", b"new")]);
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("pkg");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("old.txt"), b"old").unwrap();

        extract_archive(&fetched(&bytes, "x.tar.gz"), &target).unwrap();
        assert!(target.join("new.txt").is_file());
        assert!(!target.join("old.txt").exists());
    }

    #[test]
    fn test_containment() {
        assert!(is_contained(Path::new("a/b/c")));
        assert!(!is_contained(Path::new("../etc/passwd")));
        assert!(!is_contained(Path::new("/etc/passwd")));
    }
}
