//! Zip archive plumbing shared by the bundle merger and the optimizer.
//!
//! Extraction overwrites same-named entries, which is what the tiered merge
//! relies on: the last archive extracted into a staging area wins.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Archive error: {0}")]
    Archive(String),
}

impl From<zip::result::ZipError> for ArchiveError {
    fn from(e: zip::result::ZipError) -> Self {
        Self::Archive(e.to_string())
    }
}

/// Extract a zip archive into `dest_dir`, overwriting existing entries.
pub fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<(), ArchiveError> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;

    fs::create_dir_all(dest_dir)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        // enclosed_name rejects absolute paths and .. traversal
        let relative = match entry.enclosed_name() {
            Some(path) => path.to_owned(),
            None => continue,
        };

        let out_path = dest_dir.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode))?;
        }
    }

    Ok(())
}

/// Pack a directory tree into a zip at `dest`, atomically.
///
/// `compression_level` 0 stores entries uncompressed; 1..=9 deflates.
pub fn pack_dir(src_dir: &Path, dest: &Path, compression_level: u32) -> Result<(), ArchiveError> {
    let tmp = dest.with_extension(crate::io::fetch::tmp_suffix());
    let result = pack_dir_inner(src_dir, &tmp, compression_level);
    match result {
        Ok(()) => {
            fs::rename(&tmp, dest)?;
            Ok(())
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

fn pack_dir_inner(src_dir: &Path, dest: &Path, compression_level: u32) -> Result<(), ArchiveError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(dest)?;
    let mut writer = ZipWriter::new(file);

    let options = if compression_level == 0 {
        SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
    } else {
        SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(compression_level as i64))
    };

    for entry in WalkDir::new(src_dir).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        let relative = path
            .strip_prefix(src_dir)
            .map_err(|e| ArchiveError::Archive(e.to_string()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let name = relative.to_string_lossy().replace('\\', "/");

        if path.is_dir() {
            writer.add_directory(name, options)?;
        } else {
            writer.start_file(name, options)?;
            let mut src = File::open(path)?;
            io::copy(&mut src, &mut writer)?;
        }
    }

    writer.finish()?;
    Ok(())
}

/// Entry names of a zip archive, for tests and diagnostics.
pub fn list_entries(archive_path: &Path) -> Result<Vec<String>, ArchiveError> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;
    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        names.push(archive.by_index(i)?.name().to_string());
    }
    Ok(names)
}

/// Read one entry's bytes out of a zip archive.
pub fn read_entry(archive_path: &Path, name: &str) -> Result<Vec<u8>, ArchiveError> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;
    let mut entry = archive.by_name(name)?;
    let mut buf = Vec::new();
    io::Read::read_to_end(&mut entry, &mut buf)?;
    Ok(buf)
}

/// Build a zip archive from (name, bytes) pairs. Test helper and staging
/// primitive for callers that assemble small archives in memory.
pub fn write_archive(dest: &Path, entries: &[(&str, &[u8])]) -> Result<(), ArchiveError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(dest)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, bytes) in entries {
        writer.start_file(*name, options)?;
        use std::io::Write;
        writer.write_all(bytes)?;
    }
    writer.finish()?;
    Ok(())
}
