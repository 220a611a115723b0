//! Presentation assets and result archiving.
//!
//! The stylesheet, schema, CSS and logo that make `test-result.xml` readable
//! in a browser are embedded into the binary and copied next to every report.
//! The finished result directory is then zipped into a sibling archive.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use include_dir::{Dir, include_dir};
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

/// Embedded report assets.
static REPORT_ASSETS: Dir = include_dir!("$CARGO_MANIFEST_DIR/assets/report");

/// Assets copied into every result directory.
pub const RESULT_RESOURCES: &[&str] = &[
    "compatibility_result.css",
    "compatibility_result.xsd",
    "compatibility_result.xsl",
    "logo.png",
];

/// Copies the bundled formatting files into `result_dir`.
///
/// Returns how many files were written. A missing or unwritable asset is
/// logged and skipped.
pub fn copy_formatting_files(result_dir: &Path) -> usize {
    let mut copied = 0;
    for name in RESULT_RESOURCES {
        let Some(file) = REPORT_ASSETS.get_file(name) else {
            warn!("Could not find bundled asset {}", name);
            continue;
        };
        let target = result_dir.join(name);
        match fs::write(&target, file.contents()) {
            Ok(()) => copied += 1,
            Err(e) => warn!("Failed to copy {} to {}: {}", name, target.display(), e),
        }
    }
    debug!("Copied {} formatting files to {}", copied, result_dir.display());
    copied
}

/// Zips `result_dir` into `<result_dir>.zip` next to it.
///
/// Returns the archive path, or `None` (after logging) if it could not be
/// written.
pub fn zip_results(result_dir: &Path) -> Option<PathBuf> {
    let Some(name) = result_dir.file_name() else {
        warn!("Cannot zip {}: no directory name", result_dir.display());
        return None;
    };
    let mut zip_name = name.to_os_string();
    zip_name.push(".zip");
    let zip_path = result_dir.with_file_name(zip_name);

    match write_zip(result_dir, &zip_path) {
        Ok(entries) => {
            debug!("Zipped {} entries into {}", entries, zip_path.display());
            Some(zip_path)
        }
        Err(e) => {
            warn!("Failed to zip results to {}: {}", zip_path.display(), e);
            let _ = fs::remove_file(&zip_path);
            None
        }
    }
}

fn write_zip(source_dir: &Path, zip_path: &Path) -> zip::result::ZipResult<usize> {
    let file = File::create(zip_path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    // Entries are rooted at the directory name so the archive unpacks into
    // a folder of the same name.
    let root = source_dir.parent().unwrap_or(source_dir);
    let mut entries = 0;
    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(io::Error::other)?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            zip.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options)?;
            zip.write_all(&fs::read(entry.path())?)?;
        }
        entries += 1;
    }
    zip.finish()?;
    Ok(entries)
}
