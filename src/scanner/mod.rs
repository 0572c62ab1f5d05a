use crate::SUPPORTED_EXTENSIONS;
use crate::location::Location;
use std::path::Path;
use walkdir::WalkDir;

/// Whether `path` has an extension the bundled decoder handles.
pub fn is_supported(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    SUPPORTED_EXTENSIONS.contains(&ext.as_str())
}

/// Walk `paths` (files or directories) and collect every supported audio
/// file as a location, sorted and deduplicated. Unreadable entries are
/// logged and skipped.
pub fn collect_audio_files<P: AsRef<Path>>(paths: &[P]) -> Vec<Location> {
    let mut found: Vec<Location> = Vec::new();

    for path in paths {
        for entry in WalkDir::new(path.as_ref()).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if entry.file_type().is_file() && is_supported(entry.path()) {
                found.push(Location::from_file(entry.path()));
            }
        }
    }

    found.sort();
    found.dedup();
    log::debug!("Found {} audio files", found.len());
    found
}
