use std::collections::BTreeSet;
use std::path::Path;

use log::{debug, info, trace, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use walkdir::WalkDir;

use crate::fetch::PostId;
use crate::fetch::ledger::{CompletionLedger, LedgerResult};

/// Extensions of files that count as finished images.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp", "tiff"];

static SAVED_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ANIME-PICTURES\.NET_-_(\d+)-").expect("saved name pattern is valid"));

/// Recognizes the post ID in a saved image's file name.
pub(crate) fn post_id_from_filename(name: &str) -> Option<PostId> {
    let extension = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    if !IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        return None;
    }

    SAVED_NAME
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|id| PostId::parse(id.as_str()))
}

/// Totals from a ledger rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RebuildSummary {
    pub(crate) files_scanned: usize,
    pub(crate) ids_found: usize,
    pub(crate) ids_added: usize,
}

/// Walks `root` for saved images and appends any IDs the ledger is missing.
///
/// The ledger is only appended to, so IDs recorded without a file on disk
/// stay recorded.
pub(crate) fn rebuild_ledger(root: &Path, ledger: &mut CompletionLedger) -> LedgerResult<RebuildSummary> {
    info!("Scanning {} for downloaded images...", root.display());
    let mut summary = RebuildSummary::default();
    let mut found = BTreeSet::new();

    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("Error accessing path under {}: {}", root.display(), err);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        summary.files_scanned += 1;
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        match post_id_from_filename(name) {
            Some(id) => {
                trace!("Found post {} in {}", id, name);
                found.insert(id);
            }
            None => trace!("No post ID in {}", name),
        }
    }

    summary.ids_found = found.len();
    // Numeric order keeps the appended block readable.
    let mut found: Vec<PostId> = found.into_iter().collect();
    found.sort_by_key(|id| (id.as_str().len(), id.as_str().to_string()));
    for id in &found {
        if ledger.mark_complete(id)? {
            summary.ids_added += 1;
        }
    }

    debug!(
        "Rebuild scanned {} files, found {} IDs, added {}",
        summary.files_scanned, summary.ids_found, summary.ids_added
    );
    Ok(summary)
}
