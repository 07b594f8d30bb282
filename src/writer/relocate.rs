//! Moving completed files after a download's destination changed.

use std::path::Path;

use tracing::debug;

use crate::error::WriteError;
use crate::queue::NzbInfo;
use crate::types::MessageKind;
use crate::utils::{dir_empty, force_directories, get_unique_path, move_file};

/// Move the already completed files of `nzb` from `old_dest_dir` into its
/// current destination directory
///
/// Files keep their names unless that would overwrite an existing file, in
/// which case a " (N)" suffix is added. The old directory is removed once it
/// is empty and no file of the download still has pending direct writes into
/// it. Individual move failures are reported on the download and do not stop
/// the remaining moves.
pub fn move_completed_files(nzb: &NzbInfo, old_dest_dir: &Path) -> Result<(), WriteError> {
    let completed = nzb.completed_files();
    if completed.is_empty() {
        return Ok(());
    }

    let dest_dir = nzb.dest_dir();
    if let Err(e) = force_directories(&dest_dir) {
        nzb.print_message(MessageKind::Error, e.to_string());
        return Err(e);
    }

    for completed_file in &completed {
        let old_path = old_dest_dir.join(&completed_file.filename);
        let new_path = dest_dir.join(&completed_file.filename);
        if old_path == new_path {
            continue;
        }

        let new_path = match get_unique_path(&new_path) {
            Ok(path) => path,
            Err(e) => {
                nzb.print_message(MessageKind::Error, e.to_string());
                continue;
            }
        };

        debug!(from = %old_path.display(), to = %new_path.display(), "Moving completed file");
        if let Err(e) = move_file(&old_path, &new_path) {
            nzb.print_message(
                MessageKind::Error,
                format!(
                    "Could not move file {} to {}: {}",
                    old_path.display(),
                    new_path.display(),
                    e
                ),
            );
            continue;
        }

        if let Some(new_name) = new_path.file_name().and_then(|n| n.to_str())
            && new_name != completed_file.filename
        {
            nzb.rename_completed_file(&completed_file.filename, new_name);
        }
    }

    if dir_empty(old_dest_dir) {
        let pending_writes = nzb.files().iter().any(|f| f.has_pending_writes());
        if !pending_writes && let Err(e) = std::fs::remove_dir(old_dest_dir) {
            debug!(path = %old_dest_dir.display(), error = %e, "Could not remove old destination directory");
        }
    }

    Ok(())
}
