/*!
Materializing the target file tree before any chunk is written.

Directory markers become directories; everything else becomes a regular
file that workers later write into positionally. Existing files are never
truncated, since their contents may be prior progress.
*/

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;

/// Ensures a directory marker mapping exists on disk
pub fn ensure_directory(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

/// Ensures the regular file for a mapping exists, creating parent
/// directories as needed.
///
/// A newly created file is pre-sized to the mapping's full size, which on
/// most filesystems gives a sparse file for workers to fill in. A file
/// that already exists is left exactly as it is. Returns whether the file
/// was created.
pub fn prepare_file(path: &Path, size: u64) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).write(true).open(path)?;
    file.set_len(size)?;
    Ok(true)
}
