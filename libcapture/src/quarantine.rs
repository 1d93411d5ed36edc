use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::info;
use walkdir::WalkDir;

/// Default name of the quarantine area, next to the capture store root.
pub const DISCARDED_DIR: &str = "discarded_captures";

/// Terminal destination for broken or duplicate capture directories.
///
/// A moved directory keeps its own name, which is unique within the store
/// layout; nothing ever moves it back.
#[derive(Debug, Clone)]
pub struct Quarantine {
    root: PathBuf,
}

impl Quarantine {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Quarantine area placed beside `capture_root`.
    pub fn beside(capture_root: &Path) -> io::Result<Self> {
        let parent = capture_root.parent().unwrap_or(capture_root);
        Self::new(parent.join(DISCARDED_DIR))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Move `dir` into the quarantine area, returning its new location.
    ///
    /// A name already taken in the area gets a `.1`, `.2`, ... suffix.
    pub fn move_capture(&self, dir: &Path) -> io::Result<PathBuf> {
        let name = dir.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no directory name", dir.display()),
            )
        })?;
        let mut dest = self.root.join(name);
        let mut suffix = 1;
        while dest.exists() {
            let mut alt = name.to_os_string();
            alt.push(format!(".{suffix}"));
            dest = self.root.join(alt);
            suffix += 1;
        }

        match fs::rename(dir, &dest) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(nix::libc::EXDEV) => {
                copy_tree(dir, &dest)?;
                fs::remove_dir_all(dir)?;
            }
            Err(e) => return Err(e),
        }
        info!("Quarantined {} to {}", dir.display(), dest.display());
        Ok(dest)
    }
}

/// Recursive copy for moves across filesystems.
fn copy_tree(src: &Path, dest: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
