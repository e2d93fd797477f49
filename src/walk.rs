//! Finding the images we need to OCR.
//!
//! We walk the root directory lazily with [`walkdir`], and keep any regular
//! file with a TIFF or JPEG extension. Symlinks to files are kept, but we never
//! descend into symlinked directories. Problems with the root itself are fatal,
//! but problems further down the tree are reported per entry so that one
//! unreadable folder doesn't stop the whole run.

use std::{
    collections::{HashMap, hash_map::Entry},
    ffi::OsStr,
    fmt, fs,
};

use walkdir::{DirEntry, WalkDir};

use crate::{output::output_path_for, prelude::*};

/// File extensions we will send for OCR, in lowercase.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["tif", "tiff", "jpg", "jpeg"];

/// An image file discovered under the root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    /// Path to the image.
    pub path: PathBuf,

    /// Lowercased extension, without the leading dot. Always one of
    /// [`SUPPORTED_EXTENSIONS`].
    pub extension: String,
}

impl ImageFile {
    /// Wrap `path` as an [`ImageFile`], if it has a supported extension.
    pub fn from_path(path: PathBuf) -> Option<Self> {
        let extension = path
            .extension()
            .and_then(OsStr::to_str)?
            .to_ascii_lowercase();
        SUPPORTED_EXTENSIONS
            .contains(&extension.as_str())
            .then_some(Self { path, extension })
    }

    /// Does this look like a TIFF, judging by its extension?
    pub fn is_tiff(&self) -> bool {
        self.extension == "tif" || self.extension == "tiff"
    }

    /// Where should we write the OCR text for this image?
    pub fn output_path(&self) -> PathBuf {
        output_path_for(&self.path)
    }
}

/// A directory entry we could not read while walking.
#[derive(Debug)]
pub struct WalkFailure {
    /// The path we failed to read.
    pub path: PathBuf,

    /// What went wrong.
    pub error: anyhow::Error,
}

impl fmt::Display for WalkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not read {}: {:#}", self.path.display(), self.error)
    }
}

/// Either an image to process, or an entry we failed to read.
pub type WalkItem = std::result::Result<ImageFile, WalkFailure>;

/// Recursively list the supported images under `root`.
///
/// This fails immediately if `root` is missing, isn't a directory, or can't be
/// listed. The returned iterator is lazy, and does blocking I/O as it goes.
#[instrument(level = "debug", skip_all, fields(root = %root.display()))]
pub fn walk_images(
    root: &Path,
) -> Result<impl Iterator<Item = WalkItem> + Send + use<>> {
    let metadata = fs::metadata(root)
        .with_context(|| format!("Root directory {:?} does not exist", root))?;
    if !metadata.is_dir() {
        return Err(anyhow!("Root directory {:?} is not a directory", root));
    }
    fs::read_dir(root)
        .with_context(|| format!("Root directory {:?} is not readable", root))?;

    let root = root.to_owned();
    let walker = WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();
    Ok(walker.filter_map(move |entry| match entry {
        Ok(entry) => image_from_entry(entry),
        Err(err) => {
            let path = err.path().map(Path::to_owned).unwrap_or_else(|| root.clone());
            warn!(path = %path.display(), "Could not read directory entry: {}", err);
            Some(Err(WalkFailure {
                path,
                error: anyhow::Error::new(err),
            }))
        }
    }))
}

/// Turn a directory entry into a [`WalkItem`], if it's an image we want.
fn image_from_entry(entry: DirEntry) -> Option<WalkItem> {
    let file_type = entry.file_type();
    if !file_type.is_file() && !file_type.is_symlink() {
        return None;
    }
    let is_symlink = file_type.is_symlink();
    let image = ImageFile::from_path(entry.into_path())?;
    if is_symlink {
        match fs::metadata(&image.path) {
            Ok(metadata) if metadata.is_file() => {}
            // Links to directories (or anything else) are left alone.
            Ok(_) => return None,
            Err(err) => {
                warn!(path = %image.path.display(), "Broken symlink: {}", err);
                return Some(Err(WalkFailure {
                    error: anyhow::Error::new(err)
                        .context(format!("Could not follow symlink {:?}", image.path)),
                    path: image.path,
                }));
            }
        }
    }
    trace!(path = %image.path.display(), "Found image");
    Some(Ok(image))
}

/// Make sure no two images write to the same output file.
///
/// `scan.tif` and `scan.jpg` in one directory would both write `scan_ocr.txt`.
/// The first image (in walk order) keeps the output path, and every later one
/// becomes a [`WalkFailure`] naming the image it collides with.
pub fn reject_duplicate_outputs(items: Vec<WalkItem>) -> Vec<WalkItem> {
    let mut claimed = HashMap::<PathBuf, PathBuf>::new();
    items
        .into_iter()
        .map(|item| {
            let image = item?;
            match claimed.entry(image.output_path()) {
                Entry::Vacant(vacant) => {
                    vacant.insert(image.path.clone());
                    Ok(image)
                }
                Entry::Occupied(occupied) => {
                    warn!(
                        path = %image.path.display(),
                        other = %occupied.get().display(),
                        "Images share an output file"
                    );
                    Err(WalkFailure {
                        error: anyhow!(
                            "{:?} would overwrite the output of {:?}; rename one of them",
                            image.path,
                            occupied.get()
                        ),
                        path: image.path,
                    })
                }
            }
        })
        .collect()
}
