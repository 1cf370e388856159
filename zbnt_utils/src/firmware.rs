//! Discovery of the bitstreams a device can be programmed with

use kstring::KString;
use std::{
    fs,
    path::{
        Path,
        PathBuf,
    },
};
use thiserror::Error;
use tracing::{
    debug,
    warn,
};

/// Extension of the opaque bitstream images
pub const BITSTREAM_EXT: &str = "bin";
/// Extension of the device tree overlay that describes a bitstream
pub const OVERLAY_EXT: &str = "dtbo";

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("No usable bitstreams in `{0}`")]
    Empty(PathBuf),
    #[error("The bitstream list is empty")]
    EmptyList,
}

/// The sorted, non-empty list of bitstream names a device knows about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitstreamCatalog {
    names: Vec<KString>,
}

impl BitstreamCatalog {
    /// Build a catalog from an explicit list, keeping its order
    /// # Errors
    /// Returns an error if the list is empty
    pub fn from_names<I, S>(names: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<KString>,
    {
        let names: Vec<KString> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(Error::EmptyList);
        }
        Ok(Self { names })
    }

    /// Scan `dir` for `<name>.bin` files with a sibling `<name>.dtbo`. Images without an overlay
    /// are skipped with a warning. The result is sorted by name.
    /// # Errors
    /// Returns an error if the directory can't be read or holds no usable bitstream
    pub fn scan(dir: &Path) -> Result<Self, Error> {
        let mut names = vec![];
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(BITSTREAM_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !path.with_extension(OVERLAY_EXT).is_file() {
                warn!(bitstream = stem, "Bitstream has no device tree overlay, ignoring");
                continue;
            }
            debug!(bitstream = stem, "Found bitstream");
            names.push(KString::from_ref(stem));
        }
        names.sort();
        if names.is_empty() {
            return Err(Error::Empty(dir.to_path_buf()));
        }
        Ok(Self { names })
    }

    #[must_use]
    pub fn names(&self) -> &[KString] {
        &self.names
    }

    #[must_use]
    pub fn first(&self) -> &str {
        &self.names[0]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Position of `name` in the catalog
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n.as_str() == name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&str> {
        self.names.get(idx).map(KString::as_str)
    }
}

/// Path of the overlay describing `name` inside the firmware directory `dir`
#[must_use]
pub fn overlay_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{OVERLAY_EXT}"))
}
