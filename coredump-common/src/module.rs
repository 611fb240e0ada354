//! Loaded binary images and their address ranges.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Returns the last component of a `/`-separated path.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        None => path,
        Some(index) => &path[(index + 1)..],
    }
}

/// A binary image that was mapped into the crashed process.
///
/// The address range is half-open: `[start_address, end_address)`. Depending
/// on which module-map strategy produced this entry, `start_address` may be
/// the start of a mapped *segment* rather than the image base; see
/// [`Module::base_address`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    /// Path of the image as recorded in the dump.
    pub path: String,
    /// File name portion of `path`.
    pub name: String,
    pub start_address: u64,
    pub end_address: u64,
    /// Page offset of the mapped segment within the file, in pages.
    ///
    /// Zero when `start_address` already is the image base (the gdb
    /// fallback strategy normalizes the address itself).
    pub segment_offset: u64,
    /// Size of the local copy of the binary, 0 if none was found.
    pub file_size: u64,
    /// Where a local copy of the binary was found, if anywhere.
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    /// Debug symbol file fetched for this module, if any.
    #[serde(default)]
    pub debug_symbol_path: Option<PathBuf>,
    /// Product version recovered from agent logs, if any.
    #[serde(default)]
    pub version: Option<String>,
}

impl Module {
    pub fn new(path: &str, start_address: u64, end_address: u64, segment_offset: u64) -> Module {
        Module {
            path: path.to_string(),
            name: basename(path).to_string(),
            start_address,
            end_address,
            segment_offset,
            ..Default::default()
        }
    }

    /// Whether `address` falls strictly inside this module's range.
    pub fn contains(&self, address: u64) -> bool {
        self.start_address < address && address < self.end_address
    }

    /// The true base address of the image.
    ///
    /// `start_address` may only be the start of a loaded segment; the image
    /// base is recovered by backing up over the pages that precede the
    /// segment in the file.
    pub fn base_address(&self, page_size: u64) -> u64 {
        self.start_address - self.segment_offset * page_size
    }
}

/// Finds the module containing `address`, if any.
///
/// Ranges are assumed non-overlapping; the first match in list order wins.
pub fn module_at_address(modules: &[Module], address: u64) -> Option<&Module> {
    modules.iter().find(|module| module.contains(address))
}
