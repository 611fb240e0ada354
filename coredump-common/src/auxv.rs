//! Auxiliary vector entry tags.
//!
//! Tag values are the `AT_*` constants from `<elf.h>`; only the entries the
//! pipeline actually reads are listed.

/// A tag identifying one auxiliary vector entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum AuxvTag {
    PageSize = 6,
    Flags = 8,
    EntryPoint = 9,
    Uid = 11,
    Euid = 12,
    Gid = 13,
    Egid = 14,
    Platform = 15,
    Hwcap = 16,
    BasePlatform = 24,
    Hwcap2 = 26,
    ExecFilename = 31,
}

impl AuxvTag {
    pub fn tag(self) -> i32 {
        self as i32
    }
}
