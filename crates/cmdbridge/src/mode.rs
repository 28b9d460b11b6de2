//! Translation of the helper's mode word into [`FileFlags`].
//!
//! The helper reports a single `u32` per path that carries two encodings
//! at once:
//!
//! ```text
//! 31              19                 11        0
//! ┌────────────────┬──────────────────┬─────────┐
//! │ runtime type / │  (unused here)   │  POSIX  │
//! │ attribute bits │                  │  rwxrwx │
//! └────────────────┴──────────────────┴─────────┘
//! ```
//!
//! The low bits are the classic `st_mode` permission triplets, the high bits
//! are the helper runtime's file-mode type bits.  Both layouts are part of
//! the wire contract and must not change.

use bitflags::bitflags;

/// POSIX permission bits (`st_mode & 0o777`).
pub mod posix {
    pub const S_IRUSR: u32 = 0o400;
    pub const S_IWUSR: u32 = 0o200;
    pub const S_IXUSR: u32 = 0o100;
    pub const S_IRGRP: u32 = 0o040;
    pub const S_IWGRP: u32 = 0o020;
    pub const S_IXGRP: u32 = 0o010;
    pub const S_IROTH: u32 = 0o004;
    pub const S_IWOTH: u32 = 0o002;
    pub const S_IXOTH: u32 = 0o001;
}

/// Type and attribute bits of the helper runtime's file mode.
pub mod runtime {
    pub const DIR: u32 = 0x8000_0000;
    pub const APPEND: u32 = 0x4000_0000;
    pub const EXCLUSIVE: u32 = 0x2000_0000;
    pub const TEMPORARY: u32 = 0x1000_0000;
    pub const SYMLINK: u32 = 0x0800_0000;
    pub const DEVICE: u32 = 0x0400_0000;
    pub const NAMED_PIPE: u32 = 0x0200_0000;
    pub const SOCKET: u32 = 0x0100_0000;
    pub const SETUID: u32 = 0x0080_0000;
    pub const SETGID: u32 = 0x0040_0000;
    pub const CHAR_DEVICE: u32 = 0x0020_0000;
    pub const STICKY: u32 = 0x0010_0000;
    pub const IRREGULAR: u32 = 0x0008_0000;

    /// Every bit that classifies the entry as something other than a
    /// regular file.
    pub const TYPE_MASK: u32 =
        DIR | SYMLINK | NAMED_PIPE | SOCKET | DEVICE | CHAR_DEVICE | IRREGULAR;
}

bitflags! {
    /// Flags describing a path as seen by file-access callers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FileFlags: u32 {
        const READ_OWNER = 0x4000;
        const WRITE_OWNER = 0x2000;
        const EXE_OWNER = 0x1000;
        /// Permissions of the user the helper runs as.
        const READ_USER = 0x0400;
        const WRITE_USER = 0x0200;
        const EXE_USER = 0x0100;
        const READ_GROUP = 0x0040;
        const WRITE_GROUP = 0x0020;
        const EXE_GROUP = 0x0010;
        const READ_OTHER = 0x0004;
        const WRITE_OTHER = 0x0002;
        const EXE_OTHER = 0x0001;

        const LINK_TYPE = 0x0001_0000;
        const FILE_TYPE = 0x0002_0000;
        const DIRECTORY_TYPE = 0x0004_0000;

        const LOCAL_DISK_FLAG = 0x2000_0000;
        const EXISTS_FLAG = 0x4000_0000;

        const PERMISSIONS_MASK = 0xffff;
        const TYPES_MASK = 0x000f_0000;
    }
}

const PERMISSION_MAP: [(u32, FileFlags); 9] = [
    (posix::S_IRUSR, FileFlags::READ_OWNER),
    (posix::S_IWUSR, FileFlags::WRITE_OWNER),
    (posix::S_IXUSR, FileFlags::EXE_OWNER),
    (posix::S_IRGRP, FileFlags::READ_GROUP),
    (posix::S_IWGRP, FileFlags::WRITE_GROUP),
    (posix::S_IXGRP, FileFlags::EXE_GROUP),
    (posix::S_IROTH, FileFlags::READ_OTHER),
    (posix::S_IWOTH, FileFlags::WRITE_OTHER),
    (posix::S_IXOTH, FileFlags::EXE_OTHER),
];

/// Map a helper mode word onto [`FileFlags`].
///
/// A zero word yields an empty set (the path does not exist); any other
/// result carries [`FileFlags::EXISTS_FLAG`].
pub fn file_flags_from_stat_mode(mode: u32) -> FileFlags {
    let mut flags = FileFlags::empty();
    if mode == 0 {
        return flags;
    }

    for (bit, flag) in PERMISSION_MAP {
        if mode & bit != 0 {
            flags |= flag;
        }
    }

    if mode & runtime::DIR != 0 {
        flags |= FileFlags::DIRECTORY_TYPE;
    }
    if mode & runtime::SYMLINK != 0 {
        flags |= FileFlags::LINK_TYPE;
    }
    if mode & runtime::DEVICE != 0 {
        flags |= FileFlags::LOCAL_DISK_FLAG;
    }
    if mode & runtime::TYPE_MASK == 0 {
        flags |= FileFlags::FILE_TYPE;
    }

    if !flags.is_empty() {
        flags |= FileFlags::EXISTS_FLAG;
    }
    flags
}

/// Map [`FileFlags`] permission bits back onto a POSIX mode (`0o777`).
pub fn stat_mode_from_permissions(flags: FileFlags) -> u32 {
    PERMISSION_MAP
        .iter()
        .filter(|(_, flag)| flags.contains(*flag))
        .fold(0, |mode, (bit, _)| mode | bit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_mode_is_empty() {
        assert_eq!(file_flags_from_stat_mode(0), FileFlags::empty());
    }

    #[test]
    fn directory_with_755() {
        let flags = file_flags_from_stat_mode(0o040755 | runtime::DIR);
        let expected = FileFlags::DIRECTORY_TYPE
            | FileFlags::READ_OWNER
            | FileFlags::WRITE_OWNER
            | FileFlags::EXE_OWNER
            | FileFlags::READ_GROUP
            | FileFlags::EXE_GROUP
            | FileFlags::READ_OTHER
            | FileFlags::EXE_OTHER
            | FileFlags::EXISTS_FLAG;
        assert_eq!(flags, expected);
        assert!(!flags.contains(FileFlags::FILE_TYPE));
    }

    #[test]
    fn regular_file_gets_file_type() {
        let flags = file_flags_from_stat_mode(0o644);
        assert!(flags.contains(FileFlags::FILE_TYPE));
        assert!(flags.contains(FileFlags::EXISTS_FLAG));
        assert!(!flags.contains(FileFlags::WRITE_GROUP));
    }

    #[test]
    fn symlink_is_not_a_regular_file() {
        let flags = file_flags_from_stat_mode(runtime::SYMLINK | 0o777);
        assert!(flags.contains(FileFlags::LINK_TYPE));
        assert!(!flags.contains(FileFlags::FILE_TYPE));
    }

    #[test]
    fn device_sets_local_disk() {
        let flags = file_flags_from_stat_mode(runtime::DEVICE | 0o600);
        assert!(flags.contains(FileFlags::LOCAL_DISK_FLAG));
        assert!(!flags.contains(FileFlags::FILE_TYPE));
    }

    #[test]
    fn pipes_and_sockets_are_not_files() {
        for bit in [
            runtime::NAMED_PIPE,
            runtime::SOCKET,
            runtime::CHAR_DEVICE,
            runtime::IRREGULAR,
        ] {
            let flags = file_flags_from_stat_mode(bit);
            assert!(!flags.contains(FileFlags::FILE_TYPE), "bit {bit:#x}");
            assert_eq!(flags, FileFlags::EXISTS_FLAG, "bit {bit:#x}");
        }
    }

    #[test]
    fn attribute_bits_alone_still_mean_a_file() {
        let flags = file_flags_from_stat_mode(runtime::STICKY);
        assert_eq!(flags, FileFlags::FILE_TYPE | FileFlags::EXISTS_FLAG);
    }

    #[test]
    fn nonzero_output_always_exists() {
        for mode in [1u32, 0o100, runtime::DIR, runtime::APPEND, 0xffff_ffff] {
            let flags = file_flags_from_stat_mode(mode);
            assert!(flags.contains(FileFlags::EXISTS_FLAG), "mode {mode:#x}");
        }
    }

    #[test]
    fn permissions_back_to_mode() {
        let flags = file_flags_from_stat_mode(0o750);
        assert_eq!(stat_mode_from_permissions(flags), 0o750);
    }
}
