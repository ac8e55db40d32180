use fuser::{FileAttr, FileType};

use crate::store::{Entry, EntryKind};

const BLOCK_SIZE: u32 = 4096;

pub(crate) fn file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::Directory => FileType::Directory,
        EntryKind::File => FileType::RegularFile,
    }
}

pub(crate) fn file_attr(entry: &Entry, uid: u32, gid: u32) -> FileAttr {
    FileAttr {
        ino: entry.id.ino(),
        size: entry.size,
        blocks: (entry.size + 511) / 512,
        atime: entry.atime,
        mtime: entry.mtime,
        ctime: entry.ctime,
        crtime: entry.ctime,
        kind: file_type(entry.kind),
        perm: (entry.mode & 0o7777) as u16,
        nlink: if entry.is_dir() { 2 } else { 1 },
        uid,
        gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}
