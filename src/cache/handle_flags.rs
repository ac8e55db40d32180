use tracing::trace;

/// Access mode requested when a file is opened.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
enum Access {
    #[default]
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Open flags of a cache handle, decoded from the `open(2)` flag word.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct HandleFlags {
    access: Access,
    /// writes always go to the end of the file
    append: bool,
    /// the file is cut to zero length on open
    truncate: bool,
}

impl HandleFlags {
    pub fn read_only() -> Self {
        Self::default()
    }
    pub fn read_write() -> Self {
        Self {
            access: Access::ReadWrite,
            ..Self::default()
        }
    }
    pub fn can_read(&self) -> bool {
        matches!(self.access, Access::ReadOnly | Access::ReadWrite)
    }
    pub fn can_write(&self) -> bool {
        matches!(self.access, Access::WriteOnly | Access::ReadWrite)
    }
    pub fn append(&self) -> bool {
        self.append
    }
    pub fn truncate(&self) -> bool {
        self.truncate
    }
}

impl From<i32> for HandleFlags {
    fn from(value: i32) -> Self {
        let access = match value & libc::O_ACCMODE {
            libc::O_WRONLY => Access::WriteOnly,
            libc::O_RDWR => Access::ReadWrite,
            _ => Access::ReadOnly,
        };
        let flags = Self {
            access,
            append: value & libc::O_APPEND != 0,
            truncate: value & libc::O_TRUNC != 0,
        };
        trace!("open flags {:#x} => {:?}", value, flags);
        flags
    }
}
