use std::fmt::Display;

/// Identifier the remote assigns to a file or folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DriveId(String);

impl DriveId {
    /// Alias the API accepts for the root folder of "My Drive".
    ///
    /// The real root id is only known after asking for the metadata of this alias.
    pub fn root() -> DriveId {
        DriveId(String::from("root"))
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DriveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DriveId {
    fn from(value: String) -> Self {
        DriveId(value)
    }
}

impl From<&String> for DriveId {
    fn from(value: &String) -> Self {
        DriveId(value.clone())
    }
}

impl From<&str> for DriveId {
    fn from(s: &str) -> Self {
        DriveId(s.to_string())
    }
}

impl From<DriveId> for String {
    fn from(value: DriveId) -> Self {
        value.0
    }
}

impl AsRef<str> for DriveId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
