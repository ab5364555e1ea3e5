use crate::DirectoryError;

use std::fmt::{self, Debug, Display};

/// A wrapper type for symlink targets.
/// Disallows empty targets and those containing null bytes.
#[repr(transparent)]
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SymlinkTarget {
    inner: String,
}

impl SymlinkTarget {
    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl AsRef<str> for SymlinkTarget {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

impl From<SymlinkTarget> for String {
    fn from(value: SymlinkTarget) -> Self {
        value.inner
    }
}

impl TryFrom<String> for SymlinkTarget {
    type Error = DirectoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() || value.contains('\0') {
            return Err(DirectoryError::InvalidSymlinkTarget(value));
        }

        Ok(Self { inner: value })
    }
}

impl TryFrom<&str> for SymlinkTarget {
    type Error = DirectoryError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_owned())
    }
}

impl Debug for SymlinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}

impl Display for SymlinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}
