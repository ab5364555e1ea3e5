//! Contains data structures to deal with directory entry names in the kiln-castore model.
use std::fmt::{self, Debug, Display};

use crate::DirectoryError;

/// A wrapper type for validated directory entry names.
/// Disallows slashes and null bytes to be present, as well as
/// '.', '..' and the empty string.
#[repr(transparent)]
#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PathComponent {
    inner: String,
}

pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != ".." && name != "." && !name.contains(['\0', '/'])
}

impl PathComponent {
    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl AsRef<str> for PathComponent {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

impl AsRef<std::path::Path> for PathComponent {
    fn as_ref(&self) -> &std::path::Path {
        std::path::Path::new(&self.inner)
    }
}

impl From<PathComponent> for String {
    fn from(value: PathComponent) -> Self {
        value.inner
    }
}

impl TryFrom<String> for PathComponent {
    type Error = DirectoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if !is_valid_name(&value) {
            return Err(DirectoryError::InvalidName(value));
        }

        Ok(Self { inner: value })
    }
}

impl TryFrom<&str> for PathComponent {
    type Error = DirectoryError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_owned())
    }
}

impl TryFrom<&std::ffi::OsStr> for PathComponent {
    type Error = DirectoryError;

    fn try_from(value: &std::ffi::OsStr) -> Result<Self, Self::Error> {
        match value.to_str() {
            Some(s) => Self::try_from(s),
            None => Err(DirectoryError::InvalidName(
                value.to_string_lossy().into_owned(),
            )),
        }
    }
}

impl Debug for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}

impl Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}
