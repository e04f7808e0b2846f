//! Package name types and filesystem sanitization.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A validated package name, optionally scoped (`@scope/name`).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageName {
    scope: Option<String>,
    name: String,
}

impl PackageName {
    /// Parse and validate a package name.
    pub fn parse(raw: &str) -> crate::Result<Self> {
        if raw.is_empty() {
            return Err(crate::Error::InvalidName("name cannot be empty".to_string()));
        }
        if raw.len() > 214 {
            return Err(crate::Error::InvalidName(format!(
                "name too long: {} chars (max 214)",
                raw.len()
            )));
        }
        if !raw.is_ascii() {
            return Err(crate::Error::InvalidName(
                "name contains non-ASCII characters".to_string(),
            ));
        }

        let (scope, name) = match raw.strip_prefix('@') {
            Some(rest) => {
                let (scope, name) = rest.split_once('/').ok_or_else(|| {
                    crate::Error::InvalidName(format!("scoped name missing '/': {raw}"))
                })?;
                (Some(scope), name)
            }
            None => (None, raw),
        };

        if let Some(scope) = scope {
            Self::validate_segment(scope, raw)?;
        }
        Self::validate_segment(name, raw)?;

        Ok(Self {
            scope: scope.map(str::to_string),
            name: name.to_string(),
        })
    }

    fn validate_segment(segment: &str, raw: &str) -> crate::Result<()> {
        if segment.is_empty() {
            return Err(crate::Error::InvalidName(format!(
                "empty segment in name: {raw}"
            )));
        }
        if segment.starts_with('.') || segment == "node_modules" || segment == "favicon.ico" {
            return Err(crate::Error::InvalidName(format!(
                "reserved or hidden segment in name: {raw}"
            )));
        }
        for c in segment.chars() {
            if !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.') {
                return Err(crate::Error::InvalidName(format!(
                    "invalid character {c:?} in name: {raw}"
                )));
            }
        }
        Ok(())
    }

    /// Scope without the leading `@`, if the name is scoped.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Unscoped portion of the name.
    pub fn bare_name(&self) -> &str {
        &self.name
    }

    /// Relative storage path for this package.
    ///
    /// Scoped packages nest one directory deep (`@scope/name`); both
    /// segments are validated, so the result is always safe to join onto
    /// a storage root.
    pub fn storage_path(&self) -> String {
        match &self.scope {
            Some(scope) => format!("@{scope}/{}", self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "@{scope}/{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl fmt::Debug for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackageName({self})")
    }
}

impl TryFrom<String> for PackageName {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<PackageName> for String {
    fn from(value: PackageName) -> Self {
        value.to_string()
    }
}

impl std::str::FromStr for PackageName {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

/// Sanitize a tarball filename into a single safe path segment.
///
/// Rejects anything that could escape the package directory: path
/// separators, null bytes, `..`, and hidden-file prefixes.
pub fn sanitize_filename(raw: &str) -> crate::Result<String> {
    if raw.is_empty() {
        return Err(crate::Error::InvalidName(
            "filename cannot be empty".to_string(),
        ));
    }
    if raw.contains('/') || raw.contains('\\') || raw.contains('\0') {
        return Err(crate::Error::InvalidName(format!(
            "filename contains path separator or null byte: {raw:?}"
        )));
    }
    if raw == "." || raw == ".." || raw.starts_with('.') {
        return Err(crate::Error::InvalidName(format!(
            "filename is hidden or a path component: {raw}"
        )));
    }
    Ok(raw.to_string())
}

/// Extract the trailing filename from a tarball URL.
///
/// `https://registry/pkg/-/pkg-1.0.0.tgz` yields `pkg-1.0.0.tgz`.
pub fn filename_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let candidate = path.rsplit('/').next()?;
    sanitize_filename(candidate).ok()
}
