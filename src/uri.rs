//! Script locators and the fixed well-known names of the autostart layout.

use std::fmt;

/// Prefix that addresses the embedded (in-process) database instance.
pub const EMBEDDED_SERVER_URI_PREFIX: &str = "xmldb:exist://";

/// Collection scanned for scripts on every startup.
pub const AUTOSTART_COLLECTION: &str = "/db/system/autostart";

/// Suffixes accepted as query scripts. Matching is case-sensitive.
pub const XQUERY_EXTENSIONS: [&str; 3] = [".xq", ".xquery", ".xqy"];

/// Returns true when `path` ends with one of [`XQUERY_EXTENSIONS`].
pub fn has_xquery_extension(path: &str) -> bool {
    XQUERY_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Fully qualified, scheme-prefixed location of a script.
///
/// Locators are only ever built from absolute database paths, so the part
/// after the prefix always starts with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptLocator(String);

impl ScriptLocator {
    /// Build a locator for an absolute database path. Returns `None` for
    /// relative paths.
    pub fn from_db_path(path: &str) -> Option<Self> {
        if path.starts_with('/') {
            Some(Self(format!("{}{}", EMBEDDED_SERVER_URI_PREFIX, path)))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The database path without the embedded-access prefix.
    pub fn db_path(&self) -> &str {
        self.0
            .strip_prefix(EMBEDDED_SERVER_URI_PREFIX)
            .unwrap_or(&self.0)
    }

    /// Everything before the last `/`, used as the module load path so a
    /// script can import its siblings by relative reference.
    pub fn module_load_path(&self) -> &str {
        substring_before_last(&self.0, '/')
    }
}

impl fmt::Display for ScriptLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ScriptLocator {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Substring before the last occurrence of `separator`, or the whole input
/// when the separator does not occur.
fn substring_before_last(value: &str, separator: char) -> &str {
    match value.rfind(separator) {
        Some(idx) => &value[..idx],
        None => value,
    }
}
