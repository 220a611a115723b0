//! Include/exclude filter parsing.
//!
//! A filter names a module, optionally restricted to one ABI and optionally
//! narrowed to a single test inside the module. Accepted forms:
//!
//! | Filter | abi | name | test |
//! |--------|-----|------|------|
//! | `CtsFoo` | - | `CtsFoo` | - |
//! | `CtsFoo#android.foo.BarTest#testBaz` | - | `CtsFoo` | `android.foo.BarTest#testBaz` |
//! | `CtsFoo android.foo.BarTest` | - | `CtsFoo` | `android.foo.BarTest` |
//! | `arm64-v8a CtsFoo` | `arm64-v8a` | `CtsFoo` | - |
//! | `arm64-v8a CtsFoo android.foo.BarTest` | `arm64-v8a` | `CtsFoo` | `android.foo.BarTest` |

use std::fmt;
use std::str::FromStr;

use crate::abi;

/// Errors produced while parsing a filter string.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("Could not parse filter: {0}")]
    Unparsable(String),
}

/// A parsed module/test filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestFilter {
    abi: Option<String>,
    name: String,
    test: Option<String>,
}

impl TestFilter {
    pub fn new(abi: Option<String>, name: impl Into<String>, test: Option<String>) -> Self {
        Self {
            abi,
            name: name.into(),
            test,
        }
    }

    /// The ABI this filter is restricted to, if any.
    pub fn abi(&self) -> Option<&str> {
        self.abi.as_deref()
    }

    /// The module name pattern.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The test identifier, if the filter targets a single test.
    pub fn test(&self) -> Option<&str> {
        self.test.as_deref()
    }
}

impl FromStr for TestFilter {
    type Err = FilterError;

    fn from_str(filter: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = filter.split_whitespace().collect();
        let (abi, name, test) = match parts.as_slice() {
            [single] => match single.split_once('#') {
                Some((name, test)) if !name.is_empty() && !test.is_empty() => {
                    (None, name.to_string(), Some(test.to_string()))
                }
                Some(_) => return Err(FilterError::Unparsable(filter.to_string())),
                None => (None, single.to_string(), None),
            },
            [first, second] if abi::is_supported(first) => {
                (Some(first.to_string()), second.to_string(), None)
            }
            [first, second] => (None, first.to_string(), Some(second.to_string())),
            [first, second, third] => (
                Some(first.to_string()),
                second.to_string(),
                Some(third.to_string()),
            ),
            _ => return Err(FilterError::Unparsable(filter.to_string())),
        };
        Ok(Self { abi, name, test })
    }
}

impl fmt::Display for TestFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(abi) = &self.abi {
            write!(f, "{} ", abi)?;
        }
        f.write_str(&self.name)?;
        if let Some(test) = &self.test {
            write!(f, " {}", test)?;
        }
        Ok(())
    }
}

/// Returns true if a test filter (`<package>`, `<package>.<class>`,
/// `<package>.<class>#<method>` or a native name) selects `test_id`.
pub fn test_matches(filter: &str, test_id: &str) -> bool {
    if test_id == filter {
        return true;
    }
    match test_id.strip_prefix(filter) {
        Some(rest) => rest.starts_with('#') || rest.starts_with('.'),
        None => false,
    }
}
