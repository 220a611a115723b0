//! Module config file discovery and parsing.
//!
//! A module config is a small XML document:
//!
//! ```xml
//! <configuration description="Config for CTS Foo test cases">
//!     <target_preparer class="com.android.compatibility.common.tradefed.targetprep.TokenRequirement">
//!         <option name="token" value="sim-card" />
//!     </target_preparer>
//!     <test class="com.android.tradefed.testtype.HostTest">
//!         <option name="command" value="./run-foo.sh" />
//!     </test>
//! </configuration>
//! ```
//!
//! Only the structure is interpreted here: preparers and tests keep their
//! class name and their options in declaration order. What an option means is
//! up to the consumer (the repository reads `token`, the executor reads
//! `command`, `setup-command` and friends).

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

/// File name suffix of module config files.
pub const CONFIG_EXT: &str = ".config";

const CONFIGURATION_TAG: &[u8] = b"configuration";
const TARGET_PREPARER_TAG: &[u8] = b"target_preparer";
const TEST_TAG: &[u8] = b"test";
const OPTION_TAG: &[u8] = b"option";

const TOKEN_REQUIREMENT_CLASS: &str = "TokenRequirement";
const TOKEN_OPTION: &str = "token";

/// Errors raised while discovering or parsing module configs.
#[derive(Debug, thiserror::Error)]
pub enum ModuleConfigError {
    #[error("Failed to list module directory {path}: {source}")]
    ListDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error parsing config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid module config: {0}")]
    Syntax(String),
}

/// Ordered `name = value` options declared under a preparer or test.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(Vec<(String, String)>);

impl Options {
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value declared for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Every value declared for `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A setup/teardown step declared by a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPreparer {
    pub class: String,
    pub options: Options,
}

impl TargetPreparer {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            options: Options::default(),
        }
    }

    /// The token this preparer requires, if it is a token requirement.
    pub fn token(&self) -> Option<&str> {
        if self.class.ends_with(TOKEN_REQUIREMENT_CLASS) {
            self.options.get(TOKEN_OPTION)
        } else {
            None
        }
    }
}

/// A runnable test unit declared by a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestDecl {
    pub class: String,
    pub options: Options,
}

impl TestDecl {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            options: Options::default(),
        }
    }

    /// Fully qualified id of the test this declaration reports as.
    pub fn test_id(&self) -> String {
        format!("{}#{}", self.class, self.options.get("name").unwrap_or("run"))
    }
}

/// Parsed contents of one module config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleConfig {
    pub description: Option<String>,
    pub preparers: Vec<TargetPreparer>,
    pub tests: Vec<TestDecl>,
}

impl ModuleConfig {
    /// Tokens required by any preparer of this module.
    pub fn tokens(&self) -> BTreeSet<String> {
        self.preparers
            .iter()
            .filter_map(|p| p.token())
            .map(str::to_string)
            .collect()
    }
}

/// Returns true for file names that look like module configs.
pub fn is_config_file(name: &str) -> bool {
    name.ends_with(CONFIG_EXT) && name.len() > CONFIG_EXT.len()
}

/// Module name for a config file name (`CtsFoo.config` → `CtsFoo`).
pub fn module_name(file_name: &str) -> &str {
    file_name.strip_suffix(CONFIG_EXT).unwrap_or(file_name)
}

/// Lists the module config files directly inside `dir`, sorted by name.
pub fn list_config_files(dir: &Path) -> Result<Vec<PathBuf>, ModuleConfigError> {
    let list_err = |source| ModuleConfigError::ListDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(list_err)? {
        let entry = entry.map_err(list_err)?;
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if is_file && is_config_file(&entry.file_name().to_string_lossy()) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Reads and parses the module config at `path`.
pub fn load_module_config(path: &Path) -> Result<ModuleConfig, ModuleConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ModuleConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    parse_module_config(&content).map_err(|e| match e {
        ModuleConfigError::Syntax(reason) => ModuleConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        },
        other => other,
    })
}

enum Pending {
    Preparer(TargetPreparer),
    Test(TestDecl),
}

/// Parses module config XML.
pub fn parse_module_config(content: &str) -> Result<ModuleConfig, ModuleConfigError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut config = ModuleConfig::default();
    let mut seen_root = false;
    let mut depth = 0usize;
    let mut pending: Option<Pending> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| syntax(format!("at byte {}: {}", reader.buffer_position(), e)))?;

        match event {
            Event::Start(e) if !seen_root => {
                config.description = open_root(&e)?;
                seen_root = true;
                depth += 1;
            }
            Event::Empty(e) if !seen_root => {
                config.description = open_root(&e)?;
                seen_root = true;
            }
            Event::Start(e) => {
                depth += 1;
                open_element(&e, &mut pending)?;
            }
            Event::Empty(e) => {
                open_element(&e, &mut pending)?;
                // A self-closing preparer or test has no options to wait for.
                let name = e.name();
                if name.as_ref() == TARGET_PREPARER_TAG || name.as_ref() == TEST_TAG {
                    close_pending(&mut pending, &mut config);
                }
            }
            Event::End(e) => {
                depth = depth.saturating_sub(1);
                let name = e.name();
                if name.as_ref() == TARGET_PREPARER_TAG || name.as_ref() == TEST_TAG {
                    close_pending(&mut pending, &mut config);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(syntax("missing <configuration> element".to_string()));
    }
    if depth != 0 || pending.is_some() {
        return Err(syntax("unexpected end of file".to_string()));
    }
    Ok(config)
}

/// Checks the root element and returns its description.
fn open_root(e: &BytesStart<'_>) -> Result<Option<String>, ModuleConfigError> {
    if e.name().as_ref() != CONFIGURATION_TAG {
        return Err(syntax(format!(
            "expected <configuration> root, found <{}>",
            String::from_utf8_lossy(e.name().as_ref())
        )));
    }
    attribute(e, "description")
}

fn open_element(
    e: &BytesStart<'_>,
    pending: &mut Option<Pending>,
) -> Result<(), ModuleConfigError> {
    match e.name().as_ref() {
        TARGET_PREPARER_TAG => {
            if pending.is_some() {
                return Err(syntax("nested <target_preparer>".to_string()));
            }
            let class = required_attribute(e, "class")?;
            *pending = Some(Pending::Preparer(TargetPreparer::new(class)));
        }
        TEST_TAG => {
            if pending.is_some() {
                return Err(syntax("nested <test>".to_string()));
            }
            let class = required_attribute(e, "class")?;
            *pending = Some(Pending::Test(TestDecl::new(class)));
        }
        OPTION_TAG => {
            // Options outside a preparer or test configure the harness itself.
            if let Some(current) = pending.as_mut() {
                let name = required_attribute(e, "name")?;
                let value = attribute(e, "value")?.unwrap_or_default();
                match current {
                    Pending::Preparer(p) => p.options.push(name, value),
                    Pending::Test(t) => t.options.push(name, value),
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn close_pending(pending: &mut Option<Pending>, config: &mut ModuleConfig) {
    match pending.take() {
        Some(Pending::Preparer(p)) => config.preparers.push(p),
        Some(Pending::Test(t)) => config.tests.push(t),
        None => {}
    }
}

fn attribute(e: &BytesStart<'_>, key: &str) -> Result<Option<String>, ModuleConfigError> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| syntax(err.to_string()))?;
        if attr.key.as_ref() == key.as_bytes() {
            let value = attr.unescape_value().map_err(|err| syntax(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn required_attribute(e: &BytesStart<'_>, key: &str) -> Result<String, ModuleConfigError> {
    attribute(e, key)?.ok_or_else(|| {
        syntax(format!(
            "<{}> is missing the '{}' attribute",
            String::from_utf8_lossy(e.name().as_ref()),
            key
        ))
    })
}

fn syntax(reason: String) -> ModuleConfigError {
    ModuleConfigError::Syntax(reason)
}
