//! Module descriptors.
//!
//! A [`ModuleDef`] is one module config instantiated for one ABI. It owns the
//! ordered test declarations and target preparers from the config plus the
//! test-level filters the repository attached while applying include/exclude
//! filters. Once the repository publishes a definition it is shared behind an
//! `Arc` and never mutated again.

pub mod config;

use std::cmp::Ordering;
use std::collections::BTreeSet;

use regex::Regex;

use crate::abi::{self, Abi};
use crate::filter;

pub use config::{ModuleConfig, ModuleConfigError, Options, TargetPreparer, TestDecl};

/// One test module for one ABI.
#[derive(Debug, Clone)]
pub struct ModuleDef {
    id: String,
    name: String,
    abi: Abi,
    tests: Vec<TestDecl>,
    preparers: Vec<TargetPreparer>,
    tokens: BTreeSet<String>,
    include_filters: Vec<String>,
    exclude_filters: Vec<String>,
}

impl ModuleDef {
    pub fn new(
        name: impl Into<String>,
        abi: Abi,
        tests: Vec<TestDecl>,
        preparers: Vec<TargetPreparer>,
    ) -> Self {
        let name = name.into();
        let tokens = preparers
            .iter()
            .filter_map(|p| p.token())
            .map(str::to_string)
            .collect();
        Self {
            id: abi::create_id(abi.name(), &name),
            name,
            abi,
            tests,
            preparers,
            tokens,
            include_filters: Vec::new(),
            exclude_filters: Vec::new(),
        }
    }

    /// Builds a definition from a parsed config.
    pub fn from_config(name: impl Into<String>, abi: Abi, config: &ModuleConfig) -> Self {
        Self::new(name, abi, config.tests.clone(), config.preparers.clone())
    }

    /// Composite `"{abi} {name}"` id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn abi(&self) -> &Abi {
        &self.abi
    }

    pub fn tests(&self) -> &[TestDecl] {
        &self.tests
    }

    pub fn preparers(&self) -> &[TargetPreparer] {
        &self.preparers
    }

    /// Tokens a device must hold to run this module.
    pub fn tokens(&self) -> &BTreeSet<String> {
        &self.tokens
    }

    pub fn requires_tokens(&self) -> bool {
        !self.tokens.is_empty()
    }

    pub fn include_filters(&self) -> &[String] {
        &self.include_filters
    }

    pub fn exclude_filters(&self) -> &[String] {
        &self.exclude_filters
    }

    pub(crate) fn add_include_filter(&mut self, test: impl Into<String>) {
        self.include_filters.push(test.into());
    }

    pub(crate) fn add_exclude_filter(&mut self, test: impl Into<String>) {
        self.exclude_filters.push(test.into());
    }

    /// Whether the module's test filters let `test_id` run.
    pub fn is_test_selected(&self, test_id: &str) -> bool {
        let included = self.include_filters.is_empty()
            || self
                .include_filters
                .iter()
                .any(|f| filter::test_matches(f, test_id));
        included
            && !self
                .exclude_filters
                .iter()
                .any(|f| filter::test_matches(f, test_id))
    }

    /// Whether the module name matches `pattern`. Build the pattern with
    /// [`name_pattern`] to require a whole-name match.
    pub fn name_matches(&self, pattern: &Regex) -> bool {
        pattern.is_match(&self.name)
    }
}

/// Compiles a module-name regex that must match the entire name.
pub fn name_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

impl PartialEq for ModuleDef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ModuleDef {}

impl PartialOrd for ModuleDef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ModuleDef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.abi.name().cmp(other.abi.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_preparer(token: &str) -> TargetPreparer {
        let mut preparer = TargetPreparer::new(
            "com.android.compatibility.common.tradefed.targetprep.TokenRequirement",
        );
        preparer.options.push("token", token);
        preparer
    }

    #[test]
    fn test_accessors() {
        let abi = Abi::new("mips64", "64");
        let module = ModuleDef::new(
            "ModuleName",
            abi.clone(),
            vec![TestDecl::new("android.test.FooBar")],
            vec![token_preparer("sim-card")],
        );
        assert_eq!(module.id(), "mips64 ModuleName");
        assert_eq!(module.name(), "ModuleName");
        assert_eq!(module.abi(), &abi);
        assert_eq!(module.tests().len(), 1);
        assert!(module.requires_tokens());
        assert!(module.tokens().contains("sim-card"));
    }

    #[test]
    fn test_name_matches_is_anchored() -> Result<(), Box<dyn std::error::Error>> {
        let module = ModuleDef::new("CtsFooTestCases", Abi::new("x86", "32"), vec![], vec![]);
        assert!(module.name_matches(&name_pattern("CtsFoo.*")?));
        assert!(module.name_matches(&name_pattern("CtsFooTestCases")?));
        assert!(module.name_matches(&name_pattern("CtsBar|CtsFooTestCases")?));
        assert!(!module.name_matches(&name_pattern("CtsFoo")?));
        assert!(!module.name_matches(&name_pattern("Foo.*")?));
        Ok(())
    }

    #[test]
    fn test_test_selection() {
        let mut module = ModuleDef::new("CtsFoo", Abi::new("x86", "32"), vec![], vec![]);
        assert!(module.is_test_selected("android.foo.A#test1"));

        module.add_include_filter("android.foo.A");
        assert!(module.is_test_selected("android.foo.A#test1"));
        assert!(!module.is_test_selected("android.foo.B#test1"));

        module.add_exclude_filter("android.foo.A#test2");
        assert!(module.is_test_selected("android.foo.A#test1"));
        assert!(!module.is_test_selected("android.foo.A#test2"));
    }

    #[test]
    fn test_ordering_by_name_then_abi() {
        let a64 = ModuleDef::new("A", Abi::new("arm64-v8a", "64"), vec![], vec![]);
        let a32 = ModuleDef::new("A", Abi::new("armeabi-v7a", "32"), vec![], vec![]);
        let b = ModuleDef::new("B", Abi::new("arm64-v8a", "64"), vec![], vec![]);
        let mut modules = vec![b.clone(), a32.clone(), a64.clone()];
        modules.sort();
        assert_eq!(modules, vec![a64, a32, b]);
    }
}
