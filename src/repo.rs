//! Module repository: discovery, filtering and sharding.
//!
//! The repository loads every module config in the tests directory once per
//! requested ABI, applies include/exclude filters, and then hands out shards
//! to device serials on request.
//!
//! # Sharding
//!
//! ```text
//!   modules (sorted) ──┬── token-gated ──► serial holding every required token
//!                      │
//!                      └── free ─────────► next serial, up to modules_per_shard
//!                                          (the last shard takes the rest)
//! ```
//!
//! `modules_per_shard = ceil(total / num_shards)`. A shard is computed the
//! first time a serial asks for it and remembered, so each module ends up in
//! at most one shard. Token-gated modules nobody can run stay in the
//! unassigned pool.
//!
//! # Example
//!
//! ```no_run
//! use std::collections::BTreeSet;
//! use std::path::Path;
//! use compat_suite::abi::Abi;
//! use compat_suite::repo::ModuleRepo;
//!
//! let abis: BTreeSet<Abi> = [Abi::new("arm64-v8a", "64")].into_iter().collect();
//! let tokens = vec!["device-2:sim-card".to_string()];
//! let mut repo = ModuleRepo::load(2, Path::new("testcases"), &abis, &tokens, &[], &[])?;
//! let shard = repo.get_modules("device-1");
//! println!("device-1 runs {} modules", shard.len());
//! # Ok::<(), compat_suite::repo::RepoError>(())
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::abi::Abi;
use crate::filter::{FilterError, TestFilter};
use crate::module::config::{self, ModuleConfigError};
use crate::module::{self, ModuleDef};

/// Result type for repository operations.
pub type RepoResult<T> = Result<T, RepoError>;

/// Errors raised while initializing or querying the repository.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("Number of shards must be at least 1")]
    InvalidShardCount,

    #[error(transparent)]
    Config(#[from] ModuleConfigError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("Invalid module pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("No modules matching {0}. Use 'list modules' to see available modules.")]
    NoModulesMatching(String),
}

/// Shared handle to a module definition.
pub type ModuleRef = Arc<ModuleDef>;

/// Explicitly owned module repository.
#[derive(Debug, Default)]
pub struct ModuleRepo {
    initialized: bool,
    num_shards: usize,
    modules_per_shard: usize,
    abis: BTreeSet<Abi>,
    modules: BTreeMap<String, ModuleRef>,
    remaining: Vec<ModuleRef>,
    remaining_with_tokens: Vec<ModuleRef>,
    device_tokens: BTreeMap<String, BTreeSet<String>>,
    assignments: BTreeMap<String, Vec<ModuleRef>>,
}

impl ModuleRepo {
    /// Creates and initializes a repository in one step.
    pub fn load(
        num_shards: usize,
        tests_dir: &Path,
        abis: &BTreeSet<Abi>,
        device_tokens: &[String],
        include_filters: &[String],
        exclude_filters: &[String],
    ) -> RepoResult<Self> {
        let mut repo = Self::default();
        repo.initialize(
            num_shards,
            tests_dir,
            abis,
            device_tokens,
            include_filters,
            exclude_filters,
        )?;
        Ok(repo)
    }

    /// Loads modules from `tests_dir` and prepares the shard plan.
    ///
    /// Calling this again discards all previous state, including shards
    /// already handed out. On error the repository is left uninitialized.
    pub fn initialize(
        &mut self,
        num_shards: usize,
        tests_dir: &Path,
        abis: &BTreeSet<Abi>,
        device_tokens: &[String],
        include_filters: &[String],
        exclude_filters: &[String],
    ) -> RepoResult<()> {
        *self = Self::default();
        if num_shards == 0 {
            return Err(RepoError::InvalidShardCount);
        }

        let device_tokens = parse_device_tokens(device_tokens);
        let all = load_modules(tests_dir, abis)?;
        let selected = apply_filters(&all, include_filters, exclude_filters)?;

        let mut sorted: Vec<ModuleDef> = selected.into_values().collect();
        sorted.sort();

        let mut modules = BTreeMap::new();
        let mut remaining = Vec::new();
        let mut remaining_with_tokens = Vec::new();
        for def in sorted {
            let def = Arc::new(def);
            modules.insert(def.id().to_string(), Arc::clone(&def));
            if def.requires_tokens() {
                remaining_with_tokens.push(def);
            } else {
                remaining.push(def);
            }
        }

        for def in &remaining_with_tokens {
            let satisfiable = device_tokens
                .values()
                .any(|tokens| def.tokens().is_subset(tokens));
            if !satisfiable {
                warn!(
                    "Module {} requires tokens {:?} that no device holds; it will not be scheduled",
                    def.id(),
                    def.tokens()
                );
            }
        }

        self.num_shards = num_shards;
        self.modules_per_shard = modules.len().div_ceil(num_shards);
        self.abis = abis.clone();
        self.modules = modules;
        self.remaining = remaining;
        self.remaining_with_tokens = remaining_with_tokens;
        self.device_tokens = device_tokens;
        self.initialized = true;

        info!(
            "Loaded {} modules ({} token-gated) into {} shards of up to {}",
            self.modules.len(),
            self.remaining_with_tokens.len(),
            self.num_shards,
            self.modules_per_shard
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn get_number_of_shards(&self) -> usize {
        self.num_shards
    }

    pub fn get_modules_per_shard(&self) -> usize {
        self.modules_per_shard
    }

    /// Device serial → tokens held, as parsed from the `serial:token` list.
    pub fn get_device_tokens(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.device_tokens
    }

    /// Serials that have been handed a shard.
    pub fn get_serials(&self) -> BTreeSet<String> {
        self.assignments.keys().cloned().collect()
    }

    /// Free modules not yet assigned to any serial.
    pub fn get_remaining_modules(&self) -> &[ModuleRef] {
        &self.remaining
    }

    /// Token-gated modules not yet assigned to any serial.
    pub fn get_remaining_with_tokens(&self) -> &[ModuleRef] {
        &self.remaining_with_tokens
    }

    /// Returns the shard for `serial`, computing it on first request.
    ///
    /// The shard holds every unassigned token-gated module whose tokens the
    /// serial holds, then free modules up to `modules_per_shard`. The last of
    /// the `num_shards` serials takes every remaining free module.
    pub fn get_modules(&mut self, serial: &str) -> Vec<ModuleRef> {
        if let Some(shard) = self.assignments.get(serial) {
            return shard.clone();
        }

        let mut shard = Vec::new();
        if let Some(tokens) = self.device_tokens.get(serial) {
            let (mine, rest): (Vec<ModuleRef>, Vec<ModuleRef>) = self
                .remaining_with_tokens
                .drain(..)
                .partition(|def| def.tokens().is_subset(tokens));
            self.remaining_with_tokens = rest;
            shard.extend(mine);
        }

        let is_last = self.assignments.len() + 1 >= self.num_shards;
        let take = if is_last {
            self.remaining.len()
        } else {
            self.modules_per_shard
                .saturating_sub(shard.len())
                .min(self.remaining.len())
        };
        shard.extend(self.remaining.drain(..take));
        shard.sort();

        debug!(
            "Assigned {} modules to {}: {:?}",
            shard.len(),
            serial,
            shard.iter().map(|m| m.id()).collect::<Vec<_>>()
        );
        self.assignments.insert(serial.to_string(), shard.clone());
        shard
    }

    /// Hands out shards to `serials` in order.
    pub fn assign_all(&mut self, serials: &[String]) -> BTreeMap<String, Vec<ModuleRef>> {
        serials
            .iter()
            .map(|serial| (serial.clone(), self.get_modules(serial)))
            .collect()
    }

    pub fn get_module(&self, id: &str) -> Option<&ModuleRef> {
        self.modules.get(id)
    }

    /// Every selected module keyed by id.
    pub fn modules(&self) -> &BTreeMap<String, ModuleRef> {
        &self.modules
    }

    pub fn abis(&self) -> &BTreeSet<Abi> {
        &self.abis
    }

    /// Sorted module ids.
    pub fn get_module_ids(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    /// Sorted, de-duplicated module names.
    pub fn get_module_names(&self) -> Vec<String> {
        self.modules
            .values()
            .map(|m| m.name().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Modules grouped by name, one entry per ABI.
    pub fn get_modules_by_name(&self) -> BTreeMap<String, Vec<ModuleRef>> {
        let mut by_name: BTreeMap<String, Vec<ModuleRef>> = BTreeMap::new();
        for def in self.modules.values() {
            by_name
                .entry(def.name().to_string())
                .or_default()
                .push(Arc::clone(def));
        }
        by_name
    }

    /// Names of modules whose whole name matches `pattern`.
    pub fn get_modules_matching(&self, pattern: &str) -> RepoResult<BTreeSet<String>> {
        let regex = compile(pattern)?;
        Ok(self
            .modules
            .values()
            .filter(|m| m.name_matches(&regex))
            .map(|m| m.name().to_string())
            .collect())
    }
}

/// Parses `serial:token` entries. Malformed entries are skipped.
pub fn parse_device_tokens(entries: &[String]) -> BTreeMap<String, BTreeSet<String>> {
    let mut tokens: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for entry in entries {
        match entry.split_once(':') {
            Some((serial, token)) if !serial.trim().is_empty() && !token.trim().is_empty() => {
                tokens
                    .entry(serial.trim().to_string())
                    .or_default()
                    .insert(token.trim().to_string());
            }
            _ => warn!("Ignoring malformed device token '{}', expected serial:token", entry),
        }
    }
    tokens
}

/// Loads every config in `tests_dir` once per ABI.
fn load_modules(tests_dir: &Path, abis: &BTreeSet<Abi>) -> RepoResult<BTreeMap<String, ModuleDef>> {
    let mut all = BTreeMap::new();
    for path in config::list_config_files(tests_dir)? {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = config::module_name(&file_name).to_string();
        let parsed = config::load_module_config(&path)?;
        debug!(
            "Parsed {} ({} preparers, {} tests)",
            path.display(),
            parsed.preparers.len(),
            parsed.tests.len()
        );
        for abi in abis {
            let def = ModuleDef::from_config(name.clone(), abi.clone(), &parsed);
            all.insert(def.id().to_string(), def);
        }
    }
    Ok(all)
}

/// Applies include and exclude filters to the loaded modules.
fn apply_filters(
    all: &BTreeMap<String, ModuleDef>,
    include_filters: &[String],
    exclude_filters: &[String],
) -> RepoResult<BTreeMap<String, ModuleDef>> {
    // None: the whole module is included. Some: only the listed tests.
    let mut included: BTreeMap<String, Option<Vec<String>>> = BTreeMap::new();
    if include_filters.is_empty() {
        included.extend(all.keys().map(|id| (id.clone(), None)));
    }
    for text in include_filters {
        let filter: TestFilter = text.parse()?;
        let ids = matching_ids(all, &filter)?;
        if ids.is_empty() {
            return Err(RepoError::NoModulesMatching(text.clone()));
        }
        for id in ids {
            match (filter.test(), included.get_mut(&id)) {
                (None, _) => {
                    included.insert(id, None);
                }
                (Some(test), Some(Some(tests))) => tests.push(test.to_string()),
                (Some(_), Some(None)) => {}
                (Some(test), None) => {
                    included.insert(id, Some(vec![test.to_string()]));
                }
            }
        }
    }

    let mut selected = BTreeMap::new();
    for (id, tests) in included {
        let Some(def) = all.get(&id) else { continue };
        let mut def = def.clone();
        for test in tests.unwrap_or_default() {
            def.add_include_filter(test);
        }
        selected.insert(id, def);
    }

    for text in exclude_filters {
        let filter: TestFilter = text.parse()?;
        let ids = matching_ids(all, &filter)?;
        if ids.is_empty() {
            warn!("Exclude filter '{}' matches no modules", text);
        }
        for id in ids {
            match filter.test() {
                Some(test) => {
                    if let Some(def) = selected.get_mut(&id) {
                        def.add_exclude_filter(test);
                    }
                }
                None => {
                    selected.remove(&id);
                }
            }
        }
    }
    Ok(selected)
}

fn matching_ids(all: &BTreeMap<String, ModuleDef>, filter: &TestFilter) -> RepoResult<Vec<String>> {
    let regex = compile(filter.name())?;
    Ok(all
        .values()
        .filter(|m| m.name_matches(&regex))
        .filter(|m| filter.abi().is_none_or(|abi| m.abi().name() == abi))
        .map(|m| m.id().to_string())
        .collect())
}

fn compile(pattern: &str) -> RepoResult<regex::Regex> {
    module::name_pattern(pattern).map_err(|source| RepoError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const TOKEN: &str = "<target_preparer class=\"com.android.compatibility.common.tradefed.targetprep.TokenRequirement\">\n\
         <option name=\"token\" value=\"{token}\" />\n\
         </target_preparer>\n";
    const CONFIG: &str = "<configuration description=\"Auto Generated File\">\n\
         {preparer}\
         <test class=\"com.android.tradefed.testtype.AndroidJUnitTest\" />\n\
         </configuration>";
    const FOOBAR_TOKEN: &str = "foobar";
    const SERIAL1: &str = "abc";
    const SERIAL2: &str = "def";
    const SERIAL3: &str = "ghi";

    fn abis() -> BTreeSet<Abi> {
        [Abi::new("armeabi-v7a", "32"), Abi::new("arm64-v8a", "64")]
            .into_iter()
            .collect()
    }

    fn create_config(dir: &Path, name: &str, token: Option<&str>) {
        let preparer = token
            .map(|t| TOKEN.replace("{token}", t))
            .unwrap_or_default();
        let content = CONFIG.replace("{preparer}", &preparer);
        fs::write(dir.join(format!("{}.config", name)), content).unwrap();
    }

    fn set_up_configs() -> TempDir {
        let dir = TempDir::new().unwrap();
        create_config(dir.path(), "One", None);
        create_config(dir.path(), "Two", None);
        create_config(dir.path(), "Three", Some(FOOBAR_TOKEN));
        dir
    }

    fn device_tokens() -> Vec<String> {
        vec![format!("{}:{}", SERIAL3, FOOBAR_TOKEN)]
    }

    #[test]
    fn test_initialization() -> Result<(), Box<dyn std::error::Error>> {
        let dir = set_up_configs();
        let mut repo = ModuleRepo::default();
        assert!(!repo.is_initialized());
        repo.initialize(3, dir.path(), &abis(), &device_tokens(), &[], &[])?;

        assert!(repo.is_initialized());
        assert_eq!(repo.get_number_of_shards(), 3);
        assert_eq!(repo.get_modules_per_shard(), 2);

        let device_tokens = repo.get_device_tokens();
        assert_eq!(device_tokens.len(), 1);
        let tokens = &device_tokens[SERIAL3];
        assert_eq!(tokens.len(), 1);
        assert!(tokens.contains(FOOBAR_TOKEN));

        assert_eq!(repo.get_remaining_modules().len(), 4);
        assert_eq!(repo.get_remaining_with_tokens().len(), 2);

        assert_eq!(repo.get_modules(SERIAL1).len(), 2);
        assert_eq!(repo.get_modules(SERIAL2).len(), 2);
        let serial3 = repo.get_modules(SERIAL3);
        assert_eq!(serial3.len(), 2);
        for module in &serial3 {
            assert_eq!(module.name(), "Three");
        }

        let serials = repo.get_serials();
        assert_eq!(serials.len(), 3);
        for serial in [SERIAL1, SERIAL2, SERIAL3] {
            assert!(serials.contains(serial));
        }
        assert!(repo.get_remaining_modules().is_empty());
        assert!(repo.get_remaining_with_tokens().is_empty());
        Ok(())
    }

    #[test]
    fn test_token_modules_only_go_to_token_holder() -> Result<(), Box<dyn std::error::Error>> {
        let dir = set_up_configs();
        let mut repo = ModuleRepo::load(3, dir.path(), &abis(), &device_tokens(), &[], &[])?;

        // The token holder asks first and must not be handed free modules
        // beyond its share.
        let serial3 = repo.get_modules(SERIAL3);
        assert!(serial3.iter().all(|m| m.name() == "Three"));
        let serial1 = repo.get_modules(SERIAL1);
        let serial2 = repo.get_modules(SERIAL2);
        assert!(serial1.iter().chain(&serial2).all(|m| !m.requires_tokens()));
        assert_eq!(serial1.len() + serial2.len(), 4);
        Ok(())
    }

    #[test]
    fn test_repeat_request_returns_same_shard() -> Result<(), Box<dyn std::error::Error>> {
        let dir = set_up_configs();
        let mut repo = ModuleRepo::load(3, dir.path(), &abis(), &device_tokens(), &[], &[])?;
        let first = repo.get_modules(SERIAL1);
        let again = repo.get_modules(SERIAL1);
        assert_eq!(first, again);
        assert_eq!(repo.get_remaining_modules().len(), 2);
        Ok(())
    }

    #[test]
    fn test_partition_properties() -> Result<(), Box<dyn std::error::Error>> {
        let one_abi: BTreeSet<Abi> = [Abi::new("x86", "32")].into_iter().collect();
        for modules in 0..=7usize {
            let dir = TempDir::new()?;
            for i in 0..modules {
                create_config(dir.path(), &format!("Module{}", i), None);
            }
            for shards in 1..=5usize {
                let mut repo = ModuleRepo::load(shards, dir.path(), &one_abi, &[], &[], &[])?;
                assert_eq!(repo.get_modules_per_shard(), modules.div_ceil(shards));

                let serials: Vec<String> = (0..shards).map(|i| format!("serial{}", i)).collect();
                let assigned = repo.assign_all(&serials);
                assert_eq!(assigned.len(), shards);

                let mut seen = BTreeSet::new();
                let mut total = 0;
                for shard in assigned.values() {
                    total += shard.len();
                    for module in shard {
                        assert!(seen.insert(module.id().to_string()), "module in two shards");
                    }
                }
                assert_eq!(total, modules);
                assert_eq!(seen.len(), modules);
            }
        }
        Ok(())
    }

    #[test]
    fn test_zero_modules() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let mut repo = ModuleRepo::load(4, dir.path(), &abis(), &[], &[], &[])?;
        assert_eq!(repo.get_modules_per_shard(), 0);
        let serials: Vec<String> = (0..4).map(|i| i.to_string()).collect();
        let assigned = repo.assign_all(&serials);
        assert_eq!(assigned.len(), 4);
        assert!(assigned.values().all(|s| s.is_empty()));
        Ok(())
    }

    #[test]
    fn test_unsatisfiable_tokens_stay_unassigned() -> Result<(), Box<dyn std::error::Error>> {
        let dir = set_up_configs();
        let mut repo = ModuleRepo::load(3, dir.path(), &abis(), &[], &[], &[])?;
        let serials = vec![SERIAL1.to_string(), SERIAL2.to_string(), SERIAL3.to_string()];
        let assigned = repo.assign_all(&serials);
        let total: usize = assigned.values().map(Vec::len).sum();
        assert_eq!(total, 4);
        assert_eq!(repo.get_remaining_with_tokens().len(), 2);
        Ok(())
    }

    #[test]
    fn test_reinitialize_resets_state() -> Result<(), Box<dyn std::error::Error>> {
        let dir = set_up_configs();
        let mut repo = ModuleRepo::load(3, dir.path(), &abis(), &device_tokens(), &[], &[])?;
        repo.get_modules(SERIAL1);
        repo.initialize(2, dir.path(), &abis(), &device_tokens(), &[], &[])?;
        assert!(repo.get_serials().is_empty());
        assert_eq!(repo.get_number_of_shards(), 2);
        assert_eq!(repo.get_modules_per_shard(), 3);
        assert_eq!(repo.get_remaining_modules().len(), 4);
        Ok(())
    }

    #[test]
    fn test_invalid_inputs() {
        let dir = set_up_configs();
        assert!(matches!(
            ModuleRepo::load(0, dir.path(), &abis(), &[], &[], &[]),
            Err(RepoError::InvalidShardCount)
        ));
        assert!(matches!(
            ModuleRepo::load(1, &dir.path().join("missing"), &abis(), &[], &[], &[]),
            Err(RepoError::Config(ModuleConfigError::ListDir { .. }))
        ));

        fs::write(dir.path().join("Bad.config"), "<configuration><test>").unwrap();
        match ModuleRepo::load(1, dir.path(), &abis(), &[], &[], &[]) {
            Err(RepoError::Config(ModuleConfigError::Parse { path, .. })) => {
                assert!(path.ends_with("Bad.config"));
            }
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_include_and_exclude_filters() -> Result<(), Box<dyn std::error::Error>> {
        let dir = set_up_configs();

        let includes = vec!["One".to_string(), "arm64-v8a Two".to_string()];
        let repo = ModuleRepo::load(1, dir.path(), &abis(), &[], &includes, &[])?;
        assert_eq!(
            repo.get_module_ids(),
            vec!["arm64-v8a One", "arm64-v8a Two", "armeabi-v7a One"]
        );

        let excludes = vec!["T.*".to_string()];
        let repo = ModuleRepo::load(1, dir.path(), &abis(), &[], &[], &excludes)?;
        assert_eq!(repo.get_module_names(), vec!["One"]);

        let includes = vec!["One#android.foo.A".to_string()];
        let excludes = vec!["One android.foo.A#testSlow".to_string()];
        let repo = ModuleRepo::load(1, dir.path(), &abis(), &[], &includes, &excludes)?;
        let one = repo.get_module("arm64-v8a One").expect("module present");
        assert_eq!(one.include_filters(), ["android.foo.A"]);
        assert_eq!(one.exclude_filters(), ["android.foo.A#testSlow"]);
        assert!(one.is_test_selected("android.foo.A#testFast"));
        assert!(!one.is_test_selected("android.foo.A#testSlow"));
        assert!(!one.is_test_selected("android.foo.B#testFast"));
        Ok(())
    }

    #[test]
    fn test_whole_module_include_wins() -> Result<(), Box<dyn std::error::Error>> {
        let dir = set_up_configs();
        let includes = vec!["One android.foo.A".to_string(), "One".to_string()];
        let repo = ModuleRepo::load(1, dir.path(), &abis(), &[], &includes, &[])?;
        let one = repo.get_module("armeabi-v7a One").expect("module present");
        assert!(one.include_filters().is_empty());
        Ok(())
    }

    #[test]
    fn test_include_matching_nothing_fails() {
        let dir = set_up_configs();
        let includes = vec!["Nope".to_string()];
        assert!(matches!(
            ModuleRepo::load(1, dir.path(), &abis(), &[], &includes, &[]),
            Err(RepoError::NoModulesMatching(_))
        ));
    }

    #[test]
    fn test_module_queries() -> Result<(), Box<dyn std::error::Error>> {
        let dir = set_up_configs();
        let repo = ModuleRepo::load(1, dir.path(), &abis(), &[], &[], &[])?;
        assert_eq!(repo.get_module_names(), vec!["One", "Three", "Two"]);
        assert_eq!(repo.get_module_ids().len(), 6);
        assert_eq!(repo.get_modules_by_name()["Two"].len(), 2);
        let matching = repo.get_modules_matching("T.*")?;
        assert_eq!(matching.len(), 2);
        assert!(repo.get_modules_matching("(").is_err());
        Ok(())
    }

    #[test]
    fn test_parse_device_tokens_skips_malformed() {
        let entries = vec![
            "abc:foo".to_string(),
            "abc:bar".to_string(),
            "nocolon".to_string(),
            ":orphan".to_string(),
            "def:".to_string(),
        ];
        let tokens = parse_device_tokens(&entries);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens["abc"].len(), 2);
    }
}
