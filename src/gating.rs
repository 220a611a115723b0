//! Feature-based test visibility.
//!
//! Tests declare which device features they need through options on their
//! `<test>` declaration:
//!
//! ```xml
//! <test class="com.example.BackupHostTest">
//!     <option name="required-features" value="android.software.backup" />
//!     <option name="excluded-features" value="android.hardware.type.watch:android.hardware.type.television" />
//! </test>
//! ```
//!
//! Values are colon-separated feature names and may repeat. A
//! [`GateRegistry`] maps each gated test id to a [`VisibilityPredicate`] that
//! is evaluated against a [`CapabilitySnapshot`].

use std::collections::{BTreeMap, BTreeSet};

use crate::capability::CapabilitySnapshot;
use crate::module::{Options, TestDecl};

pub const REQUIRED_FEATURES_OPTION: &str = "required-features";
pub const EXCLUDED_FEATURES_OPTION: &str = "excluded-features";
pub const APPLICABLE_FEATURES_OPTION: &str = "applicable-features";

/// Whether a test should run on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisibilityPredicate {
    Always,
    /// Visible iff no excluded feature is present, every required feature is
    /// present, and `applicable` is empty or one of them is present.
    Features {
        required: BTreeSet<String>,
        excluded: BTreeSet<String>,
        applicable: BTreeSet<String>,
    },
    All(Vec<VisibilityPredicate>),
    Any(Vec<VisibilityPredicate>),
    Not(Box<VisibilityPredicate>),
}

impl VisibilityPredicate {
    pub fn evaluate(&self, snapshot: &CapabilitySnapshot) -> bool {
        match self {
            VisibilityPredicate::Always => true,
            VisibilityPredicate::Features {
                required,
                excluded,
                applicable,
            } => {
                excluded.iter().all(|f| !snapshot.has_feature(f))
                    && required.iter().all(|f| snapshot.has_feature(f))
                    && (applicable.is_empty() || applicable.iter().any(|f| snapshot.has_feature(f)))
            }
            VisibilityPredicate::All(predicates) => predicates.iter().all(|p| p.evaluate(snapshot)),
            VisibilityPredicate::Any(predicates) => predicates.iter().any(|p| p.evaluate(snapshot)),
            VisibilityPredicate::Not(predicate) => !predicate.evaluate(snapshot),
        }
    }

    /// Reads the feature options of a test declaration. Returns `None` when
    /// the test declares none.
    pub fn from_options(options: &Options) -> Option<Self> {
        let required = feature_set(options, REQUIRED_FEATURES_OPTION);
        let excluded = feature_set(options, EXCLUDED_FEATURES_OPTION);
        let applicable = feature_set(options, APPLICABLE_FEATURES_OPTION);
        if required.is_empty() && excluded.is_empty() && applicable.is_empty() {
            return None;
        }
        Some(VisibilityPredicate::Features {
            required,
            excluded,
            applicable,
        })
    }
}

fn feature_set(options: &Options, name: &str) -> BTreeSet<String> {
    options
        .get_all(name)
        .flat_map(|value| value.split(':'))
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect()
}

/// Test id → visibility predicate.
#[derive(Debug, Clone, Default)]
pub struct GateRegistry {
    gates: BTreeMap<String, VisibilityPredicate>,
}

impl GateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collects the gates declared by `tests`.
    pub fn from_tests(tests: &[TestDecl]) -> Self {
        let mut registry = Self::new();
        for test in tests {
            if let Some(predicate) = VisibilityPredicate::from_options(&test.options) {
                registry.register(test.test_id(), predicate);
            }
        }
        registry
    }

    /// Adds a gate. A second gate for the same id must also hold.
    pub fn register(&mut self, test_id: impl Into<String>, predicate: VisibilityPredicate) {
        let test_id = test_id.into();
        let combined = match self.gates.remove(&test_id) {
            Some(VisibilityPredicate::All(mut existing)) => {
                existing.push(predicate);
                VisibilityPredicate::All(existing)
            }
            Some(existing) => VisibilityPredicate::All(vec![existing, predicate]),
            None => predicate,
        };
        self.gates.insert(test_id, combined);
    }

    pub fn get(&self, test_id: &str) -> Option<&VisibilityPredicate> {
        self.gates.get(test_id)
    }

    /// Ungated tests are always visible.
    pub fn is_visible(&self, test_id: &str, snapshot: &CapabilitySnapshot) -> bool {
        self.gates
            .get(test_id)
            .is_none_or(|predicate| predicate.evaluate(snapshot))
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}
