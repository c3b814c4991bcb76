// src/engine/targets.rs

use std::collections::HashSet;

use crate::types::TargetKind;

/// A test or suite the caller asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestTarget {
    pub id: String,
    /// Prefix-matched against result full names.
    pub full_name: String,
    pub kind: TargetKind,
    /// Ids of enclosing suites, outermost first.
    pub ancestor_ids: Vec<String>,
}

impl TestTarget {
    pub fn suite(id: impl Into<String>, full_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            full_name: full_name.into(),
            kind: TargetKind::Suite,
            ancestor_ids: Vec::new(),
        }
    }

    pub fn test(id: impl Into<String>, full_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            full_name: full_name.into(),
            kind: TargetKind::Test,
            ancestor_ids: Vec::new(),
        }
    }

    pub fn with_ancestors<I, S>(mut self, ancestors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ancestor_ids = ancestors.into_iter().map(Into::into).collect();
        self
    }
}

/// Drop targets already covered by a requested ancestor suite, and repeated
/// ids. Keeps the input order of the survivors.
pub fn dedup_targets(targets: &[TestTarget]) -> Vec<TestTarget> {
    let suites: HashSet<&str> = targets
        .iter()
        .filter(|t| t.kind == TargetKind::Suite)
        .map(|t| t.id.as_str())
        .collect();

    let mut seen = HashSet::new();
    targets
        .iter()
        .filter(|t| !t.ancestor_ids.iter().any(|a| suites.contains(a.as_str())))
        .filter(|t| seen.insert(t.id.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descendants_of_requested_suites_are_dropped() {
        let targets = vec![
            TestTarget::test("t1", "Calc adds").with_ancestors(["Calc"]),
            TestTarget::suite("Calc", "Calc"),
            TestTarget::test("t2", "Parser parses").with_ancestors(["Parser"]),
            TestTarget::suite("Calc nested", "Calc nested").with_ancestors(["Calc"]),
        ];

        let ids: Vec<_> = dedup_targets(&targets).into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["Calc", "t2"]);
    }

    #[test]
    fn repeated_ids_collapse() {
        let targets = vec![TestTarget::test("t1", "a"), TestTarget::test("t1", "a")];
        assert_eq!(dedup_targets(&targets).len(), 1);
    }
}
