// src/engine/tree.rs

//! Turning a flat list of results into the hierarchical tree callers display.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;

use super::targets::TestTarget;
use crate::session::TestResult;
use crate::types::{TargetKind, TestStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub file: PathBuf,
    /// 1-based.
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestNode {
    pub id: String,
    pub label: String,
    pub full_name: String,
    pub kind: TargetKind,
    /// Only set on test leaves.
    pub status: Option<TestStatus>,
    pub location: Option<SourceLocation>,
    pub children: Vec<TestNode>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestTree {
    pub roots: Vec<TestNode>,
}

impl TestTree {
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Number of test leaves.
    pub fn test_count(&self) -> usize {
        fn count(node: &TestNode) -> usize {
            match node.kind {
                TargetKind::Test => 1,
                TargetKind::Suite => node.children.iter().map(count).sum(),
            }
        }
        self.roots.iter().map(count).sum()
    }

    /// Every node as a runnable target, depth first, carrying its ancestors.
    pub fn targets(&self) -> Vec<TestTarget> {
        fn walk(node: &TestNode, ancestors: &mut Vec<String>, out: &mut Vec<TestTarget>) {
            out.push(TestTarget {
                id: node.id.clone(),
                full_name: node.full_name.clone(),
                kind: node.kind,
                ancestor_ids: ancestors.clone(),
            });
            ancestors.push(node.id.clone());
            for child in &node.children {
                walk(child, ancestors, out);
            }
            ancestors.pop();
        }

        let mut out = Vec::new();
        for root in &self.roots {
            walk(root, &mut Vec::new(), &mut out);
        }
        out
    }
}

/// Maps a suite path and test name to where it is defined.
pub trait TestLocator: Send + Sync {
    fn locate(&self, suite: &[String], description: Option<&str>) -> Option<SourceLocation>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocator;

impl TestLocator for NoLocator {
    fn locate(&self, _suite: &[String], _description: Option<&str>) -> Option<SourceLocation> {
        None
    }
}

pub trait TestTreeMapper: Send + Sync {
    fn map(&self, results: &[TestResult]) -> TestTree;
}

/// Nests results by their `suite` path.
///
/// Suite ids are the suite path joined by spaces; test ids are the runner's
/// result ids. Children keep the order in which they were first seen.
pub struct SuiteTreeMapper<L = NoLocator> {
    locator: L,
}

impl Default for SuiteTreeMapper<NoLocator> {
    fn default() -> Self {
        Self { locator: NoLocator }
    }
}

impl<L: TestLocator> SuiteTreeMapper<L> {
    pub fn new(locator: L) -> Self {
        Self { locator }
    }

    fn suite_node(&self, path: &[String]) -> TestNode {
        let full_name = path.join(" ");
        TestNode {
            id: full_name.clone(),
            label: path.last().cloned().unwrap_or_default(),
            full_name,
            kind: TargetKind::Suite,
            status: None,
            location: self.locator.locate(path, None),
            children: Vec::new(),
        }
    }
}

enum Child {
    Test(TestNode),
    Suite(usize),
}

/// Suite under construction: ordered children plus a name index into `suites`.
struct Branch {
    node: TestNode,
    order: Vec<Child>,
    index: HashMap<String, usize>,
    suites: Vec<Branch>,
}

impl Branch {
    fn new(node: TestNode) -> Self {
        Self {
            node,
            order: Vec::new(),
            index: HashMap::new(),
            suites: Vec::new(),
        }
    }

    fn child_suite(&mut self, name: &str, make: impl FnOnce() -> TestNode) -> &mut Branch {
        let slot = match self.index.get(name) {
            Some(&slot) => slot,
            None => {
                self.suites.push(Branch::new(make()));
                let slot = self.suites.len() - 1;
                self.index.insert(name.to_string(), slot);
                self.order.push(Child::Suite(slot));
                slot
            }
        };
        &mut self.suites[slot]
    }

    fn finish(self) -> TestNode {
        let mut suites: Vec<Option<TestNode>> =
            self.suites.into_iter().map(|b| Some(b.finish())).collect();
        let children = self
            .order
            .into_iter()
            .filter_map(|child| match child {
                Child::Test(node) => Some(node),
                Child::Suite(slot) => suites[slot].take(),
            })
            .collect();
        TestNode {
            children,
            ..self.node
        }
    }
}

impl<L: TestLocator> TestTreeMapper for SuiteTreeMapper<L> {
    fn map(&self, results: &[TestResult]) -> TestTree {
        let mut root = Branch::new(TestNode {
            id: String::new(),
            label: String::new(),
            full_name: String::new(),
            kind: TargetKind::Suite,
            status: None,
            location: None,
            children: Vec::new(),
        });

        for result in results {
            let mut branch = &mut root;
            for depth in 0..result.suite.len() {
                let path = &result.suite[..=depth];
                branch = branch.child_suite(&result.suite[depth], || self.suite_node(path));
            }

            branch.order.push(Child::Test(TestNode {
                id: result.id.clone(),
                label: result.description.clone(),
                full_name: result.full_name.clone(),
                kind: TargetKind::Test,
                status: Some(result.status),
                location: self.locator.locate(&result.suite, Some(&result.description)),
                children: Vec::new(),
            }));
        }

        TestTree {
            roots: root.finish().children,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::results::full_name_of;

    fn result(id: &str, suite: &[&str], description: &str) -> TestResult {
        let suite: Vec<String> = suite.iter().map(|s| s.to_string()).collect();
        TestResult {
            id: id.into(),
            description: description.into(),
            full_name: full_name_of(&suite, description),
            suite,
            status: TestStatus::Passed,
            time_ms: 1,
            failure_messages: Vec::new(),
        }
    }

    #[test]
    fn nests_by_suite_path_in_first_seen_order() {
        let results = vec![
            result("t1", &["Calc"], "adds"),
            result("t2", &["Parser", "lexer"], "tokenizes"),
            result("t3", &["Calc"], "subtracts"),
            result("t4", &[], "top level"),
        ];

        let tree = SuiteTreeMapper::new(NoLocator).map(&results);
        let labels: Vec<_> = tree.roots.iter().map(|n| n.label.as_str()).collect();
        assert_eq!(labels, vec!["Calc", "Parser", "top level"]);

        let calc = &tree.roots[0];
        assert_eq!(calc.id, "Calc");
        let tests: Vec<_> = calc.children.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(tests, vec!["t1", "t3"]);

        let lexer = &tree.roots[1].children[0];
        assert_eq!(lexer.id, "Parser lexer");
        assert_eq!(lexer.children[0].full_name, "Parser lexer tokenizes");
        assert_eq!(tree.test_count(), 4);
    }

    #[test]
    fn no_results_map_to_an_empty_tree() {
        let tree = SuiteTreeMapper::new(NoLocator).map(&[]);
        assert!(tree.is_empty());
        assert_eq!(tree.test_count(), 0);
    }

    #[test]
    fn targets_carry_ancestor_ids() {
        let tree = SuiteTreeMapper::new(NoLocator).map(&[result("t2", &["Parser", "lexer"], "tokenizes")]);
        let targets = tree.targets();

        let leaf = targets.iter().find(|t| t.id == "t2").unwrap();
        assert_eq!(leaf.ancestor_ids, vec!["Parser", "Parser lexer"]);
        assert_eq!(leaf.kind, TargetKind::Test);
    }

    #[test]
    fn locator_decorates_nodes() {
        struct Fixed;
        impl TestLocator for Fixed {
            fn locate(&self, _suite: &[String], description: Option<&str>) -> Option<SourceLocation> {
                description.map(|_| SourceLocation {
                    file: PathBuf::from("calc.spec.js"),
                    line: 7,
                })
            }
        }

        let tree = SuiteTreeMapper::new(Fixed).map(&[result("t1", &["Calc"], "adds")]);
        assert!(tree.roots[0].location.is_none());
        assert_eq!(tree.roots[0].children[0].location.as_ref().unwrap().line, 7);
    }
}
