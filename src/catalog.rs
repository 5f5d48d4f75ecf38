use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

fn default_time_limit_ms() -> u64 {
    2000
}

fn default_memory_limit_kb() -> u64 {
    262144
}

fn default_weight() -> u32 {
    1
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub id: u32,
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub is_sample: bool,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// A problem snapshot as judged; never mutated once published in the catalog
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Problem {
    pub id: u32,
    #[serde(default = "default_time_limit_ms")]
    pub time_limit_ms: u64,
    #[serde(default = "default_memory_limit_kb")]
    pub memory_limit_kb: u64,
    /// Empty means every configured language is allowed
    #[serde(default)]
    pub allowed_languages: BTreeSet<String>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub revision: u64,
}

impl Problem {
    pub fn allows_language(&self, language: &str) -> bool {
        self.allowed_languages.is_empty() || self.allowed_languages.contains(language)
    }

    /// Hard ceiling for running the whole test suite
    pub fn suite_ceiling_ms(&self, safety_factor: f64) -> u64 {
        let cases = self.test_cases.len().max(1) as f64;
        (self.time_limit_ms as f64 * cases * safety_factor.max(1.0)).ceil() as u64
    }

    /// The problem as shown to contestants: hidden test data is withheld
    pub fn public_view(&self) -> Problem {
        let test_cases = self
            .test_cases
            .iter()
            .map(|tc| {
                if tc.is_sample {
                    tc.clone()
                } else {
                    TestCase {
                        input: String::new(),
                        expected_output: String::new(),
                        ..tc.clone()
                    }
                }
            })
            .collect();

        Problem {
            test_cases,
            ..self.clone()
        }
    }
}

/// Versioned in-memory store of problem snapshots
///
/// Readers get an `Arc` snapshot; updates replace the entry with a new
/// revision so that submissions already being judged keep the old one.
pub struct ProblemCatalog {
    problems: RwLock<HashMap<u32, Arc<Problem>>>,
}

impl ProblemCatalog {
    pub fn new(problems: Vec<Problem>) -> Self {
        let catalog = Self {
            problems: RwLock::new(HashMap::new()),
        };
        for problem in problems {
            catalog.upsert(problem);
        }
        catalog
    }

    pub fn get(&self, id: u32) -> Option<Arc<Problem>> {
        self.problems.read().get(&id).cloned()
    }

    /// Publishes a new snapshot and returns it with its assigned revision
    pub fn upsert(&self, mut problem: Problem) -> Arc<Problem> {
        let mut problems = self.problems.write();
        problem.revision = problems
            .get(&problem.id)
            .map_or(1, |old| old.revision + 1);
        let snapshot = Arc::new(problem);
        problems.insert(snapshot.id, snapshot.clone());
        log::info!(
            "Published problem {} revision {}",
            snapshot.id,
            snapshot.revision
        );
        snapshot
    }

    pub fn len(&self) -> usize {
        self.problems.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem(id: u32, cases: usize) -> Problem {
        Problem {
            id,
            time_limit_ms: 1000,
            memory_limit_kb: 65536,
            allowed_languages: BTreeSet::new(),
            test_cases: (0..cases as u32)
                .map(|i| TestCase {
                    id: i + 1,
                    input: format!("{i}\n"),
                    expected_output: format!("{i}\n"),
                    is_sample: i == 0,
                    weight: 1,
                })
                .collect(),
            revision: 0,
        }
    }

    #[test]
    fn update_keeps_old_snapshot_alive() {
        let catalog = ProblemCatalog::new(vec![problem(1, 2)]);
        let before = catalog.get(1).unwrap();
        assert_eq!(before.revision, 1);

        let after = catalog.upsert(problem(1, 5));
        assert_eq!(after.revision, 2);
        assert_eq!(before.test_cases.len(), 2);
        assert_eq!(catalog.get(1).unwrap().test_cases.len(), 5);
    }

    #[test]
    fn empty_language_set_allows_everything() {
        let mut p = problem(1, 1);
        assert!(p.allows_language("python"));
        p.allowed_languages.insert("cpp".to_string());
        assert!(p.allows_language("cpp"));
        assert!(!p.allows_language("python"));
    }

    #[test]
    fn suite_ceiling_scales_with_cases() {
        assert_eq!(problem(1, 3).suite_ceiling_ms(2.0), 6000);
        assert_eq!(problem(1, 0).suite_ceiling_ms(2.0), 2000);
        assert_eq!(problem(1, 2).suite_ceiling_ms(0.5), 2000);
    }

    #[test]
    fn public_view_hides_non_samples() {
        let view = problem(1, 2).public_view();
        assert_eq!(view.test_cases[0].input, "0\n");
        assert_eq!(view.test_cases[1].input, "");
        assert_eq!(view.test_cases[1].expected_output, "");
    }
}
