//! Shared test utilities for skillforge.

pub mod fixtures;

pub use fixtures::{WorkspaceFixture, chain_skills, diamond_skills, skill};

/// Table-driven test case structure.
#[derive(Debug, Clone)]
pub struct TestCase<I, E> {
    pub name: &'static str,
    pub input: I,
    pub expected: E,
}

/// Run table-driven tests, reporting the first mismatching case by name.
pub fn run_table_tests<I, E, F>(cases: Vec<TestCase<I, E>>, test_fn: F) -> Result<(), String>
where
    I: std::fmt::Debug + Clone,
    E: std::fmt::Debug + PartialEq,
    F: Fn(I) -> E,
{
    for case in cases {
        let start = std::time::Instant::now();
        let actual = test_fn(case.input.clone());
        println!("[TEST] {} ({:?})", case.name, start.elapsed());

        if actual != case.expected {
            return Err(format!(
                "Test '{}' failed for input {:?}: expected {:?}, got {:?}",
                case.name, case.input, case.expected, actual
            ));
        }
    }
    Ok(())
}
