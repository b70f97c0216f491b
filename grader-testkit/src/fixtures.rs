use std::path::PathBuf;

use tempfile::TempDir;

use grader::score::{GradingResults, TestResult};

/// A result artifact with two tests summing to `total` of `possible`.
pub fn passing_results(total: f64, possible: f64) -> GradingResults {
    GradingResults {
        tests: vec![
            TestResult {
                name: "q1".to_string(),
                score: total / 2.0,
                possible: possible / 2.0,
            },
            TestResult {
                name: "q2".to_string(),
                score: total / 2.0,
                possible: possible / 2.0,
            },
        ],
        total,
        possible,
    }
}

/// Write `count` fake notebook submissions into a fresh temp dir.
///
/// Returns the dir guard (keep it alive for the test's duration) and the
/// submission paths, named `sub00.ipynb`, `sub01.ipynb`, ...
pub fn submission_fixtures(count: usize) -> anyhow::Result<(TempDir, Vec<PathBuf>)> {
    let dir = tempfile::Builder::new().prefix("grader-subs-").tempdir()?;
    let mut paths = Vec::with_capacity(count);
    for i in 0..count {
        let path = dir.path().join(format!("sub{i:02}.ipynb"));
        std::fs::write(&path, format!("{{\"cells\": [], \"id\": {i}}}"))?;
        paths.push(path);
    }
    Ok((dir, paths))
}
