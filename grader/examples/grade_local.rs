//! Grade a directory of notebooks against an existing image.
//!
//! Usage: grade_local <image> <submissions_dir>
//!
//! Substrate selection follows GRADER_RUNTIME (default: local Docker).

use std::path::PathBuf;
use std::time::Duration;

use grader::config::{ClusterJobConfig, LaunchOptions, RuntimeKind};
use grader::orchestrator::Orchestrator;
use grader::runtime::runtime_factory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let image = args.next().unwrap_or_else(|| "grading:latest".to_string());
    let submissions_dir = args.next().unwrap_or_else(|| "submissions".to_string());

    let mut submissions: Vec<PathBuf> = std::fs::read_dir(&submissions_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "ipynb"))
        .collect();
    submissions.sort();
    anyhow::ensure!(
        !submissions.is_empty(),
        "no notebooks found under {submissions_dir}"
    );

    let kind = RuntimeKind::from_env()?;
    let factory = runtime_factory(kind, ClusterJobConfig::default())?;
    let options = LaunchOptions::new(4).with_timeout(Duration::from_secs(600));

    let reports = Orchestrator::new(factory, options)
        .launch(&image, submissions)
        .await;

    for report in &reports {
        match &report.score {
            Some(score) => println!(
                "{}: {:.1}/{:.1} ({:.0}%)",
                report.file,
                score.total,
                score.possible,
                score.percent_correct * 100.0
            ),
            None => println!("{}: {} ({})", report.file, report.status,
                report.error.as_deref().unwrap_or("unknown error")),
        }
    }
    Ok(())
}
