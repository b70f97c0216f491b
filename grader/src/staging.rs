use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::runtime::{unit_pdf_path, unit_submission_path, VolumeBinding, UNIT_RESULTS_PATH};
use crate::score::submission_stem;

/// Local staging for one grading unit.
///
/// Owns a uniquely named temporary directory holding the copied submission,
/// the results placeholder, and (optionally) the PDF placeholder. The
/// directory is removed exactly once: explicitly via [`StagedUnit::cleanup`],
/// or by `Drop` on any early exit path. Data needed after grading (the
/// decoded results, a published PDF) must be extracted before the value is
/// dropped.
#[derive(Debug)]
pub struct StagedUnit {
    dir: TempDir,
    basename: String,
    stem: String,
    input: PathBuf,
    results: PathBuf,
    pdf: Option<PathBuf>,
}

impl StagedUnit {
    /// Copy `submission` into fresh staging and allocate result/PDF paths.
    pub async fn prepare(submission: &Path, want_pdf: bool) -> io::Result<Self> {
        let basename = submission
            .file_name()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("submission path {} has no file name", submission.display()),
                )
            })?
            .to_string_lossy()
            .into_owned();
        let stem = submission_stem(submission);

        let dir = tempfile::Builder::new().prefix("grader-unit-").tempdir()?;

        let input = dir.path().join(&basename);
        tokio::fs::copy(submission, &input).await?;

        // Placeholders so copy-back targets exist even if the unit never
        // writes them.
        let results = dir.path().join("results.json");
        tokio::fs::write(&results, b"").await?;

        let pdf = if want_pdf {
            let path = dir.path().join(format!("{stem}.pdf"));
            tokio::fs::write(&path, b"").await?;
            Some(path)
        } else {
            None
        };

        Ok(Self {
            dir,
            basename,
            stem,
            input,
            results,
            pdf,
        })
    }

    /// Volume bindings from the staged files to the fixed in-unit paths.
    pub fn bindings(&self) -> Vec<VolumeBinding> {
        let mut binds = vec![
            VolumeBinding {
                local: self.input.clone(),
                remote: unit_submission_path(&self.basename),
            },
            VolumeBinding {
                local: self.results.clone(),
                remote: UNIT_RESULTS_PATH.to_string(),
            },
        ];
        if let Some(pdf) = &self.pdf {
            binds.push(VolumeBinding {
                local: pdf.clone(),
                remote: unit_pdf_path(&self.stem),
            });
        }
        binds
    }

    /// Move the staged PDF into `pdf_dir` as `<stem>.pdf`, removing the
    /// staging copy. No-op when no PDF was requested.
    pub async fn publish_pdf(&mut self, pdf_dir: &Path) -> io::Result<Option<PathBuf>> {
        let Some(staged) = self.pdf.take() else {
            return Ok(None);
        };
        tokio::fs::create_dir_all(pdf_dir).await?;
        let dest = pdf_dir.join(format!("{}.pdf", self.stem));
        tokio::fs::copy(&staged, &dest).await?;
        tokio::fs::remove_file(&staged).await?;
        Ok(Some(dest))
    }

    /// Remove the staging directory now, surfacing any error. `Drop`
    /// covers paths that never get here.
    pub fn cleanup(self) -> io::Result<()> {
        self.dir.close()
    }

    pub fn staging_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn input_path(&self) -> &Path {
        &self.input
    }

    pub fn results_path(&self) -> &Path {
        &self.results
    }

    pub fn pdf_path(&self) -> Option<&Path> {
        self.pdf.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    async fn fixture(dir: &Path) -> PathBuf {
        let path = dir.join("hw01-ada.ipynb");
        tokio::fs::write(&path, b"{\"cells\": []}").await.unwrap();
        path
    }

    #[tokio::test]
    async fn staged_paths_are_unique_under_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let submission = fixture(dir.path()).await;

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let submission = submission.clone();
            tasks.push(tokio::spawn(async move {
                let staged = StagedUnit::prepare(&submission, true).await.unwrap();
                (
                    staged.staging_dir().to_path_buf(),
                    staged.results_path().to_path_buf(),
                )
            }));
        }

        let mut dirs = HashSet::new();
        let mut results = HashSet::new();
        for task in tasks {
            let (d, r) = task.await.unwrap();
            assert!(dirs.insert(d), "staging dir collided");
            assert!(results.insert(r), "results path collided");
        }
    }

    #[tokio::test]
    async fn bindings_target_fixed_unit_paths() {
        let dir = tempfile::tempdir().unwrap();
        let submission = fixture(dir.path()).await;
        let staged = StagedUnit::prepare(&submission, true).await.unwrap();

        let binds = staged.bindings();
        assert_eq!(binds.len(), 3);
        assert_eq!(binds[0].remote, "/autograder/submission/hw01-ada.ipynb");
        assert_eq!(binds[1].remote, "/autograder/results/results.json");
        assert_eq!(binds[2].remote, "/autograder/submission/hw01-ada.pdf");
        for bind in &binds {
            assert!(bind.local.exists());
        }
    }

    #[tokio::test]
    async fn drop_removes_staging() {
        let dir = tempfile::tempdir().unwrap();
        let submission = fixture(dir.path()).await;

        let staged = StagedUnit::prepare(&submission, false).await.unwrap();
        let staging_dir = staged.staging_dir().to_path_buf();
        assert!(staging_dir.exists());
        drop(staged);
        assert!(!staging_dir.exists());
    }

    #[tokio::test]
    async fn explicit_cleanup_removes_staging() {
        let dir = tempfile::tempdir().unwrap();
        let submission = fixture(dir.path()).await;

        let staged = StagedUnit::prepare(&submission, false).await.unwrap();
        let staging_dir = staged.staging_dir().to_path_buf();
        staged.cleanup().unwrap();
        assert!(!staging_dir.exists());
    }

    #[tokio::test]
    async fn publish_pdf_moves_and_clears_staging_copy() {
        let dir = tempfile::tempdir().unwrap();
        let submission = fixture(dir.path()).await;
        let out = dir.path().join("pdfs");

        let mut staged = StagedUnit::prepare(&submission, true).await.unwrap();
        let staged_pdf = staged.pdf_path().unwrap().to_path_buf();
        tokio::fs::write(&staged_pdf, b"%PDF-1.4").await.unwrap();

        let dest = staged.publish_pdf(&out).await.unwrap().unwrap();
        assert_eq!(dest, out.join("hw01-ada.pdf"));
        assert!(dest.exists());
        assert!(!staged_pdf.exists());
    }
}
