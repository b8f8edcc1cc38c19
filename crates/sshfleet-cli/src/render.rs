//! Result output for `sshfleet run` and `sshfleet demo`.
//!
//! Everything here writes to stdout; logs go to stderr.

use std::borrow::Cow;
use std::io::{self, Write};

use serde::Serialize;

use sshfleet_core::model::{JobResult, TransferFailure};

/// JSON view of a result with output streams decoded as text.
#[derive(Debug, Serialize)]
pub struct JobReport<'a> {
    pub id: Option<&'a str>,
    pub succeeded: bool,
    pub exit_code: Option<u32>,
    pub host: &'a str,
    pub scratch_dir: &'a str,
    pub stdout: Cow<'a, str>,
    pub stderr: Cow<'a, str>,
    pub failed_downloads: &'a [TransferFailure],
    pub error: Option<&'a str>,
}

impl<'a> From<&'a JobResult> for JobReport<'a> {
    fn from(result: &'a JobResult) -> Self {
        Self {
            id: result.id.as_deref(),
            succeeded: result.succeeded(),
            exit_code: result.exit_code,
            host: &result.host,
            scratch_dir: &result.scratch_dir,
            stdout: result.stdout_lossy(),
            stderr: result.stderr_lossy(),
            failed_downloads: &result.failed_downloads,
            error: result.error.as_deref(),
        }
    }
}

fn status(result: &JobResult) -> &'static str {
    if result.succeeded() {
        "ok"
    } else if result.error.is_some() {
        "error"
    } else if result.exit_code == Some(0) {
        "partial"
    } else {
        "failed"
    }
}

/// One line per job, followed by any problems, then a summary line.
pub fn write_results(w: &mut impl Write, results: &[JobResult]) -> io::Result<()> {
    for (index, result) in results.iter().enumerate() {
        let id = result.id.as_deref().map_or_else(|| format!("#{index}"), str::to_string);
        let exit = result
            .exit_code
            .map_or_else(|| "-".to_string(), |code| code.to_string());
        writeln!(
            w,
            "{id:<20} {:<8} exit={exit:<4} host={}",
            status(result),
            result.host
        )?;
        if let Some(error) = &result.error {
            writeln!(w, "    error: {error}")?;
        }
        for failure in &result.failed_downloads {
            writeln!(
                w,
                "    not retrieved: {} -> {} ({})",
                failure.remote,
                failure.local.display(),
                failure.reason
            )?;
        }
        let stderr = result.stderr_lossy();
        if !result.succeeded() && !stderr.trim().is_empty() {
            for line in stderr.lines() {
                writeln!(w, "    stderr: {line}")?;
            }
        }
    }
    let ok = results.iter().filter(|r| r.succeeded()).count();
    writeln!(w, "{ok} of {} jobs succeeded", results.len())?;
    Ok(())
}

/// All results as a pretty-printed JSON array.
pub fn write_json(w: &mut impl Write, results: &[JobResult]) -> io::Result<()> {
    let reports: Vec<JobReport<'_>> = results.iter().map(JobReport::from).collect();
    serde_json::to_writer_pretty(&mut *w, &reports).map_err(io::Error::from)?;
    writeln!(w)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ok(id: &str) -> JobResult {
        let mut result = JobResult::new(Some(id.into()), "alice@node1:22", "/tmp/cluster_instance_a");
        result.exit_code = Some(0);
        result.stdout = b"hello\n".to_vec();
        result
    }

    fn render(results: &[JobResult]) -> String {
        let mut out = Vec::new();
        write_results(&mut out, results).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn summary_counts_successes() {
        let mut failed = ok("b");
        failed.exit_code = Some(2);
        failed.stderr = b"bad input\n".to_vec();

        let text = render(&[ok("a"), failed]);
        assert!(text.contains("a "));
        assert!(text.contains("failed"));
        assert!(text.contains("stderr: bad input"));
        assert!(text.ends_with("1 of 2 jobs succeeded\n"));
    }

    #[test]
    fn partial_results_list_missing_files() {
        let mut partial = ok("p");
        partial.failed_downloads.push(TransferFailure {
            local: PathBuf::from("out/c.txt"),
            remote: "/tmp/cluster_instance_a/c.txt".into(),
            reason: "no such file".into(),
        });
        let text = render(&[partial]);
        assert!(text.contains("partial"));
        assert!(text.contains("not retrieved: /tmp/cluster_instance_a/c.txt -> out/c.txt"));
    }

    #[test]
    fn anonymous_jobs_use_position() {
        let result = JobResult::not_run(None, "worker pool has been closed");
        let text = render(&[result]);
        assert!(text.starts_with("#0"));
        assert!(text.contains("exit=-"));
        assert!(text.contains("error: worker pool has been closed"));
    }

    #[test]
    fn json_decodes_streams() {
        let mut out = Vec::new();
        write_json(&mut out, &[ok("a")]).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value[0]["id"], "a");
        assert_eq!(value[0]["stdout"], "hello\n");
        assert_eq!(value[0]["succeeded"], true);
        assert_eq!(value[0]["exit_code"], 0);
    }
}
