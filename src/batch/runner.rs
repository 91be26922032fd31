// src/batch/runner.rs

//! Runs one attempt of a job as a local process.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::batch::{BatchJobId, BatchJobSpec, ExitStatus, UpdatedBatchJob};
use crate::store::{FileId, JobStore};

/// One attempt handed to [`run_attempt`].
pub struct Attempt {
    pub batch_job_id: BatchJobId,
    pub spec: BatchJobSpec,
    /// Per-attempt working directory; removed when the attempt ends.
    pub work_dir: PathBuf,
}

/// Run the attempt's payload as `sh -c <payload>` and always report exactly
/// one [`UpdatedBatchJob`] on `updates`:
///
/// - normal exit: the exit code, plus declared outputs imported into the
///   store on success (a missing output turns success into an error),
/// - cancellation: the child is killed and `Killed` is reported,
/// - anything else going wrong: `Error` with the reason.
pub async fn run_attempt(
    attempt: Attempt,
    store: Arc<dyn JobStore>,
    updates: mpsc::Sender<UpdatedBatchJob>,
    cancel_rx: oneshot::Receiver<()>,
) {
    let batch_job_id = attempt.batch_job_id;
    let job = attempt.spec.job_id.clone();
    let work_dir = attempt.work_dir.clone();
    let started = Instant::now();

    let update = match run_attempt_inner(&attempt, store, cancel_rx).await {
        Ok((status, outputs)) => UpdatedBatchJob {
            outputs,
            ..UpdatedBatchJob::new(batch_job_id, status, started.elapsed())
        },
        Err(err) => {
            error!(job = %job, batch_job_id, error = %err, "attempt execution error");
            UpdatedBatchJob {
                failure: Some(format!("{err:#}")),
                ..UpdatedBatchJob::new(batch_job_id, ExitStatus::Error, started.elapsed())
            }
        }
    };

    if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
        debug!(job = %job, dir = %work_dir.display(), error = %e, "could not remove work dir");
    }

    if updates.send(update).await.is_err() {
        debug!(job = %job, batch_job_id, "batch system dropped; completion not delivered");
    }
}

async fn run_attempt_inner(
    attempt: &Attempt,
    store: Arc<dyn JobStore>,
    mut cancel_rx: oneshot::Receiver<()>,
) -> Result<(ExitStatus, Vec<(String, FileId)>)> {
    let spec = &attempt.spec;
    let payload = {
        let store = Arc::clone(&store);
        let id = spec.payload.clone();
        tokio::task::spawn_blocking(move || store.read_file_to_vec(&id))
            .await
            .context("joining payload read")?
            .with_context(|| format!("reading payload of job '{}'", spec.job_id))?
    };
    let cmd_line = String::from_utf8(payload)
        .with_context(|| format!("payload of job '{}' is not UTF-8", spec.job_id))?;

    tokio::fs::create_dir_all(&attempt.work_dir)
        .await
        .with_context(|| format!("creating work dir {}", attempt.work_dir.display()))?;

    info!(
        job = %spec.job_id,
        batch_job_id = attempt.batch_job_id,
        attempt = spec.attempt,
        cmd = %cmd_line,
        "starting job process"
    );

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&cmd_line)
        .current_dir(&attempt.work_dir)
        .env("JOBFLOW_RUN_ID", &spec.run_id)
        .env("JOBFLOW_JOB_ID", &spec.job_id)
        .env("JOBFLOW_ATTEMPT", spec.attempt.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning process for job '{}'", spec.job_id))?;

    // Always drain both pipes so the child never blocks on a full buffer.
    for (stream, reader) in [
        ("stdout", child.stdout.take().map(|s| Box::new(s) as Box<dyn tokio::io::AsyncRead + Send + Unpin>)),
        ("stderr", child.stderr.take().map(|s| Box::new(s) as Box<dyn tokio::io::AsyncRead + Send + Unpin>)),
    ] {
        if let Some(reader) = reader {
            let job = spec.job_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(job = %job, stream, "{}", line);
                }
            });
        }
    }

    tokio::select! {
        status_res = child.wait() => {
            let status = status_res
                .with_context(|| format!("waiting for process of job '{}'", spec.job_id))?;
            let code = status.code().unwrap_or(-1);

            info!(
                job = %spec.job_id,
                batch_job_id = attempt.batch_job_id,
                exit_code = code,
                success = status.success(),
                "job process exited"
            );

            if !status.success() {
                return Ok((ExitStatus::Code(code), Vec::new()));
            }

            let outputs = import_outputs(attempt, store).await?;
            Ok((ExitStatus::Code(0), outputs))
        }

        cancel = &mut cancel_rx => {
            match cancel {
                Ok(()) => {
                    info!(job = %spec.job_id, batch_job_id = attempt.batch_job_id, "kill requested; killing process");
                    if let Err(e) = child.kill().await {
                        warn!(job = %spec.job_id, error = %e, "failed to kill child process");
                    }
                }
                Err(_) => {
                    // Sender dropped with the batch system; kill_on_drop handles the child.
                    debug!(job = %spec.job_id, "cancel channel closed without explicit kill");
                }
            }
            Ok((ExitStatus::Killed, Vec::new()))
        }
    }
}

/// Copy declared outputs from the work dir into the job store.
async fn import_outputs(
    attempt: &Attempt,
    store: Arc<dyn JobStore>,
) -> Result<Vec<(String, FileId)>> {
    let mut imported = Vec::with_capacity(attempt.spec.outputs.len());

    for name in &attempt.spec.outputs {
        let path = attempt.work_dir.join(name);
        let contents = match tokio::fs::read(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                bail!("declared output '{name}' was not produced");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading output {}", path.display()));
            }
        };

        let store = Arc::clone(&store);
        let id = tokio::task::spawn_blocking(move || store.put_file(&contents))
            .await
            .context("joining output import")?
            .with_context(|| format!("storing output '{name}'"))?;
        debug!(job = %attempt.spec.job_id, output = %name, file_id = %id, "imported output");
        imported.push((name.clone(), id));
    }

    Ok(imported)
}
