//! Job commands: run, status, result, resume, kill.

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use batchloom_observe::attrs;
use batchloom_types::error::SchedulerError;
use batchloom_types::event::SchedulerEvent;
use batchloom_types::ids::JobId;
use batchloom_types::job::{Job, JobStatus, JobSubmission};
use batchloom_types::task::{TaskResult, TaskStatus};
use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::RecvError;

use crate::state::AppState;

/// How the caller wants things printed.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

/// Submit a job file and follow it until it ends.
pub async fn run_job(state: &AppState, file: &Path, out: Output) -> anyhow::Result<ExitCode> {
    let raw = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("cannot read {}", file.display()))?;
    let submission: JobSubmission = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a valid job description", file.display()))?;

    // Subscribe first so the submission event is not missed.
    let events = state.scheduler.subscribe();
    let id = state.scheduler.submit_job(submission).await?;
    tracing::info!({ attrs::JOB_ID } = id.id, { attrs::JOB_NAME } = %id.name, "following job");

    if !out.json && !out.quiet {
        println!();
        println!("  Submitted job {} {}", style(&id.name).bold(), style(format!("[{}]", id.id)).dim());
        println!();
    }

    let mut outcomes = follow(state, std::slice::from_ref(&id), events, out).await?;
    let status = outcomes.pop().context("no outcome for submitted job")??;
    let job = state.scheduler.job_snapshot(id.id).await?;

    if out.json {
        println!("{}", serde_json::to_string(&job.summary())?);
    } else if !out.quiet {
        println!();
        print_job(&job);
    }
    Ok(ExitCode::from(status_code(status, &job)))
}

/// Show one job's tasks, or list stored jobs.
pub async fn show_status(
    state: &AppState,
    job: Option<u64>,
    unfinished: bool,
    json: bool,
) -> anyhow::Result<()> {
    let Some(job) = job else {
        return list_jobs(state, unfinished, json).await;
    };

    let job = state.scheduler.job_snapshot(job).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&job_json(&job))?);
        return Ok(());
    }
    println!();
    print_job(&job);
    Ok(())
}

async fn list_jobs(state: &AppState, unfinished: bool, json: bool) -> anyhow::Result<()> {
    let jobs = state.scheduler.list_jobs(unfinished).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!();
        println!("  No jobs found.");
        println!("  Run one with: {}", style("bloom run <job.json>").yellow());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Owner"),
            Cell::new("Status"),
            Cell::new("Tasks"),
            Cell::new("Submitted"),
            Cell::new("Finished"),
        ]);

    for j in &jobs {
        table.add_row(vec![
            Cell::new(j.id.id),
            Cell::new(&j.id.name),
            Cell::new(&j.owner),
            format_job_status(j.status),
            Cell::new(j.task_count),
            Cell::new(format_time(Some(j.submitted_at))),
            Cell::new(format_time(j.finished_at)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!("  {} job(s)", style(jobs.len()).bold());
    println!();
    Ok(())
}

/// Print the result of the task named `task` (with its copy suffixes).
pub async fn show_result(state: &AppState, job: u64, task: &str, json: bool) -> anyhow::Result<()> {
    let snapshot = state.scheduler.job_snapshot(job).await?;
    let found = snapshot
        .tasks()
        .find(|t| t.id.readable_name() == task)
        .ok_or_else(|| SchedulerError::TaskNotFound(format!("{job}/{task}")))?;
    let result = state.scheduler.get_result(&found.id).await?;

    if json {
        let body = serde_json::json!({
            "task": found.id,
            "status": found.status,
            "result": result,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    match result {
        None => {
            println!(
                "  {} is still {}",
                style(task).bold(),
                style(found.status.as_str()).yellow()
            );
        }
        Some(TaskResult::Success { output }) => match output.value {
            serde_json::Value::String(text) => println!("{text}"),
            value => println!("{}", serde_json::to_string_pretty(&value)?),
        },
        Some(TaskResult::Failure { cause }) => {
            println!("  {} {}", style("✗").red().bold(), style(cause).red());
        }
    }
    Ok(())
}

/// Resume every unfinished stored job and follow them to the end.
pub async fn resume(state: &AppState, out: Output) -> anyhow::Result<ExitCode> {
    let events = state.scheduler.subscribe();
    let resumed = state.scheduler.recover().await?;

    if resumed.is_empty() {
        if out.json {
            println!("[]");
        } else if !out.quiet {
            println!();
            println!("  No unfinished jobs.");
            println!();
        }
        return Ok(ExitCode::SUCCESS);
    }

    if !out.json && !out.quiet {
        println!();
        println!("  Resuming {} job(s)", style(resumed.len()).bold());
        println!();
    }

    let outcomes = follow(state, &resumed, events, out).await?;
    let mut first_failure = 0u8;
    for (id, outcome) in resumed.iter().zip(outcomes) {
        let code = match outcome {
            Ok(status) => {
                let job = state.scheduler.job_snapshot(id.id).await?;
                if out.json {
                    println!("{}", serde_json::to_string(&job.summary())?);
                }
                status_code(status, &job)
            }
            Err(err) => {
                eprintln!("  {} job {id}: {err}", style("✗").red().bold());
                error_code(&err)
            }
        };
        if first_failure == 0 {
            first_failure = code;
        }
    }

    if !out.json && !out.quiet {
        println!();
        list_jobs(state, false, false).await?;
    }
    Ok(ExitCode::from(first_failure))
}

/// Kill a job.
pub async fn kill(state: &AppState, job: u64, json: bool) -> anyhow::Result<()> {
    state.scheduler.abort_job(job).await?;
    let status = state.scheduler.wait_job(job).await.unwrap_or(JobStatus::Failed);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "job": job, "status": status }))?
        );
        return Ok(());
    }

    println!();
    if status == JobStatus::Killed {
        println!("  {} Killed job {job}", style("✓").green().bold());
    } else {
        println!("  Job {job} had already ended ({status})");
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Following
// ---------------------------------------------------------------------------

/// Print events for `jobs` until all of them end. Ctrl+C kills them.
async fn follow(
    state: &AppState,
    jobs: &[JobId],
    mut events: Receiver<SchedulerEvent>,
    out: Output,
) -> anyhow::Result<Vec<Result<JobStatus, SchedulerError>>> {
    let ids: Vec<u64> = jobs.iter().map(|j| j.id).collect();

    let scheduler = state.scheduler.clone();
    let waited = ids.clone();
    let mut waiter = tokio::spawn(async move {
        let mut outcomes = Vec::with_capacity(waited.len());
        for id in waited {
            outcomes.push(scheduler.wait_job(id).await);
        }
        outcomes
    });

    let mut listening = true;
    let mut interrupted = false;
    loop {
        tokio::select! {
            outcomes = &mut waiter => {
                let outcomes = outcomes.context("job waiter stopped unexpectedly")?;
                // Drain what was published before the last job ended.
                while let Ok(event) = events.try_recv() {
                    if ids.contains(&event.job()) {
                        print_event(&event, out)?;
                    }
                }
                return Ok(outcomes);
            }
            event = events.recv(), if listening => match event {
                Ok(event) if ids.contains(&event.job()) => print_event(&event, out)?,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged; some status changes were not printed");
                }
                Err(RecvError::Closed) => listening = false,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if !out.quiet {
                    eprintln!("\n  {} Interrupted, killing job(s)...", style("!").yellow().bold());
                }
                for id in &ids {
                    if let Err(err) = state.scheduler.abort_job(*id).await {
                        tracing::warn!({ attrs::JOB_ID } = *id, error = %err, "abort failed");
                    }
                }
            }
        }
    }
}

fn print_event(event: &SchedulerEvent, out: Output) -> anyhow::Result<()> {
    if out.json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    if out.quiet {
        return Ok(());
    }

    let at = style(event.at().format("%H:%M:%S").to_string()).dim();
    match event {
        SchedulerEvent::TaskStatusChanged {
            task_id,
            status,
            attempt,
            ..
        } => {
            let attempt = if *attempt > 1 {
                format!(" (attempt {attempt})")
            } else {
                String::new()
            };
            println!(
                "  {at}  {:<24} {}{}",
                task_id.readable_name(),
                style_task_status(*status),
                style(attempt).dim()
            );
        }
        SchedulerEvent::JobStatusChanged { job_id, status, .. } => {
            println!("  {at}  {} {}", style(format!("job {job_id}")).bold(), style(status).cyan());
        }
        SchedulerEvent::GraphExpanded {
            origin,
            action,
            added,
            ..
        } => {
            println!(
                "  {at}  {:<24} {} {}",
                origin.readable_name(),
                style(action).magenta(),
                style(format!("+{} task(s)", added.len())).dim()
            );
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn print_job(job: &Job) {
    println!(
        "  {} {}  {}",
        style(&job.id.name).bold(),
        style(format!("[{}]", job.id.id)).dim(),
        style_job_status(job.status)
    );
    println!("  {} {}", style("Owner:").dim(), job.owner);
    println!("  {} {}", style("Submitted:").dim(), format_time(Some(job.submitted_at)));
    let counts: Vec<String> = job
        .status_counts()
        .into_iter()
        .map(|(status, n)| format!("{n} {status}"))
        .collect();
    println!("  {} {}", style("Tasks:").dim(), counts.join(", "));
    if let Some(error) = &job.error {
        println!("  {} {}", style("Error:").dim(), style(error).red());
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Task").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Started"),
            Cell::new("Finished"),
            Cell::new("Detail"),
        ]);

    for task in job.tasks() {
        let detail = match (&task.result, &task.last_failure) {
            (Some(TaskResult::Failure { cause }), _) => cause.to_string(),
            (None, Some(cause)) => format!("last attempt: {cause}"),
            _ => String::new(),
        };
        table.add_row(vec![
            Cell::new(task.id.readable_name()),
            format_task_status(task.status),
            Cell::new(task.attempts),
            Cell::new(format_time(task.started_at)),
            Cell::new(format_time(task.finished_at)),
            Cell::new(detail),
        ]);
    }

    println!("{table}");
    println!();
}

fn job_json(job: &Job) -> serde_json::Value {
    serde_json::json!({
        "job": job.summary(),
        "tasks": job.tasks().collect::<Vec<_>>(),
    })
}

fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn format_task_status(status: TaskStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        TaskStatus::Submitted => cell.fg(Color::Grey),
        TaskStatus::Pending => cell.fg(Color::Yellow),
        TaskStatus::Running => cell.fg(Color::Blue),
        TaskStatus::Finished => cell.fg(Color::Green),
        TaskStatus::Faulty | TaskStatus::Failed => cell.fg(Color::Red),
        TaskStatus::Aborted => cell.fg(Color::DarkYellow),
    }
}

fn format_job_status(status: JobStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        JobStatus::Pending => cell.fg(Color::Yellow),
        JobStatus::Running => cell.fg(Color::Blue),
        JobStatus::Finished => cell.fg(Color::Green),
        JobStatus::Failed => cell.fg(Color::Red),
        JobStatus::Canceled | JobStatus::Killed => cell.fg(Color::DarkYellow),
    }
}

fn style_task_status(status: TaskStatus) -> console::StyledObject<&'static str> {
    let text = style(status.as_str());
    match status {
        TaskStatus::Submitted => text.dim(),
        TaskStatus::Pending => text.yellow(),
        TaskStatus::Running => text.blue(),
        TaskStatus::Finished => text.green(),
        TaskStatus::Faulty | TaskStatus::Failed => text.red(),
        TaskStatus::Aborted => text.yellow().dim(),
    }
}

fn style_job_status(status: JobStatus) -> console::StyledObject<&'static str> {
    let text = style(status.as_str()).bold();
    match status {
        JobStatus::Pending => text.yellow(),
        JobStatus::Running => text.blue(),
        JobStatus::Finished => text.green(),
        JobStatus::Failed => text.red(),
        JobStatus::Canceled | JobStatus::Killed => text.yellow().dim(),
    }
}

// ---------------------------------------------------------------------------
// Exit codes
// ---------------------------------------------------------------------------

/// Exit code for a job that ended with `status`.
///
/// A finished job with tasks that did not finish exits with 2.
pub fn status_code(status: JobStatus, job: &Job) -> u8 {
    match status {
        JobStatus::Finished if job.tasks().all(|t| t.status == TaskStatus::Finished) => 0,
        JobStatus::Finished => 2,
        JobStatus::Canceled => 3,
        JobStatus::Killed => 130,
        JobStatus::Failed | JobStatus::Pending | JobStatus::Running => 1,
    }
}

/// Exit code for a scheduler error, following sysexits where one fits.
pub fn error_code(err: &SchedulerError) -> u8 {
    use batchloom_types::error::ErrorKind;

    match err.kind() {
        ErrorKind::MalformedWorkflow => 65,
        ErrorKind::NotFound => 66,
        ErrorKind::Resource => 69,
        ErrorKind::Storage => 75,
        ErrorKind::Config => 78,
        ErrorKind::InvalidState | ErrorKind::Execution => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchloom_types::error::StoreError;
    use batchloom_types::executable::{ExecutableContainer, ExecutableDescription};
    use batchloom_types::ids::TaskId;
    use batchloom_types::task::Task;

    fn job(statuses: &[TaskStatus]) -> Job {
        let id = JobId::new(3, "nightly");
        let mut job = Job::new(id.clone(), "ops", Utc::now());
        for (i, status) in statuses.iter().enumerate() {
            let mut task = Task::new(
                TaskId::new(id.clone(), i as u32 + 1, format!("t{i}")),
                ExecutableContainer::new(ExecutableDescription {
                    kind: "command".into(),
                    spec: serde_json::json!({ "program": "true" }),
                }),
            );
            task.status = *status;
            job.put_task(task);
        }
        job
    }

    #[test]
    fn finished_job_exit_codes() {
        let clean = job(&[TaskStatus::Finished, TaskStatus::Finished]);
        assert_eq!(status_code(JobStatus::Finished, &clean), 0);

        let partial = job(&[TaskStatus::Finished, TaskStatus::Faulty]);
        assert_eq!(status_code(JobStatus::Finished, &partial), 2);

        assert_eq!(status_code(JobStatus::Killed, &partial), 130);
        assert_eq!(status_code(JobStatus::Canceled, &partial), 3);
    }

    #[test]
    fn error_exit_codes_follow_kind() {
        assert_eq!(error_code(&SchedulerError::MalformedWorkflow("cycle".into())), 65);
        assert_eq!(error_code(&SchedulerError::JobNotFound(9)), 66);
        let exhausted = SchedulerError::StorageExhausted {
            attempts: 6,
            source: StoreError::Busy("locked".into()),
        };
        assert_eq!(error_code(&exhausted), 75);
    }

    #[test]
    fn job_json_lists_every_task() {
        let job = job(&[TaskStatus::Pending, TaskStatus::Running]);
        let value = job_json(&job);
        assert_eq!(value["job"]["task_count"], 2);
        assert_eq!(value["tasks"][1]["status"], "running");
    }

    #[test]
    fn missing_times_render_as_dash() {
        assert_eq!(format_time(None), "-");
    }
}
