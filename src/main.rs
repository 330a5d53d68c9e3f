//! bulk-reindex - Throttled, sliced bulk-by-scroll reindexing
//!
//! Entry point for the CLI application.

use anyhow::{bail, Context, Result};
use bulk_reindex::config::{CliArgs, Command, JobRequest, ReindexArgs, RequestsPerSecond};
use bulk_reindex::progress::{print_header, print_summary, ProgressReporter};
use bulk_reindex::status::JobState;
use bulk_reindex::{SliceCoordinator, SqliteIndex, SqliteTaskStore, TaskManager, TaskStore};
use clap::Parser;
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often the control thread checks the task store and refreshes progress
const CONTROL_INTERVAL: Duration = Duration::from_millis(500);

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let args = CliArgs::parse();
    setup_logging(args.verbose)?;

    match &args.command {
        Command::Reindex(reindex) => run_reindex(reindex, args.quiet),
        Command::Status { tasks_db, task_id } => {
            let store = open_task_store(tasks_db)?;
            let status = store
                .load(task_id)
                .context("Failed to read task status")?
                .with_context(|| format!("No task {}", task_id))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Rethrottle {
            tasks_db,
            task_id,
            requests_per_second,
        } => {
            let store = open_task_store(tasks_db)?;
            request_rethrottle(&store, task_id, *requests_per_second)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Cancel { tasks_db, task_id } => {
            let store = open_task_store(tasks_db)?;
            match store.load(task_id)? {
                None => bail!("No task {}", task_id),
                Some(status) if status.is_terminal() => {
                    println!("Task {} already {}", task_id, status.state);
                }
                Some(_) => {
                    store.request_cancel(task_id)?;
                    println!("Cancel requested for task {}", task_id);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_reindex(args: &ReindexArgs, quiet: bool) -> Result<ExitCode> {
    let request = JobRequest::from_args(args).context("Invalid configuration")?;

    let source = Arc::new(
        SqliteIndex::open(&args.source_db)
            .with_context(|| format!("Failed to open {}", args.source_db.display()))?,
    );
    let dest = if same_file(&args.source_db, &args.dest_db) {
        Arc::clone(&source)
    } else {
        Arc::new(
            SqliteIndex::open(&args.dest_db)
                .with_context(|| format!("Failed to open {}", args.dest_db.display()))?,
        )
    };
    let store: Arc<dyn TaskStore> = Arc::new(open_task_store(&args.tasks_db)?);

    let manager = Arc::new(TaskManager::new(SliceCoordinator::new(source, dest), store));
    let task_id = manager.submit(request.clone()).context("Failed to start reindex")?;

    if quiet {
        println!("{}", task_id);
    } else {
        print_header(&request, &task_id);
    }

    {
        let manager = Arc::clone(&manager);
        let task_id = task_id.clone();
        ctrlc::set_handler(move || {
            eprintln!("\nInterrupt received, cancelling...");
            if let Err(e) = manager.cancel(&task_id) {
                warn!(error = %e, "Failed to cancel task");
            }
        })
        .context("Failed to set signal handler")?;
    }

    // Control thread: applies cancel/rethrottle requests from other
    // processes and refreshes the spinner
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let control = {
        let manager = Arc::clone(&manager);
        let task_id = task_id.clone();
        thread::Builder::new()
            .name("control".into())
            .spawn(move || {
                let progress = (!quiet).then(ProgressReporter::new);
                if let Some(p) = &progress {
                    p.set_status("Starting slices...");
                }
                loop {
                    match stop_rx.recv_timeout(CONTROL_INTERVAL) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    manager.poll_control();
                    if let (Some(p), Ok(status)) = (&progress, manager.status(&task_id)) {
                        p.update(&status);
                    }
                }
                if let Some(p) = progress {
                    p.finish_and_clear();
                }
            })
            .context("Failed to start control thread")?
    };

    let result = manager.wait(&task_id, None);
    drop(stop_tx);
    if control.join().is_err() {
        warn!("Control thread panicked");
    }
    let status = result.context("Reindex failed")?;

    if !quiet {
        print_summary(&status);
    }
    info!(task = %task_id, state = %status.state, "Reindex ended");

    Ok(match status.state {
        JobState::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

fn open_task_store(path: &Path) -> Result<SqliteTaskStore> {
    SqliteTaskStore::open(path).with_context(|| format!("Failed to open task store {}", path.display()))
}

fn request_rethrottle(store: &SqliteTaskStore, task_id: &str, rps: RequestsPerSecond) -> Result<()> {
    match store.load(task_id)? {
        None => bail!("No task {}", task_id),
        Some(status) if status.is_terminal() => {
            println!("Task {} already {}", task_id, status.state);
        }
        Some(_) => {
            store.request_rethrottle(task_id, rps)?;
            println!("Rethrottle to {} requested for task {}", rps, task_id);
        }
    }
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("bulk_reindex=debug,warn")
    } else {
        EnvFilter::new("bulk_reindex=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
