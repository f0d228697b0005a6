//! Command-line interface for showrunner.
//!
//! `run` hosts a runtime for the duration of one pipeline instance; the
//! remaining commands read instance state or append out-of-band signals
//! (approval, cancel) that a hosting process picks up through its wake
//! watcher. One hosting process per state root — signal writers never run
//! replay passes themselves.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use crate::activities::media;
use crate::config;
use crate::core::{append_signal, list_instances, read_status, Runtime, RuntimeOptions, WakeWatcher};
use crate::domain::{EventKind, InstanceStatus};
use crate::workflows::{video, OrchestrationRegistry};

/// showrunner - durable video pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "showrunner")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the video pipeline for a source video and wait for it to finish
    Run {
        /// Source video location (e.g. raw/video1.mp4)
        location: String,

        /// Use a specific instance id instead of a generated one
        #[arg(long)]
        instance_id: Option<String>,

        /// Give up waiting after this many seconds (the instance keeps its
        /// state and can be resumed)
        #[arg(long)]
        wait_timeout_seconds: Option<u64>,
    },

    /// Resume a previously started instance after a restart
    Resume {
        /// Instance id to resume
        instance: String,

        /// Give up waiting after this many seconds
        #[arg(long)]
        wait_timeout_seconds: Option<u64>,
    },

    /// Check the status of an instance
    Status {
        /// Instance id
        instance: String,
    },

    /// List known instances
    List {
        /// Maximum number of instances to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Record an approval decision for an instance awaiting review
    Approve {
        /// Instance id
        instance: String,

        /// Reject instead of approving
        #[arg(long)]
        reject: bool,
    },

    /// Raise a named external event against an instance
    Raise {
        /// Instance id
        instance: String,

        /// Event name
        event: String,

        /// JSON payload (raw strings are accepted as-is)
        payload: String,
    },

    /// Request cancellation of a running instance
    Cancel {
        /// Instance id
        instance: String,

        /// Reason recorded with the cancel request
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },

    /// Show resolved configuration
    Config,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                location,
                instance_id,
                wait_timeout_seconds,
            } => run_pipeline(location, instance_id, wait_timeout_seconds).await,
            Commands::Resume {
                instance,
                wait_timeout_seconds,
            } => resume_instance(instance, wait_timeout_seconds).await,
            Commands::Status { instance } => show_status(&instance),
            Commands::List { limit } => list(limit),
            Commands::Approve { instance, reject } => {
                let payload = if reject { "Rejected" } else { "Approved" };
                raise(&instance, video::APPROVAL_EVENT, json!(payload))
            }
            Commands::Raise {
                instance,
                event,
                payload,
            } => {
                let payload: Value =
                    serde_json::from_str(&payload).unwrap_or(Value::String(payload));
                raise(&instance, &event, payload)
            }
            Commands::Cancel { instance, reason } => cancel(&instance, &reason),
            Commands::Config => show_config(),
        }
    }
}

fn build_runtime() -> Result<Runtime> {
    let cfg = config::config()?;

    let activities = media::registry(cfg.bit_rates.clone());

    let mut orchestrations = OrchestrationRegistry::new();
    video::register(
        &mut orchestrations,
        video::VideoPipelineSettings {
            approval_timeout: cfg.approval_timeout,
        },
    );

    let options = RuntimeOptions {
        workers: cfg.workers,
        retry: cfg.retry.clone(),
    };

    Ok(Runtime::new(
        config::instances_dir()?,
        activities,
        orchestrations,
        options,
    ))
}

async fn run_pipeline(
    location: String,
    instance_id: Option<String>,
    wait_timeout_seconds: Option<u64>,
) -> Result<()> {
    let runtime = build_runtime()?;
    let watcher = WakeWatcher::spawn(&runtime)?;

    let instance = runtime
        .start(video::PROCESS_VIDEO, instance_id, json!(location))
        .await
        .context("Failed to start pipeline")?;

    println!("Started instance {}", instance);
    println!("Approve with: showrunner approve {}", instance);

    let result = wait_and_report(&runtime, &instance, wait_timeout_seconds).await;
    watcher.stop().await?;
    result
}

async fn resume_instance(instance: String, wait_timeout_seconds: Option<u64>) -> Result<()> {
    let runtime = build_runtime()?;
    let watcher = WakeWatcher::spawn(&runtime)?;

    let resumed = runtime.recover().await.context("Recovery failed")?;
    println!("Recovered {} instance(s)", resumed);

    let result = wait_and_report(&runtime, &instance, wait_timeout_seconds).await;
    watcher.stop().await?;
    result
}

async fn wait_and_report(
    runtime: &Runtime,
    instance: &str,
    wait_timeout_seconds: Option<u64>,
) -> Result<()> {
    // "No timeout" is a year; adding Duration::MAX to an Instant overflows.
    let timeout = wait_timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(365 * 24 * 3600));

    let state = runtime
        .wait_for_completion(instance, timeout)
        .await
        .with_context(|| format!("Instance {} did not finish in time", instance))?;

    print_instance(&state);
    Ok(())
}

fn show_status(instance: &str) -> Result<()> {
    let root = config::instances_dir()?;
    let state = read_status(&root, instance)?;
    print_instance(&state);
    Ok(())
}

fn list(limit: usize) -> Result<()> {
    let root = config::instances_dir()?;
    let instances = list_instances(&root)?;

    if instances.is_empty() {
        println!("No instances found");
        return Ok(());
    }

    for instance in instances.into_iter().take(limit) {
        println!(
            "{}  {}  {}  started {}",
            instance.id,
            instance.orchestration,
            status_label(instance.status),
            instance.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

fn raise(instance: &str, event: &str, payload: Value) -> Result<()> {
    let root = config::instances_dir()?;

    match append_signal(
        &root,
        instance,
        EventKind::EventRaised {
            name: event.to_string(),
            payload,
        },
    ) {
        Ok(()) => {
            println!("Raised '{}' for instance {}", event, instance);
            Ok(())
        }
        Err(e) => {
            // Reported, not fatal: raising against a missing or finished
            // instance is a no-op by design.
            eprintln!("Warning: {}", e);
            Ok(())
        }
    }
}

fn cancel(instance: &str, reason: &str) -> Result<()> {
    let root = config::instances_dir()?;

    match append_signal(
        &root,
        instance,
        EventKind::CancelRequested {
            reason: reason.to_string(),
        },
    ) {
        Ok(()) => {
            println!("Cancel requested for instance {}", instance);
            Ok(())
        }
        Err(e) => {
            eprintln!("Warning: {}", e);
            Ok(())
        }
    }
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("home: {}", cfg.home.display());
    println!("instances: {}", config::instances_dir()?.display());
    match cfg.approval_timeout {
        Some(t) => println!("approval timeout: {}s", t.as_secs()),
        None => println!("approval timeout: none (wait indefinitely)"),
    }
    println!("bit rates: {:?}", cfg.bit_rates);
    println!("workers: {}", cfg.workers);
    match &cfg.config_file {
        Some(path) => println!("config file: {}", path.display()),
        None => println!("config file: (defaults)"),
    }

    Ok(())
}

fn print_instance(state: &crate::domain::Instance) {
    println!("instance:      {}", state.id);
    println!("orchestration: {}", state.orchestration);
    println!("status:        {}", status_label(state.status));
    if let Some(output) = &state.output {
        println!(
            "output:        {}",
            serde_json::to_string_pretty(output).unwrap_or_default()
        );
    }
}

fn status_label(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Running => "running",
        InstanceStatus::Completed => "completed",
        InstanceStatus::Failed => "failed",
        InstanceStatus::Terminated => "terminated",
    }
}
