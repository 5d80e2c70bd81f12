//! CLI subcommand handlers.

use crate::{Commands, ConfigAction, QueryArgs};
use futures::StreamExt;
use meka_core::config::{MekaConfig, load_config};
use meka_core::pipeline::{PipelineEvent, PipelineState, Query};
use meka_core::{Pipeline, RunStatus, Services};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    model: Option<String>,
    workspace: &Path,
) -> anyhow::Result<()> {
    match command {
        Commands::Ask {
            question,
            query,
            json,
        } => handle_ask(&question, &query, json, model, workspace).await,
        Commands::Stream { question, query } => {
            handle_stream(&question, &query, model, workspace).await
        }
        Commands::Chat { query } => {
            let (config, services) = build_services(model, workspace).await?;
            let pipeline = Arc::new(Pipeline::from_services(&services));
            crate::repl::run_chat(pipeline, &query, &config).await
        }
        Commands::Submit {
            question,
            query,
            poll_ms,
        } => handle_submit(&question, &query, poll_ms, model, workspace).await,
        Commands::Resync => handle_resync(model, workspace).await,
        Commands::Config { action } => handle_config(action, workspace).await,
    }
}

pub(crate) fn load(model: Option<String>, workspace: &Path) -> anyhow::Result<MekaConfig> {
    let mut config = load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    if let Some(model) = model {
        config.llm.model = model;
    }
    Ok(config)
}

async fn build_services(
    model: Option<String>,
    workspace: &Path,
) -> anyhow::Result<(MekaConfig, Services)> {
    let config = load(model, workspace)?;
    let services = Services::from_config(&config, workspace).await?;
    Ok((config, services))
}

pub(crate) fn build_query(question: &str, args: &QueryArgs, config: &MekaConfig) -> Query {
    let thread = args
        .thread
        .clone()
        .unwrap_or_else(|| config.pipeline.default_thread_id.clone());
    Query::new(question)
        .with_web_search(args.web)
        .on_thread(thread)
}

pub(crate) fn print_result(state: &PipelineState) {
    println!("\n\x1b[32mMEKA:\x1b[0m {}", state.answer().unwrap_or_default().trim());
    if let Some(verdict) = state.verdict() {
        println!("\x1b[90m  [{}] {}\x1b[0m", verdict.status, verdict.reason);
    }
}

fn print_trace(state: &PipelineState) {
    println!("\n\x1b[90mReasoning trace:\x1b[0m");
    for line in state.trace().lines() {
        println!("\x1b[90m  - {}\x1b[0m", line);
    }
}

async fn handle_ask(
    question: &str,
    args: &QueryArgs,
    json: bool,
    model: Option<String>,
    workspace: &Path,
) -> anyhow::Result<()> {
    let (config, services) = build_services(model, workspace).await?;
    let pipeline = Pipeline::from_services(&services);
    let state = pipeline.run(build_query(question, args, &config)).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        print_result(&state);
        print_trace(&state);
    }
    Ok(())
}

async fn handle_stream(
    question: &str,
    args: &QueryArgs,
    model: Option<String>,
    workspace: &Path,
) -> anyhow::Result<()> {
    let (config, services) = build_services(model, workspace).await?;
    let pipeline = Arc::new(Pipeline::from_services(&services));
    let mut events = pipeline.stream(build_query(question, args, &config));

    let mut last_state = None;
    while let Some(event) = events.next().await {
        match event {
            PipelineEvent::Stage {
                stage,
                state,
                trace,
            } => {
                for line in &trace {
                    println!("\x1b[36m  [{}]\x1b[0m {}", stage, line);
                }
                last_state = Some(state);
            }
            PipelineEvent::Failed { stage, error } => {
                let stage = stage.map(|s| s.to_string()).unwrap_or_else(|| "pipeline".into());
                anyhow::bail!("{} failed: {}", stage, error);
            }
        }
    }
    if let Some(state) = last_state {
        print_result(&state);
    }
    Ok(())
}

async fn handle_submit(
    question: &str,
    args: &QueryArgs,
    poll_ms: u64,
    model: Option<String>,
    workspace: &Path,
) -> anyhow::Result<()> {
    let (config, services) = build_services(model, workspace).await?;
    let pipeline = Arc::new(Pipeline::from_services(&services));
    let id = pipeline.submit(build_query(question, args, &config)).await;
    println!("Submitted run {}", id);

    let mut last_status = None;
    loop {
        let record = pipeline
            .runs()
            .get(id)
            .await
            .ok_or_else(|| anyhow::anyhow!("Run {} disappeared from the registry", id))?;
        if last_status != Some(record.status) {
            println!("\x1b[90m  status: {}\x1b[0m", record.status);
            last_status = Some(record.status);
        }
        let record = if record.status.is_terminal() {
            pipeline.runs().take(id).await.unwrap_or(record)
        } else {
            record
        };
        match record.status {
            RunStatus::Completed => {
                if let Some(state) = &record.state {
                    print_result(state);
                }
                return Ok(());
            }
            RunStatus::Failed => {
                for line in record.partial_trace.lines() {
                    println!("\x1b[90m  - {}\x1b[0m", line);
                }
                anyhow::bail!(
                    "Run {} failed: {}",
                    id,
                    record.error.unwrap_or_else(|| "unknown error".into())
                );
            }
            RunStatus::Pending | RunStatus::Running => {
                tokio::time::sleep(Duration::from_millis(poll_ms.max(10))).await;
            }
        }
    }
}

async fn handle_resync(model: Option<String>, workspace: &Path) -> anyhow::Result<()> {
    let (_, services) = build_services(model, workspace).await?;
    let (vector, lexical) = services.retriever.resync().await?;
    println!(
        "Reindexed corpus: {} vector rows, {} keyword documents",
        vector, lexical
    );
    Ok(())
}

async fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".meka");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            std::fs::write(&config_path, MekaConfig::default().to_toml()?)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(None, workspace)?;
            println!("{}", config.to_toml()?);
            for warning in config.validate() {
                eprintln!("warning: {}", warning);
            }
            Ok(())
        }
    }
}
