//! agent-dispatch - server and CLI entry point.
//!
//! `serve` starts the HTTP API. `dispatch` submits a prompt to a running
//! server and prints the result (or, with `--estimate`, the cost estimate).

use std::io::{IsTerminal, Read};

use agent_dispatch::{api, config::Config, task::Task};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "agent-dispatch", version, about = "Task dispatch for AI agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP server
    Serve,
    /// Dispatch a prompt to a running server
    Dispatch(DispatchArgs),
}

#[derive(Debug, clap::Args)]
struct DispatchArgs {
    /// Prompt text; read from stdin when omitted
    prompt: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// Timeout such as "15m" or "1h30m"
    #[arg(long)]
    timeout: Option<String>,
    /// Per-task budget in USD
    #[arg(long)]
    budget: Option<f64>,
    #[arg(long)]
    workdir: Option<String>,
    /// Permission mode passed to the provider
    #[arg(long)]
    permission: Option<String>,
    /// Agent persona to run as
    #[arg(long)]
    role: Option<String>,
    /// Print a cost estimate instead of running
    #[arg(long)]
    estimate: bool,
}

impl DispatchArgs {
    fn into_task(self, prompt: String) -> Task {
        let mut task = Task::new(prompt).with_source("cli");
        task.model = self.model.unwrap_or_default();
        task.timeout = self.timeout.unwrap_or_default();
        task.budget = self.budget.unwrap_or_default();
        task.workdir = self.workdir.unwrap_or_default();
        task.permission_mode = self.permission.unwrap_or_default();
        task.agent = self.role.unwrap_or_default();
        task
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_dispatch=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Command::Serve => {
            tracing::info!(
                "Loaded configuration: model={} provider={} max_concurrent={}",
                config.default_model,
                config.default_provider,
                config.max_concurrent
            );
            api::serve(config).await
        }
        Command::Dispatch(args) => run_dispatch(&config, args).await,
    }
}

fn read_prompt(arg: Option<String>) -> anyhow::Result<String> {
    let prompt = match arg {
        Some(p) => p,
        None => {
            let mut stdin = std::io::stdin();
            if stdin.is_terminal() {
                bail!("no prompt given (pass it as an argument or pipe it on stdin)");
            }
            let mut buf = String::new();
            stdin.read_to_string(&mut buf).context("failed to read prompt from stdin")?;
            buf
        }
    };
    let prompt = prompt.trim().to_string();
    if prompt.is_empty() {
        bail!("prompt is empty");
    }
    Ok(prompt)
}

async fn run_dispatch(config: &Config, mut args: DispatchArgs) -> anyhow::Result<()> {
    let prompt = read_prompt(args.prompt.take())?;
    let estimate = args.estimate;
    let task = args.into_task(prompt);

    let path = if estimate { "dispatch/estimate" } else { "dispatch" };
    let url = format!("http://{}:{}/{}", config.host, config.port, path);
    let resp = reqwest::Client::new()
        .post(&url)
        .json(&vec![task])
        .send()
        .await
        .with_context(|| format!("failed to reach {}", url))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("server returned {}: {}", status, body);
    }
    let body: Value = resp.json().await.context("invalid response body")?;

    if estimate {
        print_estimate(&body);
    } else {
        print_dispatch(&body);
    }
    Ok(())
}

fn print_estimate(body: &Value) {
    for task in body["tasks"].as_array().into_iter().flatten() {
        println!(
            "{}  model={}  ~${:.4}  ({})",
            task["name"].as_str().unwrap_or("-"),
            task["model"].as_str().unwrap_or("-"),
            task["estimatedCostUsd"].as_f64().unwrap_or(0.0),
            task["breakdown"].as_str().unwrap_or(""),
        );
    }
    let classify = body["classifyCostUsd"].as_f64().unwrap_or(0.0);
    if classify > 0.0 {
        println!("routing: ~${:.4}", classify);
    }
    println!("total: ~${:.4}", body["totalEstimatedCostUsd"].as_f64().unwrap_or(0.0));
}

fn print_dispatch(body: &Value) {
    for task in body["tasks"].as_array().into_iter().flatten() {
        let status = task["status"].as_str().unwrap_or("unknown");
        println!("[{}] {}", status, task["name"].as_str().unwrap_or("-"));
        if let Some(output) = task["output"].as_str().filter(|o| !o.is_empty()) {
            println!("{}", output);
        }
        if let Some(error) = task["error"].as_str().filter(|e| !e.is_empty()) {
            eprintln!("error: {}", error);
        }
    }
    if let Some(summary) = body["summary"].as_str() {
        println!("{}", summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_args_to_task() {
        let cli = Cli::parse_from([
            "agent-dispatch",
            "dispatch",
            "fix the build",
            "--model",
            "opus",
            "--timeout",
            "20m",
            "--role",
            "coder",
            "--estimate",
        ]);
        let Command::Dispatch(args) = cli.command else {
            panic!("expected dispatch");
        };
        assert!(args.estimate);
        let task = args.into_task("fix the build".to_string());
        assert_eq!(task.model, "opus");
        assert_eq!(task.timeout, "20m");
        assert_eq!(task.agent, "coder");
        assert_eq!(task.source, "cli");
        assert!(task.workdir.is_empty());
    }

    #[test]
    fn test_prompt_argument_is_trimmed() {
        assert_eq!(read_prompt(Some("  hi \n".to_string())).unwrap(), "hi");
        assert!(read_prompt(Some("   ".to_string())).is_err());
    }
}
