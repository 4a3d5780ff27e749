//! parley - replay scripted conversations through a session

mod config;
mod script;
mod ui;
mod utils;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use futures::StreamExt;
use parley_agent::{ChannelObserver, DEFAULT_GREETING_TIMEOUT, Return, Session, TracingObserver};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::script::{Script, ScriptedExecutor};

/// parley - drive a conversation session from a script
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a JSON script through a session and print what happens
    Replay(ReplayArgs),
}

#[derive(clap::Args, Debug)]
struct ReplayArgs {
    /// Script file
    script: PathBuf,

    /// Consume provider replies as delta streams
    #[arg(long)]
    stream: bool,

    /// Provider-call budget for the run
    #[arg(long)]
    max_turns: Option<u32>,

    /// Tool passes allowed per turn
    #[arg(long)]
    max_tool_passes: Option<u32>,

    /// Run the tool calls of one pass concurrently
    #[arg(long)]
    parallel_tools: bool,

    /// Leave tool calls pending instead of executing them
    #[arg(long)]
    no_tools: bool,

    /// Ask for an opening message with this instruction before the run
    #[arg(long)]
    greet: Option<String>,

    /// Print events and history as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    if args.init_config {
        match Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => eprintln!("Failed to create config: {}", e),
        }
        return Ok(());
    }

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    let config = Config::load();
    match command {
        Command::Replay(replay_args) => {
            let ret = replay(&config, replay_args).await?;
            if !ret.success {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("parley=debug,parley_agent=debug,parley_ai=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn replay(config: &Config, args: ReplayArgs) -> anyhow::Result<Return> {
    let script = Script::load(&args.script)?;

    let mut options = config.session.clone();
    if let Some(max_turns) = args.max_turns {
        options.max_turns = max_turns;
    }
    if let Some(max_tool_passes) = args.max_tool_passes {
        options.max_tool_passes = max_tool_passes;
    }
    if args.parallel_tools {
        options.allow_parallel_tools = true;
    }
    if args.no_tools {
        options.process_tools = false;
    }

    let (observer, receiver) = ChannelObserver::new(1024);
    let mut session = Session::new(
        config.request_config(script.context_window),
        script.body(),
        Arc::new(ScriptedExecutor::new(&script)),
    )
    .with_observer(Arc::new(observer))
    .with_observer(Arc::new(TracingObserver))
    .with_context_config(config.context.clone());

    let handle = session.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    if let Some(instruction) = args.greet {
        match session.greet(instruction, DEFAULT_GREETING_TIMEOUT).await {
            Some(greeting) => println!("assistant> {}", ui::describe(&greeting)),
            None => eprintln!("Warning: no greeting produced"),
        }
    }

    let printer = tokio::spawn(ui::print_events(receiver, args.json));

    let ret = if args.stream {
        let updates = session.stream(options, config.streaming.clone(), CancellationToken::new());
        let mut updates = std::pin::pin!(updates);
        let mut last = None;
        while let Some(update) = updates.next().await {
            tracing::trace!(stage = ?update.stage, "Stream update");
            last = Some(update);
        }
        last.context("stream ended without a final result")?
    } else {
        session
            .run_to_stable_result(&options, CancellationToken::new())
            .await
    };

    printer.await?;
    ui::print_history(&ret, args.json)?;
    Ok(ret)
}
