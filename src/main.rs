//! isofork - run functions in isolated worker processes

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use isofork::logging::{self, LogConfig};
use isofork::{Registry, builtin, get_port, worker};
use owo_colors::{OwoColorize, Stream::Stderr};
use serde_json::Value;

use cli::{CallArgs, Cli, Commands};

fn main() {
    let cli = Cli::parse();

    let no_color = cli.colors_disabled();
    if no_color {
        owo_colors::set_override(false);
    }

    let result = match &cli.command {
        Commands::Worker(args) => {
            init_logging(&cli, no_color, LogConfig::for_worker());
            worker::run_worker_main(
                &args.name,
                &args.path,
                &builtin::handlers(),
                args.debug_port,
            )
        }
        Commands::Call(args) => {
            init_logging(&cli, no_color, LogConfig::default());
            cmd_call(args)
        }
        Commands::Port => {
            init_logging(&cli, no_color, LogConfig::default());
            cmd_port()
        }
        Commands::Completions(args) => {
            args.generate();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Print the error chain if there are causes
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Install the tracing subscriber; command-line flags win over the environment.
fn init_logging(cli: &Cli, no_color: bool, preset: LogConfig) {
    let verbosity = LogConfig::from_verbosity(cli.verbose, cli.quiet);
    let mut config = preset.with_level(verbosity.level);
    if let Some(filter) = verbosity.filter {
        config = config.with_filter(filter);
    }
    let mut config = config.with_env_overrides();
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    if no_color {
        config = config.with_ansi(false);
    }
    logging::init_with_file(config);
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")
}

fn cmd_call(args: &CallArgs) -> Result<()> {
    let rt = runtime()?;
    let result = rt.block_on(async {
        let registry = Registry::from_env();
        let config = args.worker_config();
        let outcome = async {
            let callable = registry
                .register_value(
                    &Value::String(args.name.clone()),
                    &Value::String(args.path.clone()),
                    config.as_ref(),
                )
                .await
                .with_context(|| format!("Failed to register '{}'", args.name))?;
            callable
                .call(args.params())
                .await
                .with_context(|| format!("Call to '{}' failed", args.name))
        }
        .await;
        registry.shutdown().await;
        outcome
    })?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn cmd_port() -> Result<()> {
    let port = runtime()?
        .block_on(get_port())
        .context("Failed to allocate a port")?;
    println!("{}", port);
    Ok(())
}
