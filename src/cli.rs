//! Command-line interface definitions using clap.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use isofork::logging::LogFormat;
use serde_json::Value;
use std::ffi::OsStr;
use std::path::PathBuf;

/// Run functions in isolated worker processes.
#[derive(Parser, Debug)]
#[command(name = "isofork")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Log output format (pretty, compact, json).
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// Disable colored output (also set by a non-empty NO_COLOR).
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Whether colour is off, from `--no-color` or the `NO_COLOR` convention.
    pub fn colors_disabled(&self) -> bool {
        no_color_requested(self.no_color, std::env::var_os("NO_COLOR").as_deref())
    }
}

/// Any non-empty `NO_COLOR` value disables colour, per no-color.org.
fn no_color_requested(flag: bool, env: Option<&OsStr>) -> bool {
    flag || env.is_some_and(|value| !value.is_empty())
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run as a worker process (spawned by a registry).
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Register a module, call it once and print the result as JSON.
    Call(CallArgs),

    /// Print a free local TCP port.
    Port,

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for the worker entry point.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Name the worker is registered under.
    pub name: String,

    /// Absolute path of the module to load.
    pub path: PathBuf,

    /// Port reserved for attaching a debugger to this worker.
    #[arg(long, env = "ISOFORK_DEBUG_PORT")]
    pub debug_port: Option<u16>,
}

/// Arguments for the call command.
#[derive(Parser, Debug)]
pub struct CallArgs {
    /// Name to register the worker under.
    pub name: String,

    /// Absolute path of the module to load.
    pub path: String,

    /// Arguments passed to the handler. Each is parsed as JSON, falling back
    /// to a plain string.
    #[arg(allow_negative_numbers = true)]
    pub args: Vec<String>,

    /// Worker config as a JSON object, e.g. '{"timeoutMs": 500}'.
    #[arg(long, value_parser = parse_json)]
    pub config: Option<Value>,

    /// Request timeout in milliseconds (overrides --config).
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

impl CallArgs {
    /// Handler arguments as JSON values.
    pub fn params(&self) -> Vec<Value> {
        self.args
            .iter()
            .map(|arg| serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.clone())))
            .collect()
    }

    /// Worker config with `--timeout-ms` folded in.
    pub fn worker_config(&self) -> Option<Value> {
        match (self.config.clone(), self.timeout_ms) {
            (config, None) => config,
            (None, Some(ms)) => Some(serde_json::json!({ "timeoutMs": ms })),
            (Some(Value::Object(mut map)), Some(ms)) => {
                map.insert("timeoutMs".to_string(), ms.into());
                Some(Value::Object(map))
            }
            // Not an object: left for registration to reject.
            (Some(other), Some(_)) => Some(other),
        }
    }
}

fn parse_json(s: &str) -> Result<Value, String> {
    serde_json::from_str(s).map_err(|e| format!("invalid JSON: {}", e))
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "isofork",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cli_parsing() {
        // Verify the CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_worker_command() {
        let args = Cli::try_parse_from(["isofork", "worker", "fork1", "/m/echo.json"]).unwrap();
        match args.command {
            Commands::Worker(worker) => {
                assert_eq!(worker.name, "fork1");
                assert_eq!(worker.path, PathBuf::from("/m/echo.json"));
            }
            _ => panic!("Expected Worker command"),
        }
    }

    #[test]
    fn test_worker_debug_port() {
        let args = Cli::try_parse_from([
            "isofork",
            "worker",
            "fork1",
            "/m/echo.json",
            "--debug-port",
            "9230",
        ])
        .unwrap();
        match args.command {
            Commands::Worker(worker) => assert_eq!(worker.debug_port, Some(9230)),
            _ => panic!("Expected Worker command"),
        }
    }

    #[test]
    fn test_call_params() {
        let args = Cli::try_parse_from([
            "isofork", "call", "f", "/m/sum.json", "1", "-2", "{\"a\":1}", "plain",
        ])
        .unwrap();
        match args.command {
            Commands::Call(call) => {
                assert_eq!(
                    call.params(),
                    vec![json!(1), json!(-2), json!({ "a": 1 }), json!("plain")]
                );
                assert_eq!(call.worker_config(), None);
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_call_flags_after_params() {
        let args = Cli::try_parse_from([
            "isofork",
            "call",
            "f",
            "/m/sleep.json",
            "2000",
            "--timeout-ms",
            "100",
            "-3",
        ])
        .unwrap();
        match args.command {
            Commands::Call(call) => {
                assert_eq!(call.params(), vec![json!(2000), json!(-3)]);
                assert_eq!(call.timeout_ms, Some(100));
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_no_color_convention() {
        assert!(!no_color_requested(false, None));
        assert!(!no_color_requested(false, Some(OsStr::new(""))));
        assert!(no_color_requested(false, Some(OsStr::new("1"))));
        assert!(no_color_requested(false, Some(OsStr::new("false"))));
        assert!(no_color_requested(true, None));
    }

    #[test]
    fn test_call_config_merge() {
        let args = Cli::try_parse_from([
            "isofork",
            "call",
            "f",
            "/m/echo.json",
            "--config",
            "{\"debugPort\": 9229}",
            "--timeout-ms",
            "50",
        ])
        .unwrap();
        match args.command {
            Commands::Call(call) => assert_eq!(
                call.worker_config(),
                Some(json!({ "debugPort": 9229, "timeoutMs": 50 }))
            ),
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_call_rejects_bad_config_json() {
        let result = Cli::try_parse_from(["isofork", "call", "f", "/m/echo.json", "--config", "{"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_flags() {
        let args = Cli::try_parse_from(["isofork", "-vv", "--log-format", "json", "port"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert_eq!(args.log_format, Some(LogFormat::Json));
        assert!(matches!(args.command, Commands::Port));

        assert!(Cli::try_parse_from(["isofork", "-q", "-v", "port"]).is_err());
    }
}
