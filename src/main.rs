//! Quickjit CLI
//!
//! Runs scripts through the tiered engine and exposes its internals:
//! bytecode listings, optimized graphs and deoptimization traces.

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand, ValueEnum};
use quickjit::{EngineConfig, OptimizationLevel, Runtime, Value, VERSION};
use rustyline::error::ReadlineError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quickjit")]
#[command(author, version, about = "A tiered JavaScript execution engine with speculative optimization", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Engine configuration (JSON)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Print every deoptimization as a JSON line on stderr
    #[arg(long, global = true)]
    trace_deopt: bool,

    /// Print tiering counters as JSON on stderr when done
    #[arg(long, global = true)]
    stats: bool,

    /// Never leave the interpreter
    #[arg(long, global = true)]
    interpreter_only: bool,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script file
    Run {
        file: PathBuf,
    },

    /// Evaluate a string of code and print its value
    Eval {
        code: String,
    },

    /// Compile and display bytecode
    Bytecode {
        /// A file, or inline code
        input: String,
    },

    /// Run a script to collect feedback, then print the optimized graph
    /// of one of its functions
    Ir {
        file: PathBuf,

        /// Global function to compile
        #[arg(short, long)]
        function: String,

        #[arg(short, long, value_enum, default_value_t = Level::Top)]
        level: Level,
    },

    /// Start an interactive session
    Repl,
}

#[derive(Clone, Copy, ValueEnum)]
enum Level {
    Mid,
    Top,
}

impl From<Level> for OptimizationLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Mid => OptimizationLevel::Mid,
            Level::Top => OptimizationLevel::Top,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let mut cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = load_config(&cli)?;
    match cli.command.take().unwrap_or(Commands::Repl) {
        Commands::Run { file } => {
            let source = read_source(&file)?;
            let mut runtime = runtime(config);
            let result = runtime.eval(&source);
            report(&cli, &runtime);
            result.map_err(|e| anyhow::anyhow!("{}", e))?;
        }
        Commands::Eval { code } => {
            let mut runtime = runtime(config);
            let result = runtime.eval(&code);
            report(&cli, &runtime);
            let value = result.map_err(|e| anyhow::anyhow!("{}", e))?;
            if !matches!(value, Value::Undefined) {
                println!("{}", runtime.agent().to_display_string(&value));
            }
        }
        Commands::Bytecode { input } => {
            let source = if Path::new(&input).exists() {
                read_source(Path::new(&input))?
            } else {
                input
            };
            let mut runtime = Runtime::with_config(config);
            let listing = runtime.disassemble(&source).map_err(|e| anyhow::anyhow!("{}", e))?;
            print!("{}", listing);
        }
        Commands::Ir { file, function, level } => {
            let source = read_source(&file)?;
            let mut runtime = Runtime::with_config(EngineConfig {
                interpreter_only: true,
                ..config
            });
            runtime.eval(&source).map_err(|e| anyhow::anyhow!("{}", e))?;
            let graph = runtime
                .dump_ir(&function, level.into())
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            print!("{}", graph);
        }
        Commands::Repl => run_repl(&cli, config)?,
    }
    Ok(())
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if cli.interpreter_only {
        config.interpreter_only = true;
    }
    if cli.trace_deopt && config.deopt_log_capacity == 0 {
        bail!("--trace-deopt needs a non-zero deopt_log_capacity");
    }
    Ok(config)
}

fn read_source(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn runtime(config: EngineConfig) -> Runtime {
    let mut runtime = Runtime::with_config(config);
    runtime.set_echo_output(true);
    runtime
}

fn report(cli: &Cli, runtime: &Runtime) {
    if cli.trace_deopt {
        for event in runtime.deopt_events() {
            match serde_json::to_string(&event) {
                Ok(line) => eprintln!("{}", line),
                Err(error) => tracing::warn!(%error, "could not serialize deopt event"),
            }
        }
    }
    if cli.stats {
        match serde_json::to_string_pretty(runtime.tiering_stats()) {
            Ok(text) => eprintln!("{}", text),
            Err(error) => tracing::warn!(%error, "could not serialize tiering stats"),
        }
    }
}

fn run_repl(cli: &Cli, config: EngineConfig) -> anyhow::Result<()> {
    println!("Quickjit {}", VERSION);
    println!("Type .help for help, .exit to quit\n");

    let mut editor = rustyline::DefaultEditor::new()?;
    let mut runtime = runtime(config);
    let mut seen_deopts = 0;
    loop {
        let line = match editor.readline(">> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(error) => return Err(error.into()),
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(input);

        match input {
            ".exit" | ".quit" => break,
            ".help" => {
                println!("  .exit           leave the session");
                println!("  .stats          tiering counters");
                println!("  .tier <name>    tier of a global function");
                println!("  .ir <name>      optimized graph of a global function");
                continue;
            }
            ".stats" => {
                println!("{:#?}", runtime.tiering_stats());
                continue;
            }
            _ => {}
        }
        if let Some(name) = input.strip_prefix(".tier ") {
            match runtime.tier_of(name.trim()) {
                Some(tier) => println!("{}", tier),
                None => println!("{} is not a function", name.trim()),
            }
            continue;
        }
        if let Some(name) = input.strip_prefix(".ir ") {
            match runtime.dump_ir(name.trim(), OptimizationLevel::Top) {
                Ok(graph) => print!("{}", graph),
                Err(error) => eprintln!("{}", error),
            }
            continue;
        }

        match runtime.eval(input) {
            Ok(Value::Undefined) => {}
            Ok(value) => println!("{}", runtime.agent().to_display_string(&value)),
            Err(error) => eprintln!("{}", error),
        }
        if cli.trace_deopt {
            let events = runtime.deopt_events();
            for event in events.iter().skip(seen_deopts) {
                if let Ok(line) = serde_json::to_string(event) {
                    eprintln!("{}", line);
                }
            }
            seen_deopts = events.len();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_survive_taking_the_command() {
        let mut cli = Cli::try_parse_from(["quickjit", "eval", "1 + 1", "--stats", "--interpreter-only"]).unwrap();
        let command = cli.command.take().unwrap_or(Commands::Repl);
        assert!(matches!(command, Commands::Eval { ref code } if code == "1 + 1"));
        assert!(cli.stats);
        assert!(load_config(&cli).unwrap().interpreter_only);
    }

    #[test]
    fn test_missing_command_means_repl() {
        let mut cli = Cli::try_parse_from(["quickjit"]).unwrap();
        assert!(matches!(cli.command.take().unwrap_or(Commands::Repl), Commands::Repl));
    }
}
