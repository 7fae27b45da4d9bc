#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use kbridge::daemon::{BridgeClient, BridgeConfig};
use kbridge::{logging, ExecutionResult};
use std::io::{self, Read};
use std::process;
use std::time::Duration;

/// Send code to a running interpreter through the kbridge daemon
#[derive(Parser, Debug)]
#[command(name = "kbridge")]
struct Cli {
    /// Code to execute; read from stdin when omitted
    #[arg(short = 'c', long = "code")]
    code: Option<String>,

    /// Daemon port on 127.0.0.1
    #[arg(long)]
    port: Option<u16>,

    /// Idle timeout in seconds for a daemon started by this call
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    /// Fail instead of starting a daemon when none is running
    #[arg(long)]
    no_spawn: bool,

    /// Output verbose debug messages
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    logging::init(if cli.verbose { "debug" } else { "warn" });

    match run(&cli) {
        Ok(result) => {
            let failed = !result.is_success();
            if let Err(e) = report(&result, cli.json) {
                eprintln!("kbridge: {:#}", e);
                process::exit(2);
            }
            process::exit(if failed { 1 } else { 0 });
        }
        Err(e) => {
            eprintln!("kbridge: {:#}", e);
            process::exit(2);
        }
    }
}

fn run(cli: &Cli) -> Result<ExecutionResult> {
    let code = match &cli.code {
        Some(code) => code.clone(),
        None => {
            let mut code = String::new();
            io::stdin()
                .read_to_string(&mut code)
                .context("failed to read code from stdin")?;
            code
        }
    };

    let mut config = BridgeConfig::load();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(secs) = cli.idle_timeout {
        config.idle_timeout = Duration::from_secs(secs);
    }

    let mut client = BridgeClient::new(&config);
    if cli.no_spawn {
        client = client.without_spawn();
    }

    client
        .execute(&code)
        .with_context(|| format!("failed to execute via daemon at {}", client.addr()))
}

fn report(result: &ExecutionResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    if !result.output.is_empty() {
        println!("{}", result.output);
    }

    if let Some(error) = &result.error {
        eprintln!("{}", error.message);
        for frame in &error.frames {
            eprintln!("  {}", frame.location());
            for line in frame.text.lines() {
                eprintln!("    {}", line);
            }
        }
    }

    Ok(())
}
