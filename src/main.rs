// src/main.rs
//! exit-intercept CLI
//!
//! Runs WebAssembly modules with `proc_exit` interception attached.
//!
//! # Commands
//!
//! - `run`: call an export; an exit ends this process with the guest's code
//! - `test`: call an export under a declared exit expectation and report
//! - `rewrite`: write the rewritten form of a module to disk

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use exit_intercept::interception::policy::RewritePolicy;
use exit_intercept::interception::rewriter::{RewriteOutcome, Rewriter};
use exit_intercept::observability::{init_tracing, verbosity_filter};
use exit_intercept::runtime::loader::module_name_for_path;
use exit_intercept::{Agent, ExitDeclaration, ExitTest, InterceptConfig, InterceptError};
use std::path::PathBuf;
use tracing::{debug, error, info};

/// Run WebAssembly modules with exit interception
#[derive(Parser)]
#[command(name = "exit-intercept")]
#[command(version)]
#[command(about = "Run WebAssembly modules with proc_exit interception")]
#[command(propagate_version = true)]
struct Cli {
    /// Rewrite policy, e.g. "+app/**,-app/vendor/**"
    #[arg(long, global = true, allow_hyphen_values = true)]
    policy: Option<String>,

    /// Configuration file (defaults to ./exit-intercept.{toml,yaml,json})
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Module file (.wasm or .wat)
    module: PathBuf,

    /// Export to call
    #[arg(long, default_value = "_start")]
    export: String,

    /// Argument for an `(i32) -> ()` export
    #[arg(long, allow_hyphen_values = true)]
    arg: Option<i32>,

    /// Module name used for policy matching (defaults to the path)
    #[arg(long)]
    name: Option<String>,
}

impl Target {
    fn module_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| module_name_for_path(&self.module))
    }

    fn invoke(&self, agent: &Agent) -> exit_intercept::Result<()> {
        let loaded = agent
            .loader()
            .load_file_as(&self.module_name(), &self.module)?;
        let mut guest = agent.instantiate_loaded(&loaded)?;

        match self.arg {
            Some(arg) => guest.invoke_with(&self.export, arg),
            None => guest.invoke(&self.export),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a module; an exit ends this process with the module's code
    Run {
        #[command(flatten)]
        target: Target,
    },
    /// Run a module as a test with a declared exit expectation
    Test {
        #[command(flatten)]
        target: Target,

        /// Acceptable exit code (repeatable; none means any code)
        #[arg(long = "expect", allow_hyphen_values = true)]
        expect: Vec<i32>,

        /// Fail if the module exits at all
        #[arg(long, conflicts_with_all = ["expect", "exactly_once"])]
        forbid: bool,

        /// Fail on more than one exit attempt
        #[arg(long)]
        exactly_once: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Rewrite a module's exit calls and write the result
    Rewrite {
        /// Input module (.wasm or .wat)
        input: PathBuf,

        /// Output path for the binary module
        output: PathBuf,

        /// Module name used for policy matching (defaults to the input path)
        #[arg(long)]
        name: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("exit-intercept: {:#}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = init_tracing(&config, verbosity_filter(cli.verbose)) {
        eprintln!("exit-intercept: {}", e);
        std::process::exit(2);
    }

    debug!("Configuration loaded: {:?}", config);

    let code = match execute(cli.command, &config) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            2
        }
    };

    std::process::exit(code);
}

fn load_config(cli: &Cli) -> Result<InterceptConfig> {
    let mut config = match &cli.config {
        Some(path) => InterceptConfig::load_from(path)?,
        None => InterceptConfig::load()?,
    };

    if let Some(policy) = &cli.policy {
        config.policy = Some(policy.clone());
    }

    Ok(config)
}

fn execute(command: Commands, config: &InterceptConfig) -> Result<i32> {
    match command {
        Commands::Run { target } => run(&target, config),
        Commands::Test {
            target,
            expect,
            forbid,
            exactly_once,
            json,
        } => {
            let declaration = if forbid {
                ExitDeclaration::forbid()
            } else if expect.is_empty() {
                ExitDeclaration::any()
            } else {
                ExitDeclaration::codes(expect)
            };
            let declaration = if exactly_once {
                declaration.exactly_once()
            } else {
                declaration
            };

            test(&target, declaration, json, config)
        }
        Commands::Rewrite {
            input,
            output,
            name,
        } => rewrite(input, output, name, config),
    }
}

fn run(target: &Target, config: &InterceptConfig) -> Result<i32> {
    let agent = Agent::attach_with_config(config)?;
    info!("Running {}.{}", target.module_name(), target.export);

    match target.invoke(agent) {
        Ok(()) => {
            debug!("Agent stats: {:?}", agent.stats());
            Ok(0)
        }
        Err(InterceptError::Exited(signal)) => Ok(signal.code),
        Err(InterceptError::GuestError(message)) => {
            error!("{}", message);
            Ok(1)
        }
        Err(e) => Err(e.into()),
    }
}

fn test(
    target: &Target,
    declaration: ExitDeclaration,
    json: bool,
    config: &InterceptConfig,
) -> Result<i32> {
    let agent = Agent::attach_with_config(config)?;
    let name = format!("{}.{}", target.module_name(), target.export);

    let report = ExitTest::new(&name, declaration)
        .leak_policy(config.leak_policy)
        .run(|| {
            target.invoke(agent)?;
            Ok(())
        });

    debug!("Agent stats: {:?}", agent.stats());

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        match report.message() {
            None => println!("PASS {} (codes {:?})", report.name, report.codes()),
            Some(message) => println!("FAIL {}: {}", report.name, message),
        }
    }

    Ok(if report.passed() { 0 } else { 1 })
}

fn rewrite(
    input: PathBuf,
    output: PathBuf,
    name: Option<String>,
    config: &InterceptConfig,
) -> Result<i32> {
    let module_name = name.unwrap_or_else(|| module_name_for_path(&input));
    let source = std::fs::read(&input).with_context(|| format!("reading {:?}", input))?;
    let binary = wat::parse_bytes(&source).with_context(|| format!("parsing {:?}", input))?;

    let policy = RewritePolicy::from_option(config.policy.as_deref())?;
    let decision = policy.decide(&module_name);

    let bytes = if decision.eligible {
        let outcome = Rewriter::new(config.verify_rewrites).rewrite_or_original(&module_name, &binary);
        match &outcome {
            RewriteOutcome::Rewritten(rewritten) => println!(
                "{}: rewrote {} call site(s), skipped {}",
                module_name, rewritten.call_sites, rewritten.skipped_call_sites
            ),
            RewriteOutcome::Unchanged(_) => println!("{}: no call sites, unchanged", module_name),
            RewriteOutcome::FailedClosed(_, e) => {
                println!("{}: left unchanged ({})", module_name, e)
            }
        }
        outcome.into_bytes().into_owned()
    } else {
        println!(
            "{}: excluded by policy ({})",
            module_name,
            decision.rule.as_deref().unwrap_or("include list")
        );
        binary.into_owned()
    };

    std::fs::write(&output, bytes).with_context(|| format!("writing {:?}", output))?;
    info!("Wrote {:?}", output);
    Ok(0)
}
