//! Quicksilver JIT CLI
//!
//! Runs bytecode programs through the tiered engine and dumps what the
//! compiler makes of a function.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use quicksilver_jit::bytecode::Program;
use quicksilver_jit::{Engine, ExecutionMode, JitConfig, Value, VERSION};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quicksilver-jit")]
#[command(author, version, about = "Tiered JIT for Quicksilver bytecode", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JIT configuration file (JSON)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a program's entry function repeatedly and report tiering
    Run {
        /// Program file (JSON)
        program: PathBuf,
        /// Number of calls
        #[arg(short = 'n', long, default_value_t = 1000)]
        iterations: u32,
        /// Integer arguments passed on every call
        #[arg(short, long, value_delimiter = ',')]
        args: Vec<i32>,
        /// Print engine statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compile one function and print IR, LIR and machine code
    Disasm {
        /// Program file (JSON)
        program: PathBuf,
        /// Function name (defaults to the entry function)
        #[arg(short, long)]
        function: Option<String>,
        /// Tier to compile at
        #[arg(short, long, value_enum, default_value_t = Tier::Full)]
        tier: Tier,
        /// Calls to make first so the profile has data
        #[arg(long, default_value_t = 0)]
        warmup: u32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Tier {
    Simple,
    Full,
}

impl From<Tier> for ExecutionMode {
    fn from(t: Tier) -> Self {
        match t {
            Tier::Simple => ExecutionMode::SimpleJit,
            Tier::Full => ExecutionMode::FullJit,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => JitConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => JitConfig::default(),
    };

    match cli.command {
        Commands::Run {
            program,
            iterations,
            args,
            json,
        } => run(config, &program, iterations, &args, json),
        Commands::Disasm {
            program,
            function,
            tier,
            warmup,
        } => disasm(config, &program, function.as_deref(), tier.into(), warmup),
    }
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
        .init();
}

fn load(config: JitConfig, path: &Path) -> anyhow::Result<(Engine, Program, quicksilver_jit::FunctionId)> {
    let program = Program::load(path).with_context(|| format!("loading {}", path.display()))?;
    let mut engine = Engine::new(config)?;
    let entry = engine.load_program(&program)?;
    Ok((engine, program, entry))
}

fn run(config: JitConfig, path: &Path, iterations: u32, args: &[i32], json: bool) -> anyhow::Result<()> {
    let (mut engine, _, entry) = load(config, path)?;
    let args: Vec<Value> = args.iter().map(|a| Value::Int(*a)).collect();

    let start = Instant::now();
    let mut last = Value::Undefined;
    for _ in 0..iterations {
        last = engine.call(entry, &args)?;
    }
    engine.wait_for_background(Duration::from_secs(5));
    let elapsed = start.elapsed();

    if json {
        println!("{}", serde_json::to_string_pretty(&engine.stats())?);
        return Ok(());
    }

    println!("Quicksilver JIT {}", VERSION);
    println!("result: {}", last);
    println!("{} calls in {:.2?}", iterations, elapsed);
    println!();
    println!("tier transitions:");
    for t in engine.tier_transitions() {
        let name = engine.function_name(t.function).unwrap_or("?");
        println!("  {:<20} {} -> {} at call {}", name, t.from, t.to, t.at_call);
    }
    let stats = engine.stats();
    println!();
    println!("compiled:   {}", stats.jit.compiled);
    println!("failed:     {}", stats.jit.failed);
    println!("bailouts:   {}", stats.jit.bailouts);
    println!("code bytes: {} live, {} peak", stats.live_code_bytes, stats.peak_code_bytes);
    Ok(())
}

fn disasm(
    config: JitConfig,
    path: &Path,
    function: Option<&str>,
    mode: ExecutionMode,
    warmup: u32,
) -> anyhow::Result<()> {
    let config = JitConfig {
        background: false,
        ..config
    };
    let (mut engine, program, entry) = load(config, path)?;
    let target = match function {
        Some(name) => match engine.function_named(name) {
            Some(f) => f,
            None => bail!("no function named {}", name),
        },
        None => entry,
    };
    for _ in 0..warmup {
        engine.call(entry, &[])?;
    }

    // Only one program is loaded, so global ids equal local ids
    if let Some(body) = program.functions.get(target.0 as usize) {
        println!("== bytecode ==");
        println!("{}", body.disassemble());
    }

    let (encoded, listing) = engine.compile_listing(target, mode)?;
    println!("== IR ==");
    println!("{}", listing.ir);
    println!("== optimized IR ==");
    for (pass, result) in &listing.passes {
        println!(
            "; {}: {} modified, {} removed, {} added",
            pass, result.instructions_modified, result.instructions_removed, result.instructions_added
        );
    }
    println!("{}", listing.optimized_ir);
    println!("== LIR ==");
    println!("{}", listing.lir);
    println!("== code ({} bytes) ==", encoded.code.len());
    for (i, chunk) in encoded.code.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{:06x}  {}", i * 16, hex.join(" "));
    }
    Ok(())
}
