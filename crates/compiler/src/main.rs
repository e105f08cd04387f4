//! Poke driver
//!
//! A thin, non-interactive front end over the compiler entry
//! points: run a file, check a file without executing the result of
//! the last statement, or evaluate a single expression.

use clap::{Parser as ClapParser, Subcommand};
use std::path::PathBuf;
use std::process;

use poke_runtime::Vm;
use pokec::Compiler;

#[derive(ClapParser)]
#[command(name = "poke")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Poke - edit binary data with programs", long_about = None)]
struct Cli {
    /// Directory to load pkl-rt.pk and std.pk from instead of the
    /// embedded copies
    #[arg(long, value_name = "DIR")]
    rt_path: Option<PathBuf>,

    /// Do not print compiler diagnostics
    #[arg(short, long)]
    quiet: bool,

    /// Treat warnings as errors
    #[arg(long)]
    error_on_warning: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and execute a .pk file
    Run {
        /// Input .pk source file
        input: PathBuf,
    },

    /// Compile a .pk file without running it
    Check {
        /// Input .pk source file
        input: PathBuf,
    },

    /// Evaluate an expression and print its value
    Expr {
        /// The expression to evaluate
        expression: String,
    },
}

fn make_compiler(cli: &Cli) -> Compiler {
    let vm = Vm::new();
    let mut compiler = match Compiler::new(vm, cli.rt_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("poke: {}", e);
            process::exit(1);
        }
    };
    compiler.set_quiet(cli.quiet);
    compiler.set_error_on_warning(cli.error_on_warning);
    compiler
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut compiler = make_compiler(&cli);

    let result = match &cli.command {
        Commands::Run { input } => compiler.compile_file(input),
        Commands::Check { input } => {
            let src = match std::fs::read_to_string(input) {
                Ok(src) => src,
                Err(e) => {
                    eprintln!("poke: {}: {}", input.display(), e);
                    process::exit(1);
                }
            };
            // Checking still executes declarations: an incremental
            // compiler cannot type later input without them.
            compiler.compile_buffer(&src)
        }
        Commands::Expr { expression } => match compiler.compile_statement(
            &format!("{};", expression.trim_end_matches(';')),
        ) {
            Ok(Some(val)) => {
                let text = compiler.vm().format_val(
                    val,
                    compiler.vm().odepth(),
                    compiler.vm().omode(),
                    compiler.vm().obase(),
                    0,
                );
                println!("{}", text);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        },
    };

    compiler.vm_mut().shutdown();

    if let Err(e) = result {
        eprintln!("poke: {}", e);
        process::exit(1);
    }
}
