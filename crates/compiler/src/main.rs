//! Buzz compiler CLI
//!
//! Command-line interface for compiling .bzz scripts to textual assembly
//! and bytecode, and for inspecting compiled bytecode.
//!
//! Exit codes: 0 on success, 1 on I/O errors, 2 on compilation errors.
//! Compilation errors are printed as `file:line:col: message` so editors
//! can jump to the site.

use std::io;
use std::path::{Path, PathBuf};
use std::process;

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{generate, Shell};

use bzzc::{assemble, disassemble, CompilerConfig, Lexer, Parser};

const EXIT_IO: i32 = 1;
const EXIT_COMPILE: i32 = 2;

#[derive(ClapParser)]
#[command(name = "bzzc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Buzz compiler - compile .bzz scripts to bytecode", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a .bzz script to textual assembly
    Parse {
        /// Input .bzz source file
        input: PathBuf,

        /// Output .basm assembly file
        output: PathBuf,

        /// Pre-populated string table (one string per line, id = line)
        strings: Option<PathBuf>,

        /// Warn on assignments that silently create globals
        #[arg(long)]
        strict: bool,

        /// Path to compiler configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Assemble a .basm file into bytecode
    Asm {
        /// Input .basm assembly file
        input: PathBuf,

        /// Output bytecode file
        output: PathBuf,

        /// Also write a debug-symbol file alongside the bytecode
        #[arg(long, value_name = "PATH")]
        debug: Option<PathBuf>,
    },

    /// Disassemble a bytecode file back to textual assembly
    Dasm {
        /// Input bytecode file
        input: PathBuf,

        /// Output .basm assembly file
        output: PathBuf,
    },

    /// Compile a .bzz script all the way to bytecode
    Build {
        /// Input .bzz source file
        input: PathBuf,

        /// Output bytecode path (defaults to input with .bo extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Keep the intermediate assembly file (.basm)
        #[arg(long)]
        keep_asm: bool,

        /// Write a debug-symbol file (.bdb) next to the bytecode
        #[arg(long)]
        debug: bool,

        /// Warn on assignments that silently create globals
        #[arg(long)]
        strict: bool,

        /// Path to compiler configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Parse {
            input,
            output,
            strings,
            strict,
            config,
        } => run_parse(&input, &output, strings.as_deref(), strict, config.as_deref()),
        Commands::Asm {
            input,
            output,
            debug,
        } => run_asm(&input, &output, debug.as_deref()),
        Commands::Dasm { input, output } => run_dasm(&input, &output),
        Commands::Build {
            input,
            output,
            keep_asm,
            debug,
            strict,
            config,
        } => {
            let output = output.unwrap_or_else(|| input.with_extension("bo"));
            run_build(&input, &output, keep_asm, debug, strict, config.as_deref());
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
        }
    }
}

fn load_config(path: Option<&Path>, strict: bool) -> CompilerConfig {
    let mut cfg = match path {
        Some(p) => match CompilerConfig::from_toml_file(p) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{}", e);
                process::exit(EXIT_IO);
            }
        },
        None => CompilerConfig::default(),
    };
    cfg.strict |= strict;
    cfg
}

fn parse_to_asm(input: &Path, strings: Option<&Path>, cfg: &CompilerConfig) -> String {
    let preload: Vec<String> = match strings {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(text) => text.lines().map(|l| l.to_string()).collect(),
            Err(e) => {
                eprintln!("{}: {}", p.display(), e);
                process::exit(EXIT_IO);
            }
        },
        None => Vec::new(),
    };
    let lex = match Lexer::new(&input.to_string_lossy()) {
        Ok(lex) => lex,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(EXIT_IO);
        }
    };
    let mut parser = Parser::new(lex, cfg);
    parser.preload_strings(&preload);
    match parser.parse() {
        Ok(basm) => basm,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(EXIT_COMPILE);
        }
    }
}

fn write_or_die(path: &Path, content: &[u8]) {
    if let Err(e) = std::fs::write(path, content) {
        eprintln!("{}: {}", path.display(), e);
        process::exit(EXIT_IO);
    }
}

fn run_parse(
    input: &Path,
    output: &Path,
    strings: Option<&Path>,
    strict: bool,
    config: Option<&Path>,
) {
    let cfg = load_config(config, strict);
    let basm = parse_to_asm(input, strings, &cfg);
    write_or_die(output, basm.as_bytes());
}

fn run_asm(input: &Path, output: &Path, debug: Option<&Path>) {
    let basm = match std::fs::read_to_string(input) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("{}: {}", input.display(), e);
            process::exit(EXIT_IO);
        }
    };
    match assemble(&basm, &input.to_string_lossy()) {
        Ok(out) => {
            write_or_die(output, &out.bcode);
            if let Some(dbg_path) = debug {
                if let Err(e) = out.debug.save(dbg_path) {
                    eprintln!("{}: {}", dbg_path.display(), e);
                    process::exit(EXIT_IO);
                }
            }
        }
        Err(e) => {
            eprintln!("{}: {}", input.display(), e);
            process::exit(EXIT_COMPILE);
        }
    }
}

fn run_dasm(input: &Path, output: &Path) {
    let bcode = match std::fs::read(input) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("{}: {}", input.display(), e);
            process::exit(EXIT_IO);
        }
    };
    match disassemble(&bcode) {
        Ok(basm) => write_or_die(output, basm.as_bytes()),
        Err(e) => {
            eprintln!("{}: {}", input.display(), e);
            process::exit(EXIT_COMPILE);
        }
    }
}

fn run_build(
    input: &Path,
    output: &Path,
    keep_asm: bool,
    debug: bool,
    strict: bool,
    config: Option<&Path>,
) {
    let cfg = load_config(config, strict);
    let basm = parse_to_asm(input, None, &cfg);
    if keep_asm {
        write_or_die(&input.with_extension("basm"), basm.as_bytes());
    }
    match assemble(&basm, &input.to_string_lossy()) {
        Ok(out) => {
            write_or_die(output, &out.bcode);
            if debug {
                let dbg_path = output.with_extension("bdb");
                if let Err(e) = out.debug.save(&dbg_path) {
                    eprintln!("{}: {}", dbg_path.display(), e);
                    process::exit(EXIT_IO);
                }
            }
        }
        Err(e) => {
            eprintln!("{}: {}", input.display(), e);
            process::exit(EXIT_COMPILE);
        }
    }
}
