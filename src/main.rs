//! Command-line front end for the YQL compiler.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use yql::parser::{self, Document};
use yql::validate::validate;
use yql::{AccessPolicy, CompileError, FsResolver, Options, Outcome, Style};

#[derive(Parser, Debug)]
#[command(name = "yql", about = "Compile YQL documents to SQL", version)]
struct Cli {
    /// More logging on stderr (-v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a document to SQL
    Generate {
        /// YQL file, or - for standard input
        file: PathBuf,

        /// Target dialect: postgres, mysql, sqlite, sqlserver or oracle
        #[arg(short, long, default_value = "postgres")]
        dialect: String,

        /// Write the result here instead of standard output
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Put each clause on its own line
        #[arg(long)]
        pretty: bool,

        /// Fail on schema validation problems
        #[arg(long)]
        strict: bool,

        /// Table access policy (YAML)
        #[arg(long, value_name = "FILE")]
        policy: Option<PathBuf>,

        /// Print the structured outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Parse a document and print its IR
    Parse {
        /// YQL file, or - for standard input
        file: PathBuf,
    },
    /// Check a document against its embedded schema
    Validate {
        /// YQL file, or - for standard input
        file: PathBuf,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("cannot read {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("cannot write {path}: {source}")]
    Write { path: String, source: io::Error },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Compile(#[from] CompileError),
}

fn setup_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "warn",
            1 => "yql=debug",
            _ => "yql=trace",
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn is_stdin(file: &Path) -> bool {
    file.as_os_str() == "-"
}

fn read_input(file: &Path) -> Result<String, CliError> {
    let result = if is_stdin(file) {
        let mut text = String::new();
        io::stdin().read_to_string(&mut text).map(|_| text)
    } else {
        fs::read_to_string(file)
    };
    result.map_err(|source| CliError::Read {
        path: file.display().to_string(),
        source,
    })
}

fn write_output(output: Option<&Path>, text: &str) -> Result<(), CliError> {
    match output {
        Some(path) => fs::write(path, format!("{}\n", text)).map_err(|source| CliError::Write {
            path: path.display().to_string(),
            source,
        }),
        None => {
            println!("{}", text);
            Ok(())
        }
    }
}

/// Imports resolve relative to the document's directory.
fn resolver_for(file: &Path) -> FsResolver {
    match file.parent() {
        Some(dir) if !is_stdin(file) => FsResolver::new(dir),
        _ => FsResolver::new("."),
    }
}

fn load(file: &Path) -> Result<Document, CliError> {
    let text = read_input(file)?;
    let doc = parser::parse_with(&text, &resolver_for(file)).map_err(CompileError::from)?;
    Ok(doc)
}

fn run(command: Command) -> Result<ExitCode, CliError> {
    match command {
        Command::Generate {
            file,
            dialect,
            output,
            pretty,
            strict,
            policy,
            json,
        } => {
            let text = read_input(&file)?;
            let policy = match policy {
                Some(path) => Some(AccessPolicy::from_file(path).map_err(CompileError::from)?),
                None => None,
            };
            let options = Options {
                style: Style { pretty },
                strict,
                policy,
            };
            let result = yql::try_compile_with(&text, &dialect, &options, &resolver_for(&file));

            if json {
                let code = if result.is_ok() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                };
                let outcome = Outcome::from(result);
                write_output(output.as_deref(), &serde_json::to_string_pretty(&outcome)?)?;
                return Ok(code);
            }

            let compilation = result?;
            for warning in &compilation.warnings {
                eprintln!("warning: {}", warning);
            }
            let params = &compilation.compiled.params;
            if !params.is_empty() {
                eprintln!("-- parameters: {}", params.bindings.join(", "));
            }
            write_output(output.as_deref(), &compilation.compiled.sql)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Parse { file } => {
            let doc = load(&file)?;
            debug!(kind = doc.query.kind(), "parsed");
            println!("-- {} on {}", doc.query.kind(), doc.query.tables().join(", "));
            println!("{:#?}", doc.query);
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate { file } => {
            let doc = load(&file)?;
            let schema = match &doc.schema {
                Some(schema) => schema,
                None => {
                    eprintln!("warning: document has no schema");
                    return Ok(ExitCode::SUCCESS);
                }
            };
            let problems = validate(&doc.query, schema);
            if problems.is_empty() {
                println!("ok");
                return Ok(ExitCode::SUCCESS);
            }
            for problem in &problems {
                println!("{}", problem);
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);
    match run(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
