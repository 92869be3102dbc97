use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "procwarden")]
#[command(version, about = "Run and supervise external programs", long_about = None)]
#[command(after_help = "EXAMPLES:
    # Run a program found on PATH, feeding it input
    procwarden run --search-path --input 'hello' cat

    # Run from a JSON description
    procwarden run --file job.json

    # Report the result as JSON
    procwarden run --json --search-path -- sh -c 'exit 3'

    # Temporary directories and cleanup
    procwarden tempdir --prefix build
    procwarden rm /tmp/build-1234-0
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a program
    Run(RunArgs),

    /// Create a uniquely named temporary directory and print its path
    Tempdir {
        /// Parent directory ($TMPDIR or /tmp by default)
        #[arg(long, value_name = "DIR")]
        root: Option<PathBuf>,

        /// Leading name component
        #[arg(long, default_value = "procwarden")]
        prefix: String,
    },

    /// Recursively delete a path and report the space freed
    Rm {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

#[derive(clap::Args)]
pub struct RunArgs {
    /// JSON run description; replaces the other run options
    #[arg(long, value_name = "FILE", conflicts_with = "program")]
    pub file: Option<PathBuf>,

    /// Look PROGRAM up in PATH
    #[arg(long)]
    pub search_path: bool,

    /// Working directory of the program
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Set an environment variable (repeatable)
    #[arg(long = "env", value_name = "K=V")]
    pub env: Vec<String>,

    /// Start from an empty environment
    #[arg(long)]
    pub clear_env: bool,

    /// Run as this user id
    #[arg(long, value_name = "UID")]
    pub uid: Option<u32>,

    /// Run with this group id
    #[arg(long, value_name = "GID")]
    pub gid: Option<u32>,

    /// Text written to the program's stdin
    #[arg(long, value_name = "TEXT")]
    pub input: Option<String>,

    /// Send stderr to stdout
    #[arg(long)]
    pub merge_stderr: bool,

    /// Stop the program once it has written this much (e.g. 10M)
    #[arg(long, value_name = "SIZE")]
    pub max_output: Option<String>,

    /// Print the result as JSON instead of streaming output
    #[arg(long)]
    pub json: bool,

    /// Program to run
    #[arg(value_name = "PROGRAM", required_unless_present = "file")]
    pub program: Option<String>,

    /// Program arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}
