use console::style;
use log::{debug, info};
use procwarden::config::RunConfig;
use procwarden::errors::{ProcessError, Result};
use procwarden::interrupt::InterruptContext;
use procwarden::storage::{create_temp_dir, delete_path_counting, TempDirOptions};
use procwarden::utils::show_bytes;
use procwarden::ProgramRunner;
use std::io::{self, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};

use crate::cli::RunArgs;

/// Build the run description from flags or a `--file` description
pub fn load_config(args: RunArgs) -> Result<(RunConfig, bool)> {
    if let Some(file) = &args.file {
        debug!("Loading run description from {}", file.display());
        return Ok((RunConfig::from_file(file)?, args.json));
    }

    let program = args
        .program
        .ok_or_else(|| ProcessError::InvalidConfig("no program specified".to_string()))?;
    let mut config = RunConfig::new(program);
    config.args = args.args;
    config.search_path = args.search_path;
    config.cwd = args.cwd;
    config.clear_env = args.clear_env;
    config.uid = args.uid;
    config.gid = args.gid;
    config.input = args.input;
    config.merge_stderr = args.merge_stderr;
    config.max_output = args.max_output;

    for pair in args.env {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            ProcessError::InvalidConfig(format!("expected K=V, got '{}'", pair))
        })?;
        config.env.insert(key.to_string(), value.to_string());
    }

    // In JSON mode both streams end up in the report.
    if args.json && !config.merge_stderr {
        config.capture_stderr = true;
    }

    config.validate()?;
    Ok((config, args.json))
}

/// Writer that refuses to go past a byte limit
struct LimitedWriter<W> {
    inner: W,
    remaining: Option<u64>,
}

impl<W: Write> Write for LimitedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(remaining) = self.remaining.as_mut() {
            if buf.len() as u64 > *remaining {
                return Err(io::Error::other(
                    "program output exceeds the configured limit",
                ));
            }
        }
        let written = self.inner.write(buf)?;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= written as u64;
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Run the described program; returns the exit code for this process
pub fn run_program(config: &RunConfig, json: bool, interrupts: &InterruptContext) -> Result<i32> {
    let options = config.to_run_options()?;
    let limit = config.output_limit()?;
    let runner = ProgramRunner::new(interrupts.clone());

    info!("Executing: {} {:?}", options.program, options.args);

    if json {
        let mut sink = LimitedWriter {
            inner: Vec::new(),
            remaining: limit,
        };
        let unchecked = options.clone().check_status(false);
        let (status, stderr) = runner.run_with_sink(&unchecked, None, &mut sink)?;
        let report = serde_json::json!({
            "program": options.program,
            "code": status.code(),
            "signal": status.signal(),
            "stdout": String::from_utf8_lossy(&sink.inner),
            "stderr": stderr.map(|e| String::from_utf8_lossy(&e).into_owned()),
        });
        println!("{}", report);
        return Ok(status
            .code()
            .or_else(|| status.signal().map(|s| 128 + s))
            .unwrap_or(1));
    }

    let stdout = io::stdout();
    let mut sink = LimitedWriter {
        inner: stdout.lock(),
        remaining: limit,
    };
    match runner.run_streaming(&options, None, &mut sink) {
        Ok(_) => Ok(0),
        // Without status checking the child's code is passed through quietly.
        Err(e @ ProcessError::Exec { .. }) if !config.check_status => Ok(e.exit_code()),
        Err(e) => Err(e),
    }
}

pub fn make_temp_dir(root: Option<PathBuf>, prefix: String) -> Result<()> {
    let options = TempDirOptions {
        root,
        prefix,
        ..Default::default()
    };
    let path = create_temp_dir(&options)?;
    println!("{}", path.display());
    Ok(())
}

pub fn remove_path(path: &Path) -> Result<()> {
    let stats = delete_path_counting(path)?;
    println!(
        "{} {} ({})",
        style("Removed").green().bold(),
        path.display(),
        show_bytes(stats.bytes_freed)
    );
    Ok(())
}
