use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::Stage;
use crate::pipeline::{Input, Minified, MinimizedResult, Problem};

/// Id of the stage piping assets through an external program.
pub const COMMAND: &str = "command";

#[derive(Debug, Error)]
enum CommandError {
    #[error("Couldn't parse command options.\n{0}")]
    Options(#[from] serde_json::Error),

    #[error("Couldn't run `{0}`.\n{1}")]
    Spawn(String, std::io::Error),

    #[error("`{program}` exited with {status}:\n{stderr}")]
    Status {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum OutputFormat {
    /// Stdout is the minified code.
    #[default]
    Text,
    /// Stdout is a JSON result object.
    Json,
}

#[derive(Debug, Deserialize)]
struct CommandOptions {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    output: OutputFormat,
}

pub(super) fn stage() -> Stage {
    Stage::new(COMMAND, run)
}

/// Writes the code to the program's stdin and reads the result from its
/// stdout. Each non-empty stderr line becomes a warning.
fn run(input: Input<'_>, options: &Value) -> anyhow::Result<Minified> {
    let options = CommandOptions::deserialize(options).map_err(CommandError::Options)?;

    let mut child = Command::new(&options.program)
        .args(&options.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CommandError::Spawn(options.program.clone(), e))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or(anyhow::anyhow!("stdin not piped"))?;

    // Feeding stdin from the same thread would deadlock on large inputs once
    // the child fills its stdout pipe.
    let (written, output) = thread::scope(|s| {
        let writer = s.spawn(move || -> std::io::Result<()> {
            stdin.write_all(input.code.as_bytes())?;
            stdin.flush()
        });

        let output = child.wait_with_output();
        (writer.join(), output)
    });

    let output = output?;
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        Err(CommandError::Status {
            program: options.program.clone(),
            status: output.status,
            stderr: stderr.trim().to_owned(),
        })?
    }

    match written {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("stdin writer for `{}` panicked", options.program),
    }

    let warnings = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| Problem::new(line).plugin(&options.program));

    match options.output {
        OutputFormat::Text => {
            let mut result = MinimizedResult::new(String::from_utf8(output.stdout)?);
            result.warnings.extend(warnings);
            Ok(result.into())
        }
        OutputFormat::Json => {
            let value: Value = serde_json::from_slice(&output.stdout)?;
            // Malformed shapes are passed through, the pipeline reports them.
            match MinimizedResult::from_json(value) {
                Ok(mut result) => {
                    result.warnings.extend(warnings);
                    Ok(result.into())
                }
                Err(value) => Ok(Minified::Json(value)),
            }
        }
    }
}
