//! The conversion subprocess seam.
//!
//! The encoder is an external tool. This module only knows how to start it
//! with an input and a temporary output path, poll it, kill it, and move a
//! finished output into place.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::debug;
use tokio::process::{Child, Command};

/// Infix marking an in-progress output file
pub const TEMP_INFIX: &str = ".tmp.av1.";

/// How a finished conversion ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    Failed { code: Option<i32>, reason: String },
}

/// A running conversion
pub trait ConversionProcess {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check
    fn try_wait(&mut self) -> std::io::Result<Option<ExitOutcome>>;

    /// Ask the process to die; does not wait
    fn kill(&mut self) -> std::io::Result<()>;
}

/// Starts conversions
pub trait Converter {
    fn spawn(&self, input: &Path, output: &Path) -> std::io::Result<Box<dyn ConversionProcess>>;
}

/// Temp output path for a source: `<file name>.tmp.av1.<ext>` beside it.
///
/// The whole file name is kept so `film.mp4` and `film.avi` never share a temp.
pub fn temp_output_path(source: &Path, output_extension: &str) -> PathBuf {
    let name = source
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    source.with_file_name(format!("{}{}{}", name, TEMP_INFIX, output_extension))
}

/// Source a temp output belongs to, the inverse of [`temp_output_path`]
pub fn source_for_temp(temp: &Path) -> Option<PathBuf> {
    let name = temp.file_name()?.to_str()?;
    let (source, _) = name.split_once(TEMP_INFIX)?;
    if source.is_empty() {
        return None;
    }
    Some(temp.with_file_name(source))
}

/// Final location of the converted file
pub fn final_output_path(source: &Path, output_extension: &str) -> PathBuf {
    source.with_extension(output_extension)
}

pub fn is_temp_output(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.contains(TEMP_INFIX))
}

/// Rename a finished temp output over its final path.
///
/// The rename is atomic on one filesystem, so consumers see either the old
/// file or the complete new one. When the container changes, the source is
/// removed afterwards, and an unrelated file already at the final path is
/// never replaced: the call fails with `AlreadyExists` and leaves the temp.
pub fn finalize_output(source: &Path, temp: &Path, output_extension: &str) -> std::io::Result<PathBuf> {
    let final_path = final_output_path(source, output_extension);
    if final_path == source {
        fs::rename(temp, &final_path)?;
        return Ok(final_path);
    }

    // hard_link refuses to clobber; fall back to check-then-rename where links are unsupported
    match fs::hard_link(temp, &final_path) {
        Ok(()) => fs::remove_file(temp)?,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Err(e),
        Err(_) => {
            if final_path.exists() {
                return Err(std::io::Error::new(
                    ErrorKind::AlreadyExists,
                    format!("{} already exists", final_path.display()),
                ));
            }
            fs::rename(temp, &final_path)?;
        }
    }
    match fs::remove_file(source) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    Ok(final_path)
}

/// [`Converter`] running an argv template with `{input}` / `{output}` placeholders
#[derive(Debug, Clone)]
pub struct CommandConverter {
    argv: Vec<String>,
    log_dir: Option<PathBuf>,
}

impl CommandConverter {
    pub fn new(argv: Vec<String>, log_dir: Option<PathBuf>) -> Self {
        Self { argv, log_dir }
    }

    /// Substitute the placeholders for one job
    pub fn render(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.argv
            .iter()
            .map(|a| a.replace("{input}", &input).replace("{output}", &output))
            .collect()
    }
}

impl Converter for CommandConverter {
    fn spawn(&self, input: &Path, output: &Path) -> std::io::Result<Box<dyn ConversionProcess>> {
        let argv = self.render(input, output);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "empty encoder command"))?;

        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).stdout(Stdio::null());

        let log_path = match &self.log_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                let path = dir.join(format!("{}.log", uuid::Uuid::new_v4()));
                cmd.stderr(fs::File::create(&path)?);
                Some(path)
            }
            None => {
                cmd.stderr(Stdio::null());
                None
            }
        };

        debug!("spawn: {:?}", argv);
        let child = cmd.spawn()?;
        Ok(Box::new(CommandProcess { child, log_path }))
    }
}

struct CommandProcess {
    child: Child,
    log_path: Option<PathBuf>,
}

impl CommandProcess {
    fn log_tail(&self, lines: usize) -> String {
        let Some(path) = &self.log_path else {
            return String::new();
        };
        let content = fs::read_to_string(path).unwrap_or_default();
        let all: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        all[all.len().saturating_sub(lines)..].join(" | ")
    }
}

impl ConversionProcess for CommandProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitOutcome>> {
        let Some(status) = self.child.try_wait()? else {
            return Ok(None);
        };
        let outcome = if status.success() {
            ExitOutcome::Success
        } else {
            let tail = self.log_tail(3);
            let mut reason = format!("encoder exited with {}", status);
            if !tail.is_empty() {
                reason.push_str(": ");
                reason.push_str(&tail);
            }
            ExitOutcome::Failed {
                code: status.code(),
                reason,
            }
        };
        if let Some(path) = &self.log_path {
            if outcome == ExitOutcome::Success {
                let _ = fs::remove_file(path);
            }
        }
        Ok(Some(outcome))
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }
}
