//! Raster value filtering
//!
//! The archive's rasters are filtered once per staged file before they enter
//! the final store. [`CommandTransform`] delegates to an external program
//! (e.g. a GDAL calculator that nulls out sub-threshold cells); [`Passthrough`]
//! leaves the payload untouched.

use crate::error::TransformError;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// Placeholder replaced by the staged input path
pub const INPUT_PLACEHOLDER: &str = "{input}";

/// Placeholder replaced by the output path
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Transform applied to each staged raster
pub trait RasterTransform: Send + Sync {
    /// Filter `input`, returning the path of the result (which may be `input`).
    ///
    /// On error no output may be left behind; only `input` is owned by the
    /// caller's staging guard.
    fn filter(&self, input: &Path) -> Result<PathBuf, TransformError>;
}

impl<T: RasterTransform + ?Sized> RasterTransform for &T {
    fn filter(&self, input: &Path) -> Result<PathBuf, TransformError> {
        (**self).filter(input)
    }
}

impl<T: RasterTransform + ?Sized> RasterTransform for Box<T> {
    fn filter(&self, input: &Path) -> Result<PathBuf, TransformError> {
        (**self).filter(input)
    }
}

/// No-op transform
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl RasterTransform for Passthrough {
    fn filter(&self, input: &Path) -> Result<PathBuf, TransformError> {
        Ok(input.to_path_buf())
    }
}

/// Runs an external program per file
///
/// Arguments may reference `{input}` and `{output}`. The output is written
/// next to the input with a `.filtered` marker before the extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTransform {
    program: String,
    args: Vec<String>,
}

impl CommandTransform {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a command line on whitespace; the first word is the program
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut words = command_line.split_whitespace().map(str::to_string);
        let program = words.next()?;
        Some(Self::new(program, words.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Output path used for `input`
    pub fn output_for(input: &Path) -> PathBuf {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let filtered = match name.rfind('.') {
            Some(idx) if idx > 0 => format!("{}.filtered{}", &name[..idx], &name[idx..]),
            _ => format!("{}.filtered", name),
        };
        input.with_file_name(filtered)
    }

    fn render_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(INPUT_PLACEHOLDER, &input)
                    .replace(OUTPUT_PLACEHOLDER, &output)
            })
            .collect()
    }
}

impl RasterTransform for CommandTransform {
    fn filter(&self, input: &Path) -> Result<PathBuf, TransformError> {
        let output = Self::output_for(input);
        let args = self.render_args(input, &output);
        debug!("Running {} {:?}", self.program, args);

        let result = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|e| TransformError::Launch {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        if !result.status.success() {
            discard(&output);
            return Err(TransformError::Failed {
                input: input.to_path_buf(),
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        if !output.exists() {
            return Err(TransformError::MissingOutput { path: output });
        }
        Ok(output)
    }
}

/// Remove a partial output left by a failed run
fn discard(output: &Path) {
    match fs::remove_file(output) {
        Ok(()) => debug!("Removed partial output {}", output.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial output {}: {}", output.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_passthrough() {
        let path = Path::new("/staging/a.30min.tif");
        assert_eq!(Passthrough.filter(path).unwrap(), path);
    }

    #[test]
    fn test_output_path() {
        assert_eq!(
            CommandTransform::output_for(Path::new("/staging/a.30min.tif")),
            PathBuf::from("/staging/a.30min.filtered.tif")
        );
    }

    #[test]
    fn test_parse_and_render() {
        let transform =
            CommandTransform::parse("gdal_calc.py -A {input} --outfile={output}").unwrap();
        assert_eq!(transform.program(), "gdal_calc.py");
        let args = transform.render_args(Path::new("/s/a.tif"), Path::new("/s/a.filtered.tif"));
        assert_eq!(args, vec!["-A", "/s/a.tif", "--outfile=/s/a.filtered.tif"]);
        assert!(CommandTransform::parse("   ").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_success() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("a.tif");
        fs::write(&input, b"raster").unwrap();

        let transform = CommandTransform::new("cp", vec!["{input}".into(), "{output}".into()]);
        let output = transform.filter(&input).unwrap();
        assert_eq!(fs::read(&output).unwrap(), b"raster");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_failure() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("a.tif");
        fs::write(&input, b"raster").unwrap();

        let failing = CommandTransform::new("false", vec![]);
        assert!(matches!(
            failing.filter(&input),
            Err(TransformError::Failed { .. })
        ));

        // Succeeds without writing the output
        let silent = CommandTransform::new("true", vec![]);
        assert!(matches!(
            silent.filter(&input),
            Err(TransformError::MissingOutput { .. })
        ));

        let missing = CommandTransform::new("/nonexistent/filter-program", vec![]);
        assert!(matches!(
            missing.filter(&input),
            Err(TransformError::Launch { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_command_removes_partial_output() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("a.30min.tif");
        fs::write(&input, b"raster").unwrap();

        let transform = CommandTransform::new(
            "sh",
            vec![
                "-c".into(),
                "cp \"$0\" \"$1\"; exit 1".into(),
                "{input}".into(),
                "{output}".into(),
            ],
        );
        assert!(matches!(
            transform.filter(&input),
            Err(TransformError::Failed { .. })
        ));
        assert!(!CommandTransform::output_for(&input).exists());
        assert!(input.exists());
    }
}
