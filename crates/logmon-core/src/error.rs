//! Error types for logmon-core

use std::fmt::Write;
use std::path::PathBuf;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for logmon-core
#[derive(Error, Debug)]
pub enum Error {
    /// File watching errors
    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    /// Pattern compilation/validation errors
    #[error("Pattern error: {0}")]
    Pattern(#[from] PatternError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Watch(err) => Some(err.remediation()),
            Self::Pattern(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Show rules", "logmon rules")
                    .alternative("Verify every rule path points at a readable file."),
            ),
        }
    }
}

/// Why a file could not be opened for tailing
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAccessReason {
    NotFound,
    PermissionDenied,
    InvalidPath,
    Other,
}

impl FileAccessReason {
    /// Classify an I/O error from an open/stat call.
    #[must_use]
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            std::io::ErrorKind::InvalidInput => Self::InvalidPath,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for FileAccessReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::InvalidPath => write!(f, "invalid path"),
            Self::Other => write!(f, "unavailable"),
        }
    }
}

/// File watcher errors. None of these are fatal to the monitor.
#[derive(Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatchError {
    /// The file could not be opened; the watcher waits for a reload
    #[error("cannot open {}: {reason} ({message})", path.display())]
    FileAccess {
        path: PathBuf,
        reason: FileAccessReason,
        message: String,
    },

    /// A read failed mid-stream; the watcher keeps listening
    #[error("read failed for {}: {message}", path.display())]
    Read { path: PathBuf, message: String },

    /// Change notifications could not be registered
    #[error("cannot watch {} for changes: {message}", path.display())]
    Notify { path: PathBuf, message: String },
}

impl WatchError {
    /// Build a file-access error from an I/O failure.
    #[must_use]
    pub fn file_access(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::FileAccess {
            path: path.into(),
            reason: FileAccessReason::from_io(err),
            message: err.to_string(),
        }
    }

    /// Build a read error from an I/O failure.
    #[must_use]
    pub fn read(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Read {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Path the error refers to
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        match self {
            Self::FileAccess { path, .. } | Self::Read { path, .. } | Self::Notify { path, .. } => {
                path
            }
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileAccess {
                path,
                reason: FileAccessReason::NotFound,
                ..
            } => Remediation::new(format!(
                "Log file {} does not exist yet. It is picked up on the next reload.",
                path.display()
            ))
            .command("Check path", format!("ls -l \"{}\"", path.display()))
            .alternative("Fix the rule path, or create the file and reload rules."),
            Self::FileAccess {
                path,
                reason: FileAccessReason::PermissionDenied,
                ..
            } => Remediation::new(format!(
                "No read permission for {}. Grant access and reload.",
                path.display()
            ))
            .command("Check permissions", format!("ls -l \"{}\"", path.display()))
            .alternative("Run logmon as a user in the log file's group."),
            Self::FileAccess { path, .. } => {
                Remediation::new(format!("Cannot open {}.", path.display()))
                    .command("Check path", format!("ls -l \"{}\"", path.display()))
                    .alternative("Verify the rule path is a regular file.")
            }
            Self::Read { path, .. } => Remediation::new(
                "Transient read failure. The watcher retries on the next change.",
            )
            .command("Check file", format!("ls -l \"{}\"", path.display()))
            .alternative("If it keeps failing, check the disk or network mount."),
            Self::Notify { .. } => Remediation::new(
                "The OS refused a change-notification watch. Raise the watch limit.",
            )
            .command(
                "Inspect limit (Linux)",
                "cat /proc/sys/fs/inotify/max_user_watches",
            )
            .alternative("Reduce the number of distinct watched paths."),
        }
    }
}

/// Pattern-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Invalid regex '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },
}

impl PatternError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::InvalidRule(_) => Remediation::new("Rule definition invalid. Fix the rule.")
                .command("List rules", "logmon rules")
                .alternative("Every rule needs an id, a regex and a path."),
            Self::InvalidRegex { pattern, .. } => Remediation::new(
                "Regex pattern invalid. That rule produces no matches until fixed.",
            )
            .command("Try the regex", format!("logmon test '{pattern}' 'sample line'"))
            .alternative("Disable the rule until the regex is corrected."),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseError(_) => Remediation::new("Config parse failed. Fix the syntax and retry.")
                .command("Show effective config", "logmon config")
                .alternative("Validate the TOML syntax."),
            Self::SerializeFailed(_) => {
                Remediation::new("Failed to serialize configuration. Check config values.")
                    .command("Show effective config", "logmon config")
                    .alternative("Recreate the config from known-good defaults.")
            }
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("List rules", "logmon rules")
                    .alternative("Review validation errors and adjust logmon.toml.")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
