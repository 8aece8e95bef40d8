// Error taxonomy for the launcher pipeline.
// Every variant is fatal: the entry point prints it and exits with status 1.

use std::path::PathBuf;
use thiserror::Error;

/// Exit status used for any failure inside the launcher itself.
pub const FATAL_EXIT_CODE: i32 = 1;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Failed to locate the launcher executable: {0}")]
    SelfLocationFailed(String),

    #[error("Failed to read '{path}': {source}")]
    ScriptUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unable to find an appended archive: {0}")]
    AppendedArchiveNotFound(String),

    #[error("Appended archive is not supported: {0}")]
    UnsupportedArchive(String),

    #[error("Failed to find shebang")]
    ShebangNotFound,

    #[error(transparent)]
    ShebangMalformed(#[from] ShebangError),

    #[error("Unable to find executable in environment: {0}")]
    InterpreterNotFound(String),

    #[error("Expected to be able to allocate command line memory")]
    CommandBufferAllocationFailed,

    #[error("Job configuration failed: {0}")]
    JobConfigFailed(String),

    #[error("{stream} duplication failed: {reason}")]
    HandleDuplicationFailed { stream: &'static str, reason: String },

    #[error("Unable to create process using '{command}': {reason}")]
    ProcessCreationFailed { command: String, reason: String },

    #[error("Control handler setting failed: {0}")]
    ControlHandlerFailed(String),

    #[error("Failed to get exit code of process: {0}")]
    ExitCodeUnavailable(String),
}

/// Grammar failures while reading a shebang line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShebangError {
    #[error("Expected to decode shebang line using UTF-8")]
    NotUtf8,

    #[error("Expected to find terminator in shebang line")]
    MissingTerminator,

    #[error("Expected to find '#' at start of shebang line")]
    MissingHash,

    #[error("Expected to find '!' following '#' in shebang line")]
    MissingBang,

    #[error("Expected to find a command ending in '.exe' in shebang line: {0}")]
    MissingExecutable(String),

    #[error("Expected to find whitespace after '/usr/bin/env': {0}")]
    MissingEnvWhitespace(String),

    #[error("Expected to find an executable name after '/usr/bin/env': {0}")]
    MissingEnvName(String),

    #[error("Expected terminating double-quote for executable in shebang line: {0}")]
    UnterminatedQuote(String),

    #[error("Terminating quote without starting quote for executable in shebang line: {0}")]
    UnmatchedQuote(String),

    #[error("Expected whitespace after executable in shebang line: {0}")]
    TrailingGarbage(String),
}

impl LaunchError {
    /// Exit status the launcher terminates with for this error.
    pub fn exit_code(&self) -> i32 {
        FATAL_EXIT_CODE
    }
}
