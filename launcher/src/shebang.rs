// Shebang line parsing and interpreter resolution.
//
// Grammar, after the line is cut at the first CR, LF or NUL:
//   WS* '#' WS* '!' WS* (QuotedPath | BarePath | EnvDirective | RelativePath) (WS Arguments)?
// BarePath and QuotedPath end in ".exe". EnvDirective is "/usr/bin/env" WS name.
// RelativePath is "<launcher_dir>\" followed by a bare or quoted path, or a
// QuotedPath that starts with "<launcher_dir>\".

use crate::error::{LaunchError, ShebangError};
use crate::locate::{combine_paths, LauncherIdentity};
use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

const EXE_EXTENSION: &str = ".exe";
const ENV_DIRECTIVE: &str = "/usr/bin/env";
const RELATIVE_PREFIX: &str = "<launcher_dir>\\";

/// Which shebang forms are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    pub environment_search: bool,
    pub relative_paths: bool,
}

impl From<&crate::config::LauncherConfig> for ParseOptions {
    fn from(config: &crate::config::LauncherConfig) -> Self {
        Self {
            environment_search: config.environment_search,
            relative_paths: config.relative_paths,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramSource {
    /// Use the path as written.
    Literal,
    /// Look the name up on the search path.
    Environment,
    /// Resolve against the launcher's own directory.
    LauncherRelative,
}

/// What the shebang line asks for, before any lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterSpec {
    /// Executable path or name, with any quotes removed.
    pub program: String,
    /// Whether the program was written in double quotes.
    pub quoted: bool,
    pub source: ProgramSource,
    /// Interpreter arguments, forwarded verbatim.
    pub args: String,
}

/// Cut the shebang line at its first CR or LF. When `complete` is set the
/// bytes run to the end of the source, so a missing terminator is tolerated.
pub fn first_line(bytes: &[u8], complete: bool) -> Result<&[u8], ShebangError> {
    match bytes.iter().position(|&b| b == b'\r' || b == b'\n') {
        Some(end) => Ok(&bytes[..end]),
        None if complete => Ok(bytes),
        None => Err(ShebangError::MissingTerminator),
    }
}

/// Decode a raw shebang line and parse it.
pub fn parse_line(raw: &[u8], options: ParseOptions) -> Result<InterpreterSpec, ShebangError> {
    let text = std::str::from_utf8(raw).map_err(|_| ShebangError::NotUtf8)?;
    parse_shebang(text, options)
}

pub fn parse_shebang(line: &str, options: ParseOptions) -> Result<InterpreterSpec, ShebangError> {
    // An embedded NUL ends the line.
    let line = line.find('\0').map_or(line, |at| &line[..at]);
    let rest = line.trim_start();
    let rest = rest.strip_prefix('#').ok_or(ShebangError::MissingHash)?.trim_start();
    let rest = rest.strip_prefix('!').ok_or(ShebangError::MissingBang)?.trim_start();

    let (spec, resume) = if let Some(relative) = options
        .relative_paths
        .then(|| strip_prefix_ignore_case(rest, RELATIVE_PREFIX))
        .flatten()
    {
        parse_relative(relative, line)?
    } else if let Some(parsed) = parse_path(rest, line)? {
        relative_when_prefixed(parsed, options)
    } else if options.environment_search {
        parse_env_directive(rest, line)?
    } else {
        return Err(ShebangError::MissingExecutable(line.to_string()));
    };

    // Whatever follows the executable must be whitespace or nothing.
    if resume.starts_with('"') {
        return Err(ShebangError::UnmatchedQuote(line.to_string()));
    }
    if !resume.is_empty() && !resume.starts_with(char::is_whitespace) {
        return Err(ShebangError::TrailingGarbage(line.to_string()));
    }

    Ok(InterpreterSpec {
        args: resume.trim_start().to_string(),
        ..spec
    })
}

// The interpreter (args still empty) and the text after the executable.
type Parsed<'a> = (InterpreterSpec, &'a str);

fn spec(program: &str, quoted: bool, source: ProgramSource) -> InterpreterSpec {
    InterpreterSpec {
        program: program.to_string(),
        quoted,
        source,
        args: String::new(),
    }
}

fn parse_path<'a>(rest: &'a str, line: &str) -> Result<Option<Parsed<'a>>, ShebangError> {
    if let Some(inner) = rest.strip_prefix('"') {
        let close = inner
            .find('"')
            .ok_or_else(|| ShebangError::UnterminatedQuote(line.to_string()))?;
        let program = &inner[..close];
        if !ends_with_ignore_case(program, EXE_EXTENSION) {
            return Ok(None);
        }
        return Ok(Some((
            spec(program, true, ProgramSource::Literal),
            &inner[close + 1..],
        )));
    }

    Ok(find_exe_end(rest).map(|end| (spec(&rest[..end], false, ProgramSource::Literal), &rest[end..])))
}

// A fully quoted "<launcher_dir>\..." path is launcher-relative too.
fn relative_when_prefixed(parsed: Parsed<'_>, options: ParseOptions) -> Parsed<'_> {
    let (mut spec, resume) = parsed;
    if options.relative_paths && spec.quoted {
        if let Some(relative) = strip_prefix_ignore_case(&spec.program, RELATIVE_PREFIX) {
            spec.program = relative.to_string();
            spec.source = ProgramSource::LauncherRelative;
        }
    }
    (spec, resume)
}

fn parse_relative<'a>(relative: &'a str, line: &str) -> Result<Parsed<'a>, ShebangError> {
    if let Some(inner) = relative.strip_prefix('"') {
        let close = inner
            .find('"')
            .ok_or_else(|| ShebangError::UnterminatedQuote(line.to_string()))?;
        return Ok((
            spec(&inner[..close], true, ProgramSource::LauncherRelative),
            &inner[close + 1..],
        ));
    }

    let end = find_exe_end(relative).ok_or_else(|| ShebangError::MissingExecutable(line.to_string()))?;
    Ok((
        spec(&relative[..end], false, ProgramSource::LauncherRelative),
        &relative[end..],
    ))
}

fn parse_env_directive<'a>(rest: &'a str, line: &str) -> Result<Parsed<'a>, ShebangError> {
    let after = strip_prefix_ignore_case(rest, ENV_DIRECTIVE)
        .ok_or_else(|| ShebangError::MissingExecutable(line.to_string()))?;
    if !after.starts_with(char::is_whitespace) {
        return Err(ShebangError::MissingEnvWhitespace(line.to_string()));
    }

    let after = after.trim_start();
    let end = after.find(char::is_whitespace).unwrap_or(after.len());
    if end == 0 {
        return Err(ShebangError::MissingEnvName(line.to_string()));
    }
    Ok((
        spec(&after[..end], false, ProgramSource::Environment),
        &after[end..],
    ))
}

// End of the first ".exe" that is followed by the end of the text, a quote
// or whitespace.
fn find_exe_end(text: &str) -> Option<usize> {
    let lower = text.to_ascii_lowercase();
    let mut from = 0;
    while let Some(found) = lower[from..].find(EXE_EXTENSION) {
        let end = from + found + EXE_EXTENSION.len();
        match text[end..].chars().next() {
            None | Some('"') => return Some(end),
            Some(c) if c.is_whitespace() => return Some(end),
            Some(_) => from = end,
        }
    }
    None
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &text[prefix.len()..])
}

fn ends_with_ignore_case(text: &str, suffix: &str) -> bool {
    text.len() >= suffix.len()
        && text
            .get(text.len() - suffix.len()..)
            .is_some_and(|tail| tail.eq_ignore_ascii_case(suffix))
}

/// Search path used for `/usr/bin/env` lookups.
///
/// Directories are tried in the order Windows uses for `SearchPath`: the
/// launcher's own directory, the system directories, the current directory,
/// then each `PATH` entry.
#[derive(Debug, Clone, Default)]
pub struct PathSearch {
    /// Directory holding the launcher executable.
    pub launcher_dir: Option<PathBuf>,
    /// `System32` and the Windows directory.
    pub system_dirs: Vec<PathBuf>,
    pub cwd: PathBuf,
    /// Directories to search, in the platform's `PATH` format.
    pub path: Option<OsString>,
    /// Semicolon-separated extension candidates (`PATHEXT`).
    pub extensions: Option<String>,
}

impl PathSearch {
    pub fn from_env(launcher_dir: impl Into<PathBuf>) -> Self {
        let system_dirs = env::var_os("SystemRoot")
            .map(PathBuf::from)
            .map(|root| vec![root.join("System32"), root])
            .unwrap_or_default();

        Self {
            launcher_dir: Some(launcher_dir.into()),
            system_dirs,
            cwd: env::current_dir().unwrap_or_default(),
            path: env::var_os("PATH"),
            extensions: env::var("PATHEXT").ok(),
        }
    }

    /// Directories searched, in order. Empty entries are dropped.
    pub fn directories(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.launcher_dir.iter().cloned().collect();
        dirs.extend(self.system_dirs.iter().cloned());
        dirs.push(self.cwd.clone());
        if let Some(path) = &self.path {
            dirs.extend(env::split_paths(path));
        }
        dirs.retain(|dir| !dir.as_os_str().is_empty());
        dirs
    }

    /// Candidate file names for `name`, in the order they are tried.
    pub fn candidates(&self, name: &str) -> Vec<String> {
        if name.contains('.') {
            return vec![name.to_string()];
        }
        match &self.extensions {
            Some(list) => list
                .to_lowercase()
                .split(';')
                .filter(|ext| !ext.is_empty())
                .map(|ext| format!("{name}{ext}"))
                .collect(),
            None => Vec::new(),
        }
    }

    /// First candidate for `name` found in the search directories. Each
    /// candidate is looked for in every directory before the next one is
    /// tried.
    pub fn find(&self, name: &str) -> Option<PathBuf> {
        let dirs = self.directories();
        if dirs.is_empty() {
            return None;
        }
        let paths = match env::join_paths(&dirs) {
            Ok(paths) => paths,
            Err(e) => {
                log::warn!("Unusable search path: {e}");
                return None;
            }
        };

        self.candidates(name).into_iter().find_map(|candidate| {
            log::debug!("Searching for {candidate}");
            which::which_in(&candidate, Some(&paths), &self.cwd).ok()
        })
    }
}

/// Turn a parsed shebang into the interpreter path to run.
pub fn resolve_interpreter(
    spec: &InterpreterSpec,
    identity: &LauncherIdentity,
    search: &PathSearch,
) -> Result<OsString, LaunchError> {
    match spec.source {
        ProgramSource::Literal => Ok(OsString::from(&spec.program)),
        ProgramSource::LauncherRelative => Ok(OsString::from(combine_paths(
            &identity.launcher_dir(),
            &spec.program,
        ))),
        ProgramSource::Environment => search
            .find(&spec.program)
            .map(PathBuf::into_os_string)
            .ok_or_else(|| LaunchError::InterpreterNotFound(spec.program.clone())),
    }
}
