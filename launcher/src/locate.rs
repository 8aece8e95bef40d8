// Self-location: the launcher's own path and where its script lives.
//
// Paths are handled as Windows path text (either separator accepted) so the
// derivations behave the same on every host the library is tested on.

use crate::config::{ConfigSource, LauncherConfig};
use crate::error::LaunchError;
use std::env;
use std::path::{Path, PathBuf};

const EXE_SUFFIX: &str = ".exe";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptLocation {
    /// A script file next to the launcher.
    Sibling(PathBuf),
    /// The script is an archive appended to the launcher image.
    Appended,
}

/// The launcher's resolved path and its script location. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherIdentity {
    exe_path: PathBuf,
    script: ScriptLocation,
}

impl LauncherIdentity {
    pub fn locate(config: &LauncherConfig) -> Result<Self, LaunchError> {
        let exe = env::current_exe().map_err(|e| LaunchError::SelfLocationFailed(e.to_string()))?;
        Self::from_exe_path(exe, config)
    }

    pub fn from_exe_path(path: PathBuf, config: &LauncherConfig) -> Result<Self, LaunchError> {
        let exe_path = strip_quotes(path);
        if exe_path.as_os_str().is_empty() {
            return Err(LaunchError::SelfLocationFailed(
                "executable path is empty".to_string(),
            ));
        }

        let script = match config.source {
            ConfigSource::AppendedArchive => ScriptLocation::Appended,
            ConfigSource::SiblingScript => {
                ScriptLocation::Sibling(sibling_script(&exe_path, config.script_suffix())?)
            }
        };

        Ok(Self { exe_path, script })
    }

    pub fn exe_path(&self) -> &Path {
        &self.exe_path
    }

    pub fn script(&self) -> &ScriptLocation {
        &self.script
    }

    /// Path handed to the interpreter: the sibling script, or the launcher
    /// itself when the script is appended to it.
    pub fn script_path(&self) -> &Path {
        match &self.script {
            ScriptLocation::Sibling(path) => path,
            ScriptLocation::Appended => &self.exe_path,
        }
    }

    /// Directory containing the launcher, without a trailing separator.
    pub fn launcher_dir(&self) -> String {
        parent_dir(&self.exe_path.to_string_lossy()).to_string()
    }
}

fn strip_quotes(path: PathBuf) -> PathBuf {
    match path.to_str() {
        Some(s) if s.starts_with('"') => {
            let inner = &s[1..];
            PathBuf::from(inner.strip_suffix('"').unwrap_or(inner))
        }
        _ => path,
    }
}

// Replace the trailing ".exe" (any case) with the script suffix.
fn sibling_script(exe_path: &Path, suffix: &str) -> Result<PathBuf, LaunchError> {
    let text = exe_path.to_str().ok_or_else(|| {
        LaunchError::SelfLocationFailed("executable path is not valid Unicode".to_string())
    })?;

    let split = text.len().checked_sub(EXE_SUFFIX.len());
    match split.and_then(|at| text.get(at..).map(|tail| (at, tail))) {
        Some((at, tail)) if tail.eq_ignore_ascii_case(EXE_SUFFIX) => {
            Ok(PathBuf::from(format!("{}{}", &text[..at], suffix)))
        }
        _ => Err(LaunchError::SelfLocationFailed(format!(
            "failed to find \"{EXE_SUFFIX}\" in executable name '{text}'"
        ))),
    }
}

fn is_separator(c: char) -> bool {
    c == '\\' || c == '/'
}

/// Everything before the last path separator, or "" when there is none.
pub fn parent_dir(path: &str) -> &str {
    match path.rfind(is_separator) {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Join `rel` onto `dir` and collapse `.` and `..` lexically, keeping any
/// drive or UNC root. An absolute `rel` replaces `dir`.
pub fn combine_paths(dir: &str, rel: &str) -> String {
    if is_absolute(rel) || dir.is_empty() {
        normalize(rel)
    } else {
        normalize(&format!("{dir}\\{rel}"))
    }
}

fn is_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with(is_separator)
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

fn normalize(path: &str) -> String {
    let (mut out, rest) = split_root(path);

    let mut parts: Vec<&str> = Vec::new();
    for component in rest.split(is_separator) {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    out.push_str(&parts.join("\\"));
    out
}

fn split_root(path: &str) -> (String, &str) {
    let bytes = path.as_bytes();

    // \\server\share\...
    if bytes.len() >= 2 && is_separator(bytes[0] as char) && is_separator(bytes[1] as char) {
        let mut pieces = path[2..].splitn(3, is_separator);
        let server = pieces.next().unwrap_or("");
        let share = pieces.next().unwrap_or("");
        let rest = pieces.next().unwrap_or("");
        return (format!("\\\\{server}\\{share}\\"), rest);
    }

    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        let drive = &path[..2];
        return match path[2..].strip_prefix(is_separator) {
            Some(rest) => (format!("{drive}\\"), rest),
            None => (drive.to_string(), &path[2..]),
        };
    }

    match path.strip_prefix(is_separator) {
        Some(rest) => ("\\".to_string(), rest),
        None => (String::new(), path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Variant;

    fn sibling_config(variant: Variant) -> LauncherConfig {
        let mut config = LauncherConfig::for_build(variant);
        config.source = ConfigSource::SiblingScript;
        config
    }

    #[test]
    fn console_launcher_points_at_py_script() {
        let identity = LauncherIdentity::from_exe_path(
            PathBuf::from(r"C:\tools\launch.exe"),
            &sibling_config(Variant::Console),
        )
        .unwrap();

        assert_eq!(identity.script_path(), Path::new(r"C:\tools\launch-script.py"));
        assert_eq!(identity.launcher_dir(), r"C:\tools");
    }

    #[test]
    fn windowed_launcher_points_at_pyw_script_and_ignores_case() {
        let identity = LauncherIdentity::from_exe_path(
            PathBuf::from(r"C:\tools\Launch.EXE"),
            &sibling_config(Variant::Windowed),
        )
        .unwrap();

        assert_eq!(identity.script_path(), Path::new(r"C:\tools\Launch-script.pyw"));
    }

    #[test]
    fn wrapping_quotes_are_stripped() {
        let identity = LauncherIdentity::from_exe_path(
            PathBuf::from(r#""C:\Program Files\tool\run.exe""#),
            &sibling_config(Variant::Console),
        )
        .unwrap();

        assert_eq!(identity.exe_path(), Path::new(r"C:\Program Files\tool\run.exe"));
        assert_eq!(
            identity.script_path(),
            Path::new(r"C:\Program Files\tool\run-script.py")
        );
    }

    #[test]
    fn only_the_trailing_extension_is_replaced() {
        let identity = LauncherIdentity::from_exe_path(
            PathBuf::from(r"C:\a.exe.d\tool.exe"),
            &sibling_config(Variant::Console),
        )
        .unwrap();

        assert_eq!(identity.script_path(), Path::new(r"C:\a.exe.d\tool-script.py"));
    }

    #[test]
    fn missing_exe_extension_is_fatal() {
        let err = LauncherIdentity::from_exe_path(
            PathBuf::from("/usr/local/bin/tool"),
            &sibling_config(Variant::Console),
        )
        .unwrap_err();

        assert!(matches!(err, LaunchError::SelfLocationFailed(_)));
    }

    #[test]
    fn appended_launcher_uses_itself_as_script() {
        let mut config = LauncherConfig::for_build(Variant::Console);
        config.source = ConfigSource::AppendedArchive;

        let identity =
            LauncherIdentity::from_exe_path(PathBuf::from(r"C:\tools\app.exe"), &config).unwrap();

        assert_eq!(identity.script(), &ScriptLocation::Appended);
        assert_eq!(identity.script_path(), Path::new(r"C:\tools\app.exe"));
    }

    #[test]
    fn combine_resolves_against_launcher_dir() {
        assert_eq!(combine_paths(r"C:\tools", r"sub\py.exe"), r"C:\tools\sub\py.exe");
        assert_eq!(combine_paths(r"C:\tools", r"..\py\py.exe"), r"C:\py\py.exe");
        assert_eq!(combine_paths(r"C:\tools", r".\.\py.exe"), r"C:\tools\py.exe");
        assert_eq!(combine_paths(r"C:\tools", r"..\..\..\py.exe"), r"C:\py.exe");
    }

    #[test]
    fn combine_keeps_absolute_right_hand_side() {
        assert_eq!(combine_paths(r"C:\tools", r"D:\py\py.exe"), r"D:\py\py.exe");
        assert_eq!(
            combine_paths(r"C:\tools", r"\\server\share\py\..\py.exe"),
            r"\\server\share\py.exe"
        );
    }

    #[test]
    fn parent_dir_accepts_either_separator() {
        assert_eq!(parent_dir(r"C:\tools\launch.exe"), r"C:\tools");
        assert_eq!(parent_dir("/opt/tools/launch.exe"), "/opt/tools");
        assert_eq!(parent_dir("launch.exe"), "");
    }
}
