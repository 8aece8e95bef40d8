// Launcher configuration.
// Built once at startup from the binary's variant and the crate features,
// then passed by reference to every stage.

use std::env;
use std::ffi::OsString;

/// Environment variable that makes the launcher echo the command it spawns.
pub const DEBUG_ENV: &str = "LAUNCHER_DEBUG";

/// Older name for [`DEBUG_ENV`], still honoured.
pub const LEGACY_DEBUG_ENV: &str = "REZ_LAUNCHER_DEBUG";

/// Environment variable holding the `env_logger` filter.
pub const LOG_ENV: &str = "LAUNCHER_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Attached to a console; fatal errors go to stderr.
    Console,
    /// No console; fatal errors are shown in a message box.
    Windowed,
}

/// Where the shebang line comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// `foo.exe` runs `foo-script.py` next to it.
    SiblingScript,
    /// `foo.exe` carries the script as an archive appended to its own image.
    AppendedArchive,
}

/// How the standard handles reach the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStrategy {
    /// Duplicate each handle as inheritable into the child's startup info.
    Duplicate,
    /// Flip the inherit flag on the existing handles.
    InheritInPlace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherConfig {
    pub variant: Variant,
    pub source: ConfigSource,
    pub environment_search: bool,
    pub relative_paths: bool,
    pub handle_strategy: HandleStrategy,
    pub debug: bool,
}

impl LauncherConfig {
    /// Configuration selected by the crate features this binary was built with.
    pub fn for_build(variant: Variant) -> Self {
        let source = if cfg!(feature = "appended-archive") {
            ConfigSource::AppendedArchive
        } else {
            ConfigSource::SiblingScript
        };

        Self {
            variant,
            source,
            environment_search: cfg!(feature = "environment-search"),
            relative_paths: cfg!(feature = "relative-path"),
            handle_strategy: match variant {
                Variant::Console => HandleStrategy::Duplicate,
                Variant::Windowed => HandleStrategy::InheritInPlace,
            },
            debug: debug_requested(|name| env::var_os(name)),
        }
    }

    /// Suffix that replaces `.exe` to name the sibling script.
    pub fn script_suffix(&self) -> &'static str {
        match self.variant {
            Variant::Console => "-script.py",
            Variant::Windowed => "-script.pyw",
        }
    }
}

/// Whether either debug variable is set to a non-empty value.
pub fn debug_requested(lookup: impl Fn(&str) -> Option<OsString>) -> bool {
    [DEBUG_ENV, LEGACY_DEBUG_ENV]
        .into_iter()
        .any(|name| lookup(name).is_some_and(|value| !value.is_empty()))
}
