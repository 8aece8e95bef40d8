// Script launcher: a small executable that finds the interpreter named in a
// script's shebang line and runs the script with it.
//
// Pipeline: locate -> {sibling script | appended archive} -> shebang ->
// command -> supervisor. Every stage except the Win32 supervisor is plain
// Rust over bytes and strings.

pub mod archive;
pub mod command;
pub mod config;
pub mod error;
pub mod launch;
pub mod locate;
pub mod reclaim;
pub mod shebang;

#[cfg(target_os = "windows")]
#[path = "windows.rs"]
pub mod platform;

pub use config::{LauncherConfig, Variant};
pub use error::LaunchError;
pub use launch::Supervisor;
pub use locate::LauncherIdentity;

/// Install the `env_logger` backend, filtered by `LAUNCHER_LOG` (off by default).
pub fn init_logging() {
    let env = env_logger::Env::new().filter_or(config::LOG_ENV, "off");
    let _ = env_logger::Builder::from_env(env).try_init();
}

/// Entry point shared by both binaries. Never returns: exits with the
/// child's status, or 1 after reporting a fatal error.
#[cfg(target_os = "windows")]
pub fn main_entry(variant: Variant) -> ! {
    init_logging();
    let config = LauncherConfig::for_build(variant);

    match run_windows(&config) {
        Ok(code) => std::process::exit(code as i32),
        Err(err) => {
            log::debug!("Launch failed: {err:?}");
            platform::report_fatal(&config, &err);
            std::process::exit(err.exit_code())
        }
    }
}

#[cfg(target_os = "windows")]
fn run_windows(config: &LauncherConfig) -> Result<u32, LaunchError> {
    let identity = LauncherIdentity::locate(config)?;
    log::debug!(
        "Launcher at {}, script {:?}",
        identity.exe_path().display(),
        identity.script()
    );

    let search = shebang::PathSearch::from_env(identity.launcher_dir());
    let mut supervisor = platform::WindowsSupervisor::new(config);
    launch::run(config, &identity, &search, &mut supervisor)
}
