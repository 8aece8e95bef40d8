// The launcher pipeline: read the shebang, resolve the interpreter, compose
// the command line and hand it to a supervisor.

use crate::archive::{self, SHEBANG_WINDOW};
use crate::command;
use crate::config::LauncherConfig;
use crate::error::LaunchError;
use crate::locate::{LauncherIdentity, ScriptLocation};
use crate::shebang::{self, ParseOptions, PathSearch};
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Runs the composed command and reports the child's exit code.
pub trait Supervisor {
    /// The caller's arguments, with the launcher's own name removed.
    fn caller_arguments(&self) -> OsString;

    fn launch(&mut self, command: &OsStr) -> Result<u32, LaunchError>;
}

fn open(path: &Path) -> Result<File, LaunchError> {
    File::open(path).map_err(|source| LaunchError::ScriptUnreadable {
        path: path.to_path_buf(),
        source,
    })
}

/// Bytes from the start of the shebang line, and whether they reach the end
/// of their source.
pub fn read_shebang(identity: &LauncherIdentity) -> Result<(Vec<u8>, bool), LaunchError> {
    match identity.script() {
        ScriptLocation::Sibling(path) => {
            let mut buf = Vec::with_capacity(SHEBANG_WINDOW);
            open(path)?
                .take(SHEBANG_WINDOW as u64)
                .read_to_end(&mut buf)
                .map_err(|source| LaunchError::ScriptUnreadable {
                    path: path.clone(),
                    source,
                })?;
            let complete = buf.len() < SHEBANG_WINDOW;
            Ok((buf, complete))
        }
        ScriptLocation::Appended => archive::find_shebang(&mut open(identity.exe_path())?),
    }
}

/// Everything up to the spawn: the full command line for the child.
pub fn prepare(
    config: &LauncherConfig,
    identity: &LauncherIdentity,
    search: &PathSearch,
    caller_args: &OsStr,
) -> Result<OsString, LaunchError> {
    let (bytes, complete) = read_shebang(identity)?;
    let line = shebang::first_line(&bytes, complete)?;
    log::debug!("Shebang: {}", String::from_utf8_lossy(line));

    let spec = shebang::parse_line(line, ParseOptions::from(config))?;
    let interpreter = shebang::resolve_interpreter(&spec, identity, search)?;
    log::debug!("Interpreter: {}", interpreter.to_string_lossy());

    command::compose(
        &interpreter,
        &spec.args,
        identity.script_path().as_os_str(),
        caller_args,
    )
}

/// Run the whole pipeline and return the child's exit code.
pub fn run<S: Supervisor>(
    config: &LauncherConfig,
    identity: &LauncherIdentity,
    search: &PathSearch,
    supervisor: &mut S,
) -> Result<u32, LaunchError> {
    let command = prepare(config, identity, search, &supervisor.caller_arguments())?;
    log::debug!("Command: {}", command.to_string_lossy());
    if config.debug {
        println!("Launching: {}", command.to_string_lossy());
    }

    let code = supervisor.launch(&command)?;
    log::debug!("Child exited with {code}");
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigSource, Variant};
    use crate::error::ShebangError;
    use std::fs;
    use std::path::PathBuf;

    #[derive(Default)]
    struct RecordingSupervisor {
        args: String,
        exit_code: u32,
        launched: Vec<OsString>,
    }

    impl Supervisor for RecordingSupervisor {
        fn caller_arguments(&self) -> OsString {
            OsString::from(&self.args)
        }

        fn launch(&mut self, command: &OsStr) -> Result<u32, LaunchError> {
            self.launched.push(command.to_owned());
            Ok(self.exit_code)
        }
    }

    fn config(source: ConfigSource) -> LauncherConfig {
        let mut config = LauncherConfig::for_build(Variant::Console);
        config.source = source;
        config.environment_search = true;
        config.relative_paths = true;
        config.debug = false;
        config
    }

    fn make_executable(path: &Path) {
        fs::write(path, b"").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    #[test]
    fn env_shebang_runs_resolved_interpreter_with_caller_arguments() {
        let dir = tempfile::tempdir().unwrap();
        make_executable(&dir.path().join("env_interp.exe"));
        let script = dir.path().join("launch-script.py");
        fs::write(&script, b"#!/usr/bin/env env_interp\r\nprint('hi')\r\n").unwrap();

        let config = config(ConfigSource::SiblingScript);
        let identity =
            LauncherIdentity::from_exe_path(dir.path().join("launch.exe"), &config).unwrap();
        let search = PathSearch {
            path: Some(dir.path().as_os_str().to_owned()),
            extensions: Some(".COM;.EXE".to_string()),
            cwd: dir.path().to_path_buf(),
            ..Default::default()
        };
        let interp = search.find("env_interp").unwrap();

        let mut supervisor = RecordingSupervisor {
            args: "foo bar".to_string(),
            exit_code: 42,
            ..Default::default()
        };
        let code = run(&config, &identity, &search, &mut supervisor).unwrap();

        assert_eq!(code, 42);
        assert_eq!(
            supervisor.launched,
            vec![OsString::from(format!(
                "\"{}\" -E \"{}\" foo bar",
                interp.display(),
                script.display()
            ))]
        );
    }

    #[test]
    fn unresolvable_env_name_never_launches() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("launch-script.py"), b"#!/usr/bin/env nowhere\n").unwrap();

        let config = config(ConfigSource::SiblingScript);
        let identity =
            LauncherIdentity::from_exe_path(dir.path().join("launch.exe"), &config).unwrap();
        let search = PathSearch {
            path: Some(dir.path().as_os_str().to_owned()),
            extensions: Some(".EXE".to_string()),
            cwd: dir.path().to_path_buf(),
            ..Default::default()
        };

        let mut supervisor = RecordingSupervisor::default();
        let err = run(&config, &identity, &search, &mut supervisor).unwrap_err();
        assert!(matches!(err, LaunchError::InterpreterNotFound(_)));
        assert!(supervisor.launched.is_empty());
    }

    #[test]
    fn short_script_without_newline_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("tool-script.py"), br#"#!"C:\Some Path\py.exe" -X"#).unwrap();

        let config = config(ConfigSource::SiblingScript);
        let identity =
            LauncherIdentity::from_exe_path(dir.path().join("tool.exe"), &config).unwrap();
        let command =
            prepare(&config, &identity, &PathSearch::default(), OsStr::new("")).unwrap();

        assert_eq!(
            command,
            OsString::from(format!(
                r#""C:\Some Path\py.exe" -E -X "{}""#,
                identity.script_path().display()
            ))
        );
    }

    #[test]
    fn long_first_line_without_terminator_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = b"#!py.exe ".to_vec();
        body.extend(std::iter::repeat(b'x').take(2 * SHEBANG_WINDOW));
        fs::write(dir.path().join("tool-script.py"), body).unwrap();

        let config = config(ConfigSource::SiblingScript);
        let identity =
            LauncherIdentity::from_exe_path(dir.path().join("tool.exe"), &config).unwrap();
        let err = prepare(&config, &identity, &PathSearch::default(), OsStr::new("")).unwrap_err();
        assert!(matches!(
            err,
            LaunchError::ShebangMalformed(ShebangError::MissingTerminator)
        ));
    }

    #[test]
    fn missing_sibling_script_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(ConfigSource::SiblingScript);
        let identity =
            LauncherIdentity::from_exe_path(dir.path().join("tool.exe"), &config).unwrap();

        let err = read_shebang(&identity).unwrap_err();
        assert!(matches!(err, LaunchError::ScriptUnreadable { .. }));
    }

    #[test]
    fn appended_archive_passes_launcher_as_script() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("app.exe");

        // stub, then the shebang, then an empty archive whose directory
        // offset includes the shebang line
        let shebang: &[u8] = b"#!<launcher_dir>\\venv\\py.exe -u\r\n";
        let mut image = b"MZ stub".to_vec();
        image.extend_from_slice(shebang);
        image.extend_from_slice(&[0x50, 0x4B, 0x05, 0x06]);
        image.extend_from_slice(&[0u8; 8]);
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&(shebang.len() as u32).to_le_bytes());
        image.extend_from_slice(&[0u8; 2]);
        fs::write(&exe, image).unwrap();

        let config = config(ConfigSource::AppendedArchive);
        let identity = LauncherIdentity::from_exe_path(exe.clone(), &config).unwrap();
        let mut supervisor = RecordingSupervisor { exit_code: 3, ..Default::default() };
        let code = run(&config, &identity, &PathSearch::default(), &mut supervisor).unwrap();

        assert_eq!(code, 3);
        let expected_interp = PathBuf::from(crate::locate::combine_paths(
            &identity.launcher_dir(),
            r"venv\py.exe",
        ));
        assert_eq!(
            supervisor.launched,
            vec![OsString::from(format!(
                "\"{}\" -E -u \"{}\"",
                expected_interp.display(),
                exe.display()
            ))]
        );
    }
}
