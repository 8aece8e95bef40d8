//! Test runner for script-launcher
//!
//! Builds launcher fixtures in a work directory and runs them:
//! 1. A sibling `-script.py` whose shebang names a stand-in interpreter
//! 2. `/usr/bin/env` and `<launcher_dir>` shebangs
//! 3. Scripts appended to the launcher as an archive, in both layouts
//! 4. Exit-code propagation and fatal error reporting
//!
//! Usage: test-runner --launcher <path> --test-binaries <dir>
//!
//! The stand-in interpreters (`echo-args`, `exit-with`) live in this package.

use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use std::env;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode, Output};

/// Executable extension
#[cfg(windows)]
const EXE_EXT: &str = ".exe";
#[cfg(not(windows))]
const EXE_EXT: &str = "";

const ISOLATION_FLAG: &str = "-E";

#[derive(Parser, Debug)]
#[command(name = "test-runner", about = "Integration tests for script-launcher")]
struct TestConfig {
    /// Console launcher built with default features
    #[arg(long)]
    launcher: PathBuf,

    /// Windowed launcher (optional)
    #[arg(long)]
    launcherw: Option<PathBuf>,

    /// Console launcher built with the `appended-archive` feature (optional)
    #[arg(long)]
    appended_launcher: Option<PathBuf>,

    /// Directory containing echo-args and exit-with
    #[arg(long)]
    test_binaries: PathBuf,

    /// Working directory for test artifacts (default: temp dir)
    #[arg(long)]
    work_dir: Option<PathBuf>,
}

impl TestConfig {
    fn validate(&self) -> Result<()> {
        for path in [Some(&self.launcher), self.launcherw.as_ref(), self.appended_launcher.as_ref()]
            .into_iter()
            .flatten()
        {
            ensure!(path.exists(), "Launcher not found: {}", path.display());
        }
        ensure!(
            self.test_binaries.exists(),
            "Test binaries dir not found: {}",
            self.test_binaries.display()
        );
        Ok(())
    }

    fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| env::temp_dir().join("script-launcher-tests"))
    }

    fn demo(&self, name: &str) -> PathBuf {
        self.test_binaries.join(format!("{name}{EXE_EXT}"))
    }
}

/// A fresh directory holding one launcher and its script.
struct Fixture {
    dir: PathBuf,
    exe: PathBuf,
}

impl Fixture {
    fn new(config: &TestConfig, case: &str, launcher: &Path, name: &str) -> Result<Self> {
        let dir = config.work_dir().join(case);
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("Failed to clean {}", dir.display()))?;
        }
        fs::create_dir_all(&dir)?;

        let exe = dir.join(format!("{name}.exe"));
        fs::copy(launcher, &exe)
            .with_context(|| format!("Failed to copy launcher to {}", exe.display()))?;
        Ok(Self { dir, exe })
    }

    fn script_path(&self, suffix: &str) -> PathBuf {
        let stem = self.exe.file_stem().and_then(OsStr::to_str).unwrap_or_default();
        self.dir.join(format!("{stem}{suffix}"))
    }

    fn write_script(&self, suffix: &str, shebang: &str) -> Result<PathBuf> {
        let path = self.script_path(suffix);
        fs::write(&path, format!("{shebang}\r\nprint('hello')\r\n"))?;
        Ok(path)
    }

    /// Copy a demo interpreter into `rel` under the fixture directory.
    fn install(&self, config: &TestConfig, demo: &str, rel: &str) -> Result<PathBuf> {
        let target = self.dir.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(config.demo(demo), &target)
            .with_context(|| format!("Failed to install {demo} at {}", target.display()))?;
        Ok(target)
    }

    fn run(&self, args: &[&str], envs: &[(&str, &OsStr)]) -> Result<Output> {
        let mut cmd = Command::new(&self.exe);
        cmd.args(args).current_dir(&self.dir);
        for (key, value) in envs {
            cmd.env(key, value);
        }
        cmd.output()
            .with_context(|| format!("Failed to run {}", self.exe.display()))
    }
}

/// The argv an `echo-args` child reported, without its program name.
fn echoed_args(output: &Output) -> Result<Vec<String>> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    ensure!(
        output.status.success(),
        "Launcher failed with {:?}: {}",
        output.status.code(),
        String::from_utf8_lossy(&output.stderr)
    );

    let line = stdout
        .lines()
        .rev()
        .find(|l| l.starts_with('{'))
        .with_context(|| format!("No JSON in output: {stdout}"))?;
    let value: serde_json::Value = serde_json::from_str(line)?;
    let args = value["args"]
        .as_array()
        .with_context(|| format!("Missing args in {line}"))?
        .iter()
        .filter_map(|a| a.as_str().map(str::to_string))
        .collect();
    Ok(args)
}

// The launcher reports paths as the OS spells them, which may differ in case
// or short-name form from ours.
fn same_file(reported: &str, expected: &Path) -> bool {
    match (fs::canonicalize(reported), fs::canonicalize(expected)) {
        (Ok(a), Ok(b)) => a == b,
        _ => reported.eq_ignore_ascii_case(&expected.display().to_string()),
    }
}

fn expect_args(args: &[String], interpreter_args: &[&str], script: &Path, caller: &[&str]) -> Result<()> {
    let mut at = 0;
    ensure!(
        args.get(at).map(String::as_str) == Some(ISOLATION_FLAG),
        "Expected {ISOLATION_FLAG} first, got {args:?}"
    );
    at += 1;

    for expected in interpreter_args {
        ensure!(
            args.get(at).map(String::as_str) == Some(*expected),
            "Expected interpreter arg {expected} at {at}, got {args:?}"
        );
        at += 1;
    }

    match args.get(at) {
        Some(reported) if same_file(reported, script) => at += 1,
        other => bail!("Expected script {} at {at}, got {other:?}", script.display()),
    }

    let rest: Vec<&str> = args[at..].iter().map(String::as_str).collect();
    ensure!(rest == caller, "Expected caller args {caller:?}, got {rest:?}");
    Ok(())
}

fn test_sibling_quoted_interpreter(config: &TestConfig) -> Result<()> {
    println!("  Running test: sibling_quoted_interpreter");

    let fixture = Fixture::new(config, "sibling", &config.launcher, "tool")?;
    let interp = fixture.install(config, "echo-args", r"interp dir\echo-args.exe")?;
    let script = fixture.write_script("-script.py", &format!("#!\"{}\" -u", interp.display()))?;

    let output = fixture.run(&["foo", "bar baz"], &[])?;
    let args = echoed_args(&output)?;
    expect_args(&args, &["-u"], &script, &["foo", "bar baz"])?;

    println!("    PASS");
    Ok(())
}

fn test_environment_search(config: &TestConfig) -> Result<()> {
    println!("  Running test: environment_search");

    let fixture = Fixture::new(config, "env-search", &config.launcher, "tool")?;
    let bin = fixture.dir.join("bin");
    fixture.install(config, "echo-args", r"bin\echo-args.exe")?;
    let script = fixture.write_script("-script.py", "#!/usr/bin/env echo-args")?;

    let output = fixture.run(
        &["foo", "bar"],
        &[("PATH", bin.as_os_str()), ("PATHEXT", OsStr::new(".COM;.EXE"))],
    )?;
    let args = echoed_args(&output)?;
    expect_args(&args, &[], &script, &["foo", "bar"])?;

    // Without PATHEXT nothing can be resolved
    let output = fixture.run(&[], &[("PATH", bin.as_os_str()), ("PATHEXT", OsStr::new(""))])?;
    ensure!(
        output.status.code() == Some(1),
        "Expected exit 1 without PATHEXT, got {:?}",
        output.status.code()
    );

    println!("    PASS");
    Ok(())
}

fn test_launcher_relative(config: &TestConfig) -> Result<()> {
    println!("  Running test: launcher_relative");

    let fixture = Fixture::new(config, "relative", &config.launcher, "tool")?;
    fixture.install(config, "echo-args", r"venv\Scripts\echo-args.exe")?;
    let script = fixture.write_script(
        "-script.py",
        r"#!<launcher_dir>\venv\Scripts\..\Scripts\echo-args.exe -X dev",
    )?;

    let output = fixture.run(&["a"], &[])?;
    let args = echoed_args(&output)?;
    expect_args(&args, &["-X", "dev"], &script, &["a"])?;

    println!("    PASS");
    Ok(())
}

fn test_exit_code_propagation(config: &TestConfig) -> Result<()> {
    println!("  Running test: exit_code_propagation");

    let fixture = Fixture::new(config, "exit-code", &config.launcher, "tool")?;
    let interp = fixture.install(config, "exit-with", "exit-with.exe")?;
    fixture.write_script("-script.py", &format!("#!\"{}\"", interp.display()))?;

    for code in [0, 3, 42] {
        let arg = code.to_string();
        let output = fixture.run(&[arg.as_str()], &[])?;
        ensure!(
            output.status.code() == Some(code),
            "Expected exit {code}, got {:?}",
            output.status.code()
        );
    }

    println!("    PASS");
    Ok(())
}

fn test_fatal_errors(config: &TestConfig) -> Result<()> {
    println!("  Running test: fatal_errors");

    let fixture = Fixture::new(config, "fatal", &config.launcher, "tool")?;

    // No script next to the launcher
    let output = fixture.run(&[], &[])?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    ensure!(output.status.code() == Some(1), "Expected exit 1, got {:?}", output.status.code());
    ensure!(
        stderr.contains("Fatal error in launcher"),
        "Missing diagnostic in stderr: {stderr}"
    );

    // Interpreter does not exist
    fixture.write_script("-script.py", r#"#!"C:\does not exist\py.exe""#)?;
    let output = fixture.run(&[], &[])?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    ensure!(output.status.code() == Some(1), "Expected exit 1, got {:?}", output.status.code());
    ensure!(
        stderr.contains("Unable to create process"),
        "Missing process creation error: {stderr}"
    );

    // Malformed shebang
    fixture.write_script("-script.py", "#!/usr/bin/python")?;
    let output = fixture.run(&[], &[])?;
    ensure!(output.status.code() == Some(1), "Expected exit 1, got {:?}", output.status.code());

    println!("    PASS");
    Ok(())
}

fn test_debug_echo(config: &TestConfig) -> Result<()> {
    println!("  Running test: debug_echo");

    let fixture = Fixture::new(config, "debug", &config.launcher, "tool")?;
    let interp = fixture.install(config, "echo-args", "echo-args.exe")?;
    fixture.write_script("-script.py", &format!("#!\"{}\"", interp.display()))?;

    let output = fixture.run(&["x"], &[("LAUNCHER_DEBUG", OsStr::new("1"))])?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    ensure!(
        stdout.contains("Launching: \""),
        "Missing command echo in output: {stdout}"
    );

    println!("    PASS");
    Ok(())
}

fn test_windowed_launcher(config: &TestConfig) -> Result<()> {
    println!("  Running test: windowed_launcher");

    let Some(launcherw) = &config.launcherw else {
        println!("    SKIP (no --launcherw)");
        return Ok(());
    };

    let fixture = Fixture::new(config, "windowed", launcherw, "gui")?;
    let interp = fixture.install(config, "exit-with", "exit-with.exe")?;
    fixture.write_script("-script.pyw", &format!("#!\"{}\"", interp.display()))?;

    let output = fixture.run(&["5"], &[])?;
    ensure!(
        output.status.code() == Some(5),
        "Expected exit 5, got {:?}",
        output.status.code()
    );

    println!("    PASS");
    Ok(())
}

/// An archive with no entries: just the end-of-central-directory record.
fn empty_archive(directory_offset: u32) -> Vec<u8> {
    let mut record = b"PK\x05\x06".to_vec();
    record.extend_from_slice(&[0u8; 8]);
    record.extend_from_slice(&0u32.to_le_bytes());
    record.extend_from_slice(&directory_offset.to_le_bytes());
    record.extend_from_slice(&0u16.to_le_bytes());
    record
}

fn test_appended_archive(config: &TestConfig) -> Result<()> {
    println!("  Running test: appended_archive");

    let Some(launcher) = &config.appended_launcher else {
        println!("    SKIP (no --appended-launcher)");
        return Ok(());
    };

    // zipapp counts the shebang in the directory offset; a plain copy does not
    for (case, shebang_in_offset) in [("appended-zipapp", true), ("appended-copy", false)] {
        let fixture = Fixture::new(config, case, launcher, "app")?;
        let interp = fixture.install(config, "echo-args", "echo-args.exe")?;
        let shebang = format!("#!\"{}\" -u\r\n", interp.display());

        let mut image = fs::read(&fixture.exe)?;
        image.extend_from_slice(shebang.as_bytes());
        let offset = if shebang_in_offset { shebang.len() as u32 } else { 0 };
        image.extend_from_slice(&empty_archive(offset));
        fs::write(&fixture.exe, image)?;

        let output = fixture.run(&["one", "two"], &[])?;
        let args = echoed_args(&output).with_context(|| format!("case {case}"))?;
        expect_args(&args, &["-u"], &fixture.exe, &["one", "two"])?;
    }

    println!("    PASS");
    Ok(())
}

fn main() -> ExitCode {
    println!("=== Script Launcher Test Suite ===");
    println!();

    let config = TestConfig::parse();
    if let Err(e) = config.validate() {
        eprintln!("Error: {e:#}");
        return ExitCode::from(1);
    }

    if !cfg!(windows) {
        println!("Skipping: the launcher only runs on Windows");
        return ExitCode::SUCCESS;
    }

    let work_dir = config.work_dir();
    if let Err(e) = fs::create_dir_all(&work_dir) {
        eprintln!("Error: Failed to create work dir: {e}");
        return ExitCode::from(1);
    }

    println!("Configuration:");
    println!("  Launcher:      {}", config.launcher.display());
    println!("  Test binaries: {}", config.test_binaries.display());
    println!("  Work dir:      {}", work_dir.display());
    println!();

    let tests: Vec<(&str, fn(&TestConfig) -> Result<()>)> = vec![
        ("sibling_quoted_interpreter", test_sibling_quoted_interpreter),
        ("environment_search", test_environment_search),
        ("launcher_relative", test_launcher_relative),
        ("exit_code_propagation", test_exit_code_propagation),
        ("fatal_errors", test_fatal_errors),
        ("debug_echo", test_debug_echo),
        ("windowed_launcher", test_windowed_launcher),
        ("appended_archive", test_appended_archive),
    ];

    let mut passed = 0;
    let mut failed = 0;

    println!("Running {} tests...", tests.len());
    println!();

    for (name, test_fn) in &tests {
        match test_fn(&config) {
            Ok(()) => passed += 1,
            Err(e) => {
                println!("  FAILED ({name}): {e:#}");
                failed += 1;
            }
        }
    }

    println!();
    println!("=== Results ===");
    println!("Passed: {passed}");
    println!("Failed: {failed}");
    println!();

    if failed > 0 {
        ExitCode::from(1)
    } else {
        println!("All tests passed!");
        ExitCode::SUCCESS
    }
}
