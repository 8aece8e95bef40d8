//! Demo interpreter: report how it was invoked
//!
//! Usage: echo-args [args ...]
//! Outputs one JSON object: {"args": [...], "cwd": "..."}

use serde_json::json;
use std::env;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let cwd = env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    println!("{}", json!({ "args": args, "cwd": cwd }));
    ExitCode::SUCCESS
}
