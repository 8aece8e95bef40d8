//! Demo interpreter: exit with the status given as the last argument
//!
//! Usage: exit-with [args ...] <code>

use std::env;
use std::process;

fn main() {
    let Some(last) = env::args().last() else {
        process::exit(2);
    };

    match last.parse::<i32>() {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error parsing '{}' as exit code: {}", last, e);
            process::exit(2);
        }
    }
}
