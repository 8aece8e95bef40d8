// Console launcher: runs <name>-script.py (or its appended archive) with the
// interpreter from the shebang line. Fatal errors go to stderr.

#[cfg(target_os = "windows")]
fn main() {
    script_launcher::main_entry(script_launcher::Variant::Console)
}

#[cfg(not(target_os = "windows"))]
fn main() {
    eprintln!("launcher: only supported on Windows");
    std::process::exit(1);
}
