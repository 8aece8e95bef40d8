// Windowed launcher: no console window, runs <name>-script.pyw. Fatal errors
// are shown in a message box.

#![cfg_attr(target_os = "windows", windows_subsystem = "windows")]

#[cfg(target_os = "windows")]
fn main() {
    script_launcher::main_entry(script_launcher::Variant::Windowed)
}

#[cfg(not(target_os = "windows"))]
fn main() {
    eprintln!("launcherw: only supported on Windows");
    std::process::exit(1);
}
