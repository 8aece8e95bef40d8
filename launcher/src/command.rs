// Composing the child's command line.

use crate::error::LaunchError;
use std::ffi::{OsStr, OsString};

/// Keeps the interpreter from reading its own environment variables.
pub const ISOLATION_FLAG: &str = "-E";

const SPACE: u16 = b' ' as u16;
const TAB: u16 = b'\t' as u16;
const QUOTE: u16 = b'"' as u16;

fn is_blank(c: u16) -> bool {
    c == SPACE || c == TAB
}

/// Whatever follows the launcher's own invocation token in the raw command
/// line, with the separating whitespace removed. Quoting of the first token
/// follows the rule for argv[0]: a quoted token runs to the next quote, an
/// unquoted one to the next blank. Backslashes have no special meaning there.
pub fn caller_arguments(cmdline: &[u16]) -> &[u16] {
    let mut i = 0;
    while i < cmdline.len() && is_blank(cmdline[i]) {
        i += 1;
    }

    if cmdline.get(i) == Some(&QUOTE) {
        i += 1;
        while i < cmdline.len() && cmdline[i] != QUOTE {
            i += 1;
        }
        // closing quote
        i = (i + 1).min(cmdline.len());
    } else {
        while i < cmdline.len() && !is_blank(cmdline[i]) {
            i += 1;
        }
    }

    while i < cmdline.len() && is_blank(cmdline[i]) {
        i += 1;
    }
    &cmdline[i..]
}

/// Convert UTF-16 command-line text to an `OsString`.
#[cfg(windows)]
pub fn from_wide(wide: &[u16]) -> OsString {
    use std::os::windows::ffi::OsStringExt;
    OsString::from_wide(wide)
}

/// Convert UTF-16 command-line text to an `OsString`.
#[cfg(not(windows))]
pub fn from_wide(wide: &[u16]) -> OsString {
    OsString::from(String::from_utf16_lossy(wide))
}

/// Build `"<interpreter>" -E [<interpreter args> ]"<script>"[ <caller args>]`.
///
/// Interpreter and caller arguments are copied verbatim. Empty argument
/// strings contribute nothing, not even a separator.
pub fn compose(
    interpreter: &OsStr,
    interpreter_args: &str,
    script: &OsStr,
    caller_args: &OsStr,
) -> Result<OsString, LaunchError> {
    let mut parts: Vec<&OsStr> = vec![
        OsStr::new("\""),
        interpreter,
        OsStr::new("\" "),
        OsStr::new(ISOLATION_FLAG),
        OsStr::new(" "),
    ];
    if !interpreter_args.is_empty() {
        parts.extend([OsStr::new(interpreter_args), OsStr::new(" ")]);
    }
    parts.extend([OsStr::new("\""), script, OsStr::new("\"")]);
    if !caller_args.is_empty() {
        parts.extend([OsStr::new(" "), caller_args]);
    }

    let len = parts.iter().map(|p| p.len()).sum();
    let mut command = OsString::new();
    command
        .try_reserve_exact(len)
        .map_err(|_| LaunchError::CommandBufferAllocationFailed)?;
    for part in parts {
        command.push(part);
    }
    Ok(command)
}

/// Encode a command line for `CreateProcessW`: UTF-16, NUL-terminated.
#[cfg(windows)]
pub fn to_wide(command: &OsStr) -> Vec<u16> {
    use std::os::windows::ffi::OsStrExt;
    command.encode_wide().chain(std::iter::once(0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().collect()
    }

    fn rest(s: &str) -> String {
        String::from_utf16(caller_arguments(&wide(s))).unwrap()
    }

    #[test]
    fn strips_unquoted_program_name() {
        assert_eq!(rest(r"C:\tools\launch.exe foo bar"), "foo bar");
        assert_eq!(rest("launch.exe   \t foo  \"a b\""), "foo  \"a b\"");
    }

    #[test]
    fn strips_quoted_program_name_with_spaces() {
        assert_eq!(rest(r#""C:\Program Files\launch.exe" foo bar"#), "foo bar");
        assert_eq!(rest(r#"  "C:\dir\launch.exe""#), "");
    }

    #[test]
    fn unterminated_quote_consumes_everything() {
        assert_eq!(rest(r#""C:\dir\launch.exe foo"#), "");
    }

    #[test]
    fn no_arguments_leaves_nothing() {
        assert_eq!(rest("launch.exe"), "");
        assert_eq!(rest(""), "");
    }

    #[test]
    fn composes_in_fixed_order() {
        let command = compose(
            OsStr::new(r"C:\Python\python.exe"),
            "-u",
            OsStr::new(r"C:\tools\launch-script.py"),
            OsStr::new("foo bar"),
        )
        .unwrap();
        assert_eq!(
            command,
            r#""C:\Python\python.exe" -E -u "C:\tools\launch-script.py" foo bar"#
        );
    }

    #[test]
    fn quoted_interpreter_arguments_precede_script() {
        let command = compose(
            OsStr::new(r"C:\Some Path\py.exe"),
            "-X",
            OsStr::new(r"C:\s.py"),
            OsStr::new(""),
        )
        .unwrap();
        assert_eq!(command, r#""C:\Some Path\py.exe" -E -X "C:\s.py""#);
    }

    #[test]
    fn empty_arguments_add_no_separators() {
        let command =
            compose(OsStr::new("py.exe"), "", OsStr::new("app.exe"), OsStr::new("")).unwrap();
        assert_eq!(command, r#""py.exe" -E "app.exe""#);
    }
}
