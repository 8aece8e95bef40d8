// Windows process supervision: job object, standard handle inheritance,
// spawning, console control events and cleanup after the spawn.

use crate::command;
use crate::config::{HandleStrategy, LauncherConfig, Variant};
use crate::error::LaunchError;
use crate::launch::Supervisor;
use crate::reclaim::{self, StdHandles, StdStream};
use std::env;
use std::ffi::{OsStr, OsString};
use std::mem::size_of;
use std::sync::{Once, OnceLock};

use windows::core::{w, PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, DuplicateHandle, SetHandleInformation, BOOL, DUPLICATE_SAME_ACCESS,
    ERROR_INVALID_HANDLE, HANDLE, HANDLE_FLAGS, HANDLE_FLAG_INHERIT, HINSTANCE, HWND,
};
use windows::Win32::Storage::FileSystem::{GetFileType, FILE_TYPE_CHAR, FILE_TYPE_UNKNOWN};
use windows::Win32::System::Console::{
    GetStdHandle, SetConsoleCtrlHandler, SetStdHandle, CTRL_CLOSE_EVENT, CTRL_LOGOFF_EVENT,
    CTRL_SHUTDOWN_EVENT, STD_ERROR_HANDLE, STD_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
};
use windows::Win32::System::Environment::GetCommandLineW;
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
    QueryInformationJobObject, SetInformationJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE, JOB_OBJECT_LIMIT_SILENT_BREAKAWAY_OK,
};
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::Threading::{
    CreateProcessW, GetCurrentProcess, GetExitCodeProcess, GetStartupInfoW, WaitForSingleObject,
    INFINITE, PROCESS_CREATION_FLAGS, PROCESS_INFORMATION, STARTF_USEHOTKEY,
    STARTF_USESTDHANDLES, STARTUPINFOW, STARTUPINFOW_FLAGS,
};
use windows::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DestroyWindow, GetMessageW, MessageBoxW, PeekMessageW, PostMessageW,
    WaitForInputIdle, HMENU, HWND_MESSAGE, MB_ICONERROR, MB_OK, MESSAGEBOX_RESULT, MESSAGEBOX_STYLE, MSG,
    PEEK_MESSAGE_REMOVE_TYPE, WINDOW_EX_STYLE, WINDOW_STYLE,
};

// Set by the shell when it hands a monitor to the new process in hStdOutput.
const STARTF_UNDOC_MONITOR: STARTUPINFOW_FLAGS = STARTUPINFOW_FLAGS(0x400);

const FATAL_TITLE: &str = "Fatal Error in Launcher";
const MESSAGE_BOX_TIMEOUT_MS: u32 = 3000;

/// Job object that owns the child. Closing it, which happens when the
/// launcher exits, terminates every process still in it.
struct JobController {
    handle: HANDLE,
}

// SAFETY: a job object handle is a kernel reference usable from any thread,
// and the object serialises changes to its own limits.
unsafe impl Send for JobController {}
unsafe impl Sync for JobController {}

// Reachable from the console control handler, which runs on its own thread.
static JOB: OnceLock<JobController> = OnceLock::new();

impl JobController {
    fn create() -> Result<Self, LaunchError> {
        let handle = unsafe { CreateJobObjectW(None, PCWSTR::null()) }
            .map_err(|e| LaunchError::JobConfigFailed(format!("Job creation failed: {e}")))?;
        let job = Self { handle };

        let mut info = job.query()?;
        info.BasicLimitInformation.LimitFlags |=
            JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE | JOB_OBJECT_LIMIT_SILENT_BREAKAWAY_OK;
        job.set(&info)
            .map_err(|e| LaunchError::JobConfigFailed(format!("Job information setting failed: {e}")))?;

        log::debug!("Job object created");
        Ok(job)
    }

    fn query(&self) -> Result<JOBOBJECT_EXTENDED_LIMIT_INFORMATION, LaunchError> {
        let mut info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
        let mut returned = 0u32;
        let expected = size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32;

        unsafe {
            QueryInformationJobObject(
                self.handle,
                JobObjectExtendedLimitInformation,
                (&raw mut info).cast(),
                expected,
                Some(&raw mut returned),
            )
        }
        .map_err(|e| LaunchError::JobConfigFailed(format!("Job information querying failed: {e}")))?;

        if returned != expected {
            return Err(LaunchError::JobConfigFailed(format!(
                "Job information querying returned {returned} bytes, expected {expected}"
            )));
        }
        Ok(info)
    }

    fn set(&self, info: &JOBOBJECT_EXTENDED_LIMIT_INFORMATION) -> windows::core::Result<()> {
        unsafe {
            SetInformationJobObject(
                self.handle,
                JobObjectExtendedLimitInformation,
                (info as *const JOBOBJECT_EXTENDED_LIMIT_INFORMATION).cast(),
                size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            )
        }
    }

    fn assign(&self, process: HANDLE) {
        if let Err(e) = unsafe { AssignProcessToJobObject(self.handle, process) } {
            log::warn!("Failed to assign child to job: {e}");
        }
    }

    /// Stop the job from killing the child when the launcher goes away.
    fn allow_child_to_outlive(&self) {
        let result = self.query().and_then(|mut info| {
            info.BasicLimitInformation.LimitFlags.0 &= !JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE.0;
            self.set(&info)
                .map_err(|e| LaunchError::JobConfigFailed(e.to_string()))
        });
        if let Err(e) = result {
            log::warn!("Failed to release child from job: {e}");
        }
    }
}

// The launcher ignores every console event itself; the child receives them
// too and decides. Close, logoff and shutdown end the launcher regardless, so
// the child is released from the job first.
unsafe extern "system" fn control_handler(event: u32) -> BOOL {
    if matches!(event, CTRL_CLOSE_EVENT | CTRL_LOGOFF_EVENT | CTRL_SHUTDOWN_EVENT) {
        if let Some(job) = JOB.get() {
            job.allow_child_to_outlive();
        }
    }
    true.into()
}

fn std_handle(which: STD_HANDLE) -> HANDLE {
    unsafe { GetStdHandle(which) }.unwrap_or_default()
}

fn raw(handle: HANDLE) -> usize {
    handle.0 as usize
}

fn current_std_handles() -> StdHandles {
    StdHandles {
        input: raw(std_handle(STD_INPUT_HANDLE)),
        output: raw(std_handle(STD_OUTPUT_HANDLE)),
        error: raw(std_handle(STD_ERROR_HANDLE)),
    }
}

fn close(handle: HANDLE, what: &str) {
    if let Err(e) = unsafe { CloseHandle(handle) } {
        log::warn!("Failed to close {what}: {e}");
    }
}

fn set_inherit(handle: HANDLE, inherit: bool) -> windows::core::Result<()> {
    let flags = if inherit { HANDLE_FLAG_INHERIT } else { HANDLE_FLAGS(0) };
    unsafe { SetHandleInformation(handle, HANDLE_FLAG_INHERIT.0, flags) }
}

/// Mark `handle` inheritable, skipping objects that cannot be inherited:
/// invalid or unknown handles, and console pseudo-handles.
fn make_inheritable(handle: HANDLE) -> windows::core::Result<()> {
    let file_type = unsafe { GetFileType(handle) };
    if file_type == FILE_TYPE_UNKNOWN || (file_type == FILE_TYPE_CHAR && raw(handle) & 3 != 0) {
        return Ok(());
    }
    set_inherit(handle, true)
}

fn duplicate_inheritable(
    source: HANDLE,
    stream: StdStream,
    variant: Variant,
) -> Result<HANDLE, LaunchError> {
    let process = unsafe { GetCurrentProcess() };
    let mut target = HANDLE::default();
    let result = unsafe {
        DuplicateHandle(process, source, process, &mut target, 0, true, DUPLICATE_SAME_ACCESS)
    };

    match result {
        Ok(()) => Ok(target),
        // A windowed launcher often has no usable standard handles at all.
        Err(_) if variant == Variant::Windowed => Ok(HANDLE::default()),
        Err(e) if e.code() == ERROR_INVALID_HANDLE.to_hresult() => Ok(HANDLE::default()),
        Err(e) => Err(LaunchError::HandleDuplicationFailed {
            stream: stream.name(),
            reason: e.to_string(),
        }),
    }
}

/// Point the child's startup info at our standard handles. Returns the
/// duplicates the launcher must close once the child has its own copies.
fn prepare_std_handles(
    config: &LauncherConfig,
    startup: &mut STARTUPINFOW,
) -> Result<Vec<HANDLE>, LaunchError> {
    if (startup.dwFlags & (STARTF_USEHOTKEY | STARTF_UNDOC_MONITOR)).0 != 0 {
        log::debug!("Startup info carries a hotkey or monitor; handles left alone");
        return Ok(Vec::new());
    }

    let input = std_handle(STD_INPUT_HANDLE);
    let output = std_handle(STD_OUTPUT_HANDLE);
    let error = std_handle(STD_ERROR_HANDLE);
    let mut duplicates = Vec::new();

    match config.handle_strategy {
        HandleStrategy::Duplicate => {
            startup.hStdInput = duplicate_inheritable(input, StdStream::Input, config.variant)?;
            startup.hStdOutput = duplicate_inheritable(output, StdStream::Output, config.variant)?;

            // The originals are dropped from our table. A handle shared with
            // stderr stays open.
            if raw(input) != raw(error) {
                unsafe {
                    let _ = CloseHandle(input);
                }
            }
            if raw(output) != raw(input) && raw(output) != raw(error) {
                unsafe {
                    let _ = CloseHandle(output);
                }
            }
            unsafe {
                let _ = SetStdHandle(STD_INPUT_HANDLE, HANDLE::default());
                let _ = SetStdHandle(STD_OUTPUT_HANDLE, HANDLE::default());
            }

            // stderr stays open for diagnostics, but only its duplicate may
            // reach the child.
            if let Err(e) = set_inherit(error, false) {
                log::warn!("Failed to mark stderr non-inheritable: {e}");
            }
            startup.hStdError = duplicate_inheritable(error, StdStream::Error, config.variant)?;

            duplicates.extend(
                [startup.hStdInput, startup.hStdOutput, startup.hStdError]
                    .into_iter()
                    .filter(|h| !h.is_invalid()),
            );
        }
        HandleStrategy::InheritInPlace => {
            for (handle, stream) in [
                (input, StdStream::Input),
                (output, StdStream::Output),
                (error, StdStream::Error),
            ] {
                if let Err(e) = make_inheritable(handle) {
                    log::warn!("Making {} inheritable failed: {e}", stream.name());
                }
            }
            startup.hStdInput = input;
            startup.hStdOutput = output;
            startup.hStdError = error;
        }
    }

    startup.dwFlags |= STARTF_USESTDHANDLES;
    log::debug!("Standard handles prepared ({:?})", config.handle_strategy);
    Ok(duplicates)
}

/// Release what the launcher no longer needs once the child is running:
/// inherited C runtime descriptors, stdin and stdout, and the working
/// directory. Runs at most once.
fn reclaim_after_spawn(startup: &STARTUPINFOW) {
    static RECLAIMED: Once = Once::new();
    RECLAIMED.call_once(|| {
        let std = current_std_handles();

        if startup.cbReserved2 > 0 && !startup.lpReserved2.is_null() {
            // SAFETY: the system guarantees lpReserved2 points at cbReserved2 bytes.
            let block = unsafe {
                std::slice::from_raw_parts(startup.lpReserved2, usize::from(startup.cbReserved2))
            };
            for handle in reclaim::inherited_descriptor_handles(block, &std) {
                close(HANDLE(handle as _), "inherited descriptor");
            }
        }

        for (stream, handle) in std.to_close() {
            close(HANDLE(handle as _), stream.name());
            let which = match stream {
                StdStream::Input => STD_INPUT_HANDLE,
                StdStream::Output => STD_OUTPUT_HANDLE,
                StdStream::Error => STD_ERROR_HANDLE,
            };
            if let Err(e) = unsafe { SetStdHandle(which, HANDLE::default()) } {
                log::warn!("Failed to clear {}: {e}", stream.name());
            }
        }

        let temp = env::temp_dir();
        if let Err(e) = env::set_current_dir(&temp) {
            log::warn!("Failed to change directory to {}: {e}", temp.display());
        }
    });
}

/// End the "app starting" cursor Explorer shows for a windowed launcher:
/// fetch a message, wait for the child to go idle, then create and pump a
/// message-only window so our own input-idle event fires.
fn clear_app_starting_state(process: HANDLE) {
    unsafe {
        let mut msg = MSG::default();
        let _ = PostMessageW(HWND::default(), 0, Default::default(), Default::default());
        let _ = GetMessageW(&mut msg, HWND::default(), 0, 0);
        let _ = WaitForInputIdle(process, INFINITE);

        match CreateWindowExW(
            WINDOW_EX_STYLE(0),
            w!("STATIC"),
            w!("ScriptLauncher"),
            WINDOW_STYLE(0),
            0,
            0,
            0,
            0,
            HWND_MESSAGE,
            HMENU::default(),
            HINSTANCE::default(),
            None,
        ) {
            Ok(hwnd) => {
                let _ = PeekMessageW(&mut msg, hwnd, 0, 0, PEEK_MESSAGE_REMOVE_TYPE(0));
                let _ = DestroyWindow(hwnd);
            }
            Err(e) => log::warn!("Failed to clear app-starting cursor: {e}"),
        }
    }
}

/// Spawns the child inside a job object and waits for it.
pub struct WindowsSupervisor<'a> {
    config: &'a LauncherConfig,
}

impl<'a> WindowsSupervisor<'a> {
    pub fn new(config: &'a LauncherConfig) -> Self {
        Self { config }
    }
}

impl Supervisor for WindowsSupervisor<'_> {
    fn caller_arguments(&self) -> OsString {
        // SAFETY: GetCommandLineW returns a NUL-terminated string that lives
        // as long as the process.
        let full = unsafe { GetCommandLineW() };
        let wide = unsafe { full.as_wide() };
        command::from_wide(command::caller_arguments(wide))
    }

    fn launch(&mut self, command_line: &OsStr) -> Result<u32, LaunchError> {
        if JOB.set(JobController::create()?).is_err() {
            return Err(LaunchError::JobConfigFailed("a job is already active".to_string()));
        }
        let job = JOB
            .get()
            .ok_or_else(|| LaunchError::JobConfigFailed("job was not stored".to_string()))?;

        let mut startup = STARTUPINFOW {
            cb: size_of::<STARTUPINFOW>() as u32,
            ..Default::default()
        };
        unsafe { GetStartupInfoW(&mut startup) };
        let duplicates = prepare_std_handles(self.config, &mut startup)?;

        let mut wide = command::to_wide(command_line);
        let mut child = PROCESS_INFORMATION::default();
        unsafe {
            CreateProcessW(
                PCWSTR::null(),
                PWSTR(wide.as_mut_ptr()),
                None,
                None,
                true,
                PROCESS_CREATION_FLAGS(0),
                None,
                PCWSTR::null(),
                &startup,
                &mut child,
            )
        }
        .map_err(|e| LaunchError::ProcessCreationFailed {
            command: command_line.to_string_lossy().into_owned(),
            reason: e.message().to_string(),
        })?;
        log::debug!("Spawned child process {}", child.dwProcessId);

        // Before anything else, so the child cannot exit outside the job.
        job.assign(child.hProcess);
        for handle in duplicates {
            close(handle, "duplicated handle");
        }
        reclaim_after_spawn(&startup);

        unsafe { SetConsoleCtrlHandler(Some(control_handler), true) }
            .map_err(|e| LaunchError::ControlHandlerFailed(e.to_string()))?;

        if self.config.variant == Variant::Windowed {
            clear_app_starting_state(child.hProcess);
        }

        close(child.hThread, "child thread handle");
        unsafe { WaitForSingleObject(child.hProcess, INFINITE) };

        let mut code = 0u32;
        unsafe { GetExitCodeProcess(child.hProcess, &mut code) }
            .map_err(|e| LaunchError::ExitCodeUnavailable(e.to_string()))?;
        close(child.hProcess, "child process handle");
        Ok(code)
    }
}

type MessageBoxTimeoutW =
    unsafe extern "system" fn(HWND, PCWSTR, PCWSTR, MESSAGEBOX_STYLE, u16, u32) -> MESSAGEBOX_RESULT;

fn wide_z(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Show a fatal error the way the build variant allows.
pub fn report_fatal(config: &LauncherConfig, err: &LaunchError) {
    match config.variant {
        Variant::Console => eprintln!("Fatal error in launcher: {err}"),
        Variant::Windowed => show_message_box(&err.to_string()),
    }
}

// MessageBoxTimeoutW is exported by user32 but not declared in the SDK
// headers, so it is looked up at run time. Without it the box waits for the user.
fn show_message_box(message: &str) {
    let text = wide_z(message);
    let title = wide_z(FATAL_TITLE);
    let style = MB_OK | MB_ICONERROR;

    unsafe {
        let timed = GetModuleHandleW(w!("user32.dll"))
            .ok()
            .and_then(|user32| GetProcAddress(user32, windows::core::s!("MessageBoxTimeoutW")));

        match timed {
            Some(proc) => {
                let message_box: MessageBoxTimeoutW = std::mem::transmute(proc);
                message_box(
                    HWND::default(),
                    PCWSTR(text.as_ptr()),
                    PCWSTR(title.as_ptr()),
                    style,
                    0,
                    MESSAGE_BOX_TIMEOUT_MS,
                );
            }
            None => {
                MessageBoxW(HWND::default(), PCWSTR(text.as_ptr()), PCWSTR(title.as_ptr()), style);
            }
        }
    }
}
