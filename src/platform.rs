//! Operating-system seam: launching, probing and stopping processes, opening
//! their memory, and injecting input.
//!
//! Everything above this module talks to processes through [`Platform`], so
//! the orchestration logic runs unchanged against the native implementation
//! or a scripted fake.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::memory::source::open_native;
use crate::memory::MemorySource;
use crate::{AppError, Result};

// ── Input ─────────────────────────────────────────────────────────────────────

/// Keys the login and chat flows press.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    /// Return.
    Enter,
    /// Escape.
    Escape,
    /// Tab.
    Tab,
    /// Arrow down.
    Down,
    /// Arrow up.
    Up,
    /// Forward delete.
    Delete,
    /// Backspace.
    Backspace,
    /// Letter A.
    A,
    /// Control modifier.
    Control,
    /// Shift modifier.
    Shift,
}

impl Key {
    /// X keysym name.
    #[must_use]
    pub fn keysym(self) -> &'static str {
        match self {
            Self::Enter => "Return",
            Self::Escape => "Escape",
            Self::Tab => "Tab",
            Self::Down => "Down",
            Self::Up => "Up",
            Self::Delete => "Delete",
            Self::Backspace => "BackSpace",
            Self::A => "a",
            Self::Control => "ctrl",
            Self::Shift => "shift",
        }
    }
}

/// Future returned by [`InputInjector`] methods.
pub type InputFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Keyboard and mouse injection into one target window.
pub trait InputInjector: Send + Sync {
    /// Press and release `key`.
    ///
    /// # Errors
    ///
    /// Injection failure.
    fn send_key(&self, key: Key) -> InputFuture<'_>;

    /// Press `key` while holding `modifiers`.
    ///
    /// # Errors
    ///
    /// Injection failure.
    fn send_key_combination<'a>(&'a self, key: Key, modifiers: &'a [Key]) -> InputFuture<'a>;

    /// Type printable text (no control characters).
    ///
    /// # Errors
    ///
    /// Injection failure.
    fn send_string<'a>(&'a self, text: &'a str) -> InputFuture<'a>;

    /// Left-click at window coordinates.
    ///
    /// # Errors
    ///
    /// Injection failure.
    fn click_at(&self, x: i32, y: i32) -> InputFuture<'_>;
}

/// Which input injector the native platform hands out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputBackend {
    /// No injection; every call fails.
    #[default]
    None,
    /// Drive the target's X11 window with `xdotool`.
    Xdotool,
}

/// Injector used when no backend is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInput;

impl NoInput {
    fn refuse(what: &'static str) -> InputFuture<'static> {
        Box::pin(std::future::ready(Err(AppError::Config(format!(
            "cannot {what}: no input backend configured"
        )))))
    }
}

impl InputInjector for NoInput {
    fn send_key(&self, _key: Key) -> InputFuture<'_> {
        Self::refuse("send key")
    }

    fn send_key_combination<'a>(&'a self, _key: Key, _modifiers: &'a [Key]) -> InputFuture<'a> {
        Self::refuse("send key combination")
    }

    fn send_string<'a>(&'a self, _text: &'a str) -> InputFuture<'a> {
        Self::refuse("send string")
    }

    fn click_at(&self, _x: i32, _y: i32) -> InputFuture<'_> {
        Self::refuse("click")
    }
}

/// `xdotool`-backed injector targeting the first window owned by `pid`.
///
/// Every call spawns `xdotool` through `tokio::process` and awaits it.
#[derive(Debug, Clone, Copy)]
pub struct XdoInput {
    pid: u32,
}

impl XdoInput {
    /// Injector for the windows of `pid`.
    #[must_use]
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    /// First window id owned by the process, if any.
    pub async fn window(pid: u32) -> Option<String> {
        let output = Command::new("xdotool")
            .args(["search", "--pid", &pid.to_string()])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(str::to_owned)
    }

    async fn run(&self, command: &str, args: &[&str]) -> Result<()> {
        let window = Self::window(self.pid).await.ok_or_else(|| {
            AppError::ProcessUnavailable(format!("pid {} has no window", self.pid))
        })?;
        let status = Command::new("xdotool")
            .arg(command)
            .args(["--window", &window])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|err| AppError::Io(format!("failed to run xdotool: {err}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(AppError::Io(format!("xdotool {command} exited with {status}")))
        }
    }
}

impl InputInjector for XdoInput {
    fn send_key(&self, key: Key) -> InputFuture<'_> {
        Box::pin(async move { self.run("key", &[key.keysym()]).await })
    }

    fn send_key_combination<'a>(&'a self, key: Key, modifiers: &'a [Key]) -> InputFuture<'a> {
        Box::pin(async move {
            let chord = modifiers
                .iter()
                .map(|m| m.keysym())
                .chain(std::iter::once(key.keysym()))
                .collect::<Vec<_>>()
                .join("+");
            self.run("key", &[&chord]).await
        })
    }

    fn send_string<'a>(&'a self, text: &'a str) -> InputFuture<'a> {
        Box::pin(async move { self.run("type", &["--", text]).await })
    }

    fn click_at(&self, x: i32, y: i32) -> InputFuture<'_> {
        Box::pin(async move {
            let (x, y) = (x.to_string(), y.to_string());
            self.run("mousemove", &[&x, &y, "click", "1"]).await
        })
    }
}

// ── Processes ─────────────────────────────────────────────────────────────────

/// What to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable path.
    pub program: PathBuf,
    /// Arguments in order.
    pub args: Vec<String>,
}

impl LaunchSpec {
    /// Launch `program` with `args`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// The executable's directory, which is where it is started.
    #[must_use]
    pub fn working_dir(&self) -> &Path {
        self.program
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }
}

/// Process-level operations the orchestrator needs.
pub trait Platform: Send + Sync {
    /// Start a process and return its pid.
    ///
    /// # Errors
    ///
    /// [`AppError::Io`] if the process cannot be started.
    fn launch(&self, spec: &LaunchSpec) -> Result<u32>;

    /// Whether `pid` is still running.
    fn is_alive(&self, pid: u32) -> bool;

    /// Whether `pid` has shown its main window yet.
    fn has_main_window(&self, pid: u32) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;

    /// Ask the process to close gracefully.
    ///
    /// # Errors
    ///
    /// Signalling failure.
    fn close_main_window(&self, pid: u32) -> Result<()>;

    /// Terminate the process immediately.
    ///
    /// # Errors
    ///
    /// Signalling failure.
    fn kill(&self, pid: u32) -> Result<()>;

    /// Open the process's memory.
    ///
    /// # Errors
    ///
    /// [`AppError::ProcessUnavailable`] when it cannot be opened.
    fn open_memory(&self, pid: u32) -> Result<Arc<dyn MemorySource>>;

    /// Input injector bound to the process's window.
    fn input(&self, pid: u32) -> Arc<dyn InputInjector>;
}

/// The real operating system.
///
/// Children launched here are tracked so they can be reaped; processes
/// started elsewhere are probed by pid.
#[derive(Debug, Default)]
pub struct NativePlatform {
    children: Mutex<HashMap<u32, Child>>,
    input: InputBackend,
}

impl NativePlatform {
    /// Native platform using `input` for injection.
    #[must_use]
    pub fn new(input: InputBackend) -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
            input,
        }
    }

    fn children(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Child>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(unix)]
    fn signal(pid: u32, signal: Option<nix::sys::signal::Signal>) -> Result<()> {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let raw = i32::try_from(pid)
            .map_err(|_| AppError::InvalidArgument(format!("pid {pid} out of range")))?;
        kill(Pid::from_raw(raw), signal)
            .map_err(|err| AppError::Io(format!("failed to signal pid {pid}: {err}")))
    }
}

impl Platform for NativePlatform {
    fn launch(&self, spec: &LaunchSpec) -> Result<u32> {
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(spec.working_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                AppError::Io(format!("failed to launch {}: {err}", spec.program.display()))
            })?;
        let pid = child
            .id()
            .ok_or_else(|| AppError::Io("launched process exited immediately".into()))?;

        info!(pid, program = %spec.program.display(), "process launched");
        self.children().insert(pid, child);
        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let mut children = self.children();
        if let Some(child) = children.get_mut(&pid) {
            return match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    debug!(pid, %status, "child exited");
                    children.remove(&pid);
                    false
                }
                Err(err) => {
                    warn!(pid, %err, "failed to poll child status");
                    children.remove(&pid);
                    false
                }
            };
        }
        drop(children);

        #[cfg(unix)]
        {
            Self::signal(pid, None).is_ok()
        }
        #[cfg(not(unix))]
        {
            false
        }
    }

    fn has_main_window(&self, pid: u32) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            if !self.is_alive(pid) {
                return false;
            }
            match self.input {
                InputBackend::Xdotool => XdoInput::window(pid).await.is_some(),
                // Without a window system probe a live process is as far as we can tell.
                InputBackend::None => true,
            }
        })
    }

    fn close_main_window(&self, pid: u32) -> Result<()> {
        #[cfg(unix)]
        {
            Self::signal(pid, Some(nix::sys::signal::Signal::SIGTERM))
        }
        #[cfg(not(unix))]
        {
            self.kill(pid)
        }
    }

    fn kill(&self, pid: u32) -> Result<()> {
        if let Some(child) = self.children().get_mut(&pid) {
            return child
                .start_kill()
                .map_err(|err| AppError::Io(format!("failed to kill pid {pid}: {err}")));
        }

        #[cfg(unix)]
        {
            Self::signal(pid, Some(nix::sys::signal::Signal::SIGKILL))
        }
        #[cfg(not(unix))]
        {
            Err(AppError::ProcessUnavailable(format!(
                "pid {pid} was not launched by this host"
            )))
        }
    }

    fn open_memory(&self, pid: u32) -> Result<Arc<dyn MemorySource>> {
        open_native(pid)
    }

    fn input(&self, pid: u32) -> Arc<dyn InputInjector> {
        match self.input {
            InputBackend::None => Arc::new(NoInput),
            InputBackend::Xdotool => Arc::new(XdoInput::new(pid)),
        }
    }
}
