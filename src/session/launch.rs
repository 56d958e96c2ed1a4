use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use tokio::process::{Child, Command};
use tracing::debug;

use super::SessionError;

/// Terminal model announced to the host.
const MODEL_TYPE: &str = "3279-2";

/// How the emulator subprocess is selected and launched.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Run the headless scripting emulator instead of a windowed one.
    pub headless: bool,
    /// Explicit path to the emulator binary, bypassing the `PATH` search.
    pub emulator_path: Option<PathBuf>,
}

/// Resolved emulator binaries, cached per process.
static BINARY_CACHE: OnceLock<PathBuf> = OnceLock::new();

/// The platform binary name: `s3270` headless, `wc3270` on windows,
/// `x3270` elsewhere.
pub fn binary_name(headless: bool) -> &'static str {
    if headless {
        "s3270"
    } else if cfg!(windows) {
        "wc3270"
    } else {
        "x3270"
    }
}

/// Resolve the emulator binary path: explicit override first, then a
/// cached `PATH` search.
pub fn resolve_binary(opts: &LaunchOptions) -> Result<PathBuf, SessionError> {
    if let Some(path) = &opts.emulator_path {
        return Ok(path.clone());
    }

    if let Some(cached) = BINARY_CACHE.get() {
        return Ok(cached.clone());
    }

    let name = binary_name(opts.headless);
    let found = search_path(name).ok_or_else(|| {
        SessionError::Spawn(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("emulator binary {name} not found on PATH"),
        ))
    })?;

    Ok(BINARY_CACHE.get_or_init(|| found).clone())
}

fn search_path(name: &str) -> Option<PathBuf> {
    let file_name = if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    };

    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.is_file())
    })
}

/// Spawn an emulator subprocess bound to the given script port and host.
///
/// The argument order differs between the headless and windowed variants
/// and must stay as the underlying tool expects it.
pub fn spawn_emulator(
    binary: &Path,
    script_port: &str,
    headless: bool,
    host_port: &str,
) -> Result<Child, SessionError> {
    let resource = format!("{}.unlockDelay: False", binary_name(headless));

    let mut cmd = Command::new(binary);
    if headless {
        cmd.args(["-scriptport", script_port, "-xrm", &resource]);
    } else {
        cmd.args(["-xrm", &resource, "-scriptport", script_port]);
    }
    cmd.args(["-model", MODEL_TYPE, host_port])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    debug!(binary = %binary.display(), script_port, host_port, "spawning emulator");

    cmd.spawn().map_err(SessionError::Spawn)
}
