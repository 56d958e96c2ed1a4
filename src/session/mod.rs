pub mod launch;
pub mod script;

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use self::launch::LaunchOptions;
use self::script::{first_data_value, screen_text, ScriptConnection};

/// Maximum attempts for connect-class operations.
const CONNECT_RETRIES: u32 = 10;

/// Maximum attempts for single-command operations.
const COMMAND_RETRIES: u32 = 3;

/// Delay between retry attempts.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Spawn readiness poll: attempts and interval.
const SPAWN_WAIT_ATTEMPTS: u32 = 15;
const SPAWN_WAIT_INTERVAL: Duration = Duration::from_millis(200);

/// Script port used when a session has none configured.
const DEFAULT_SCRIPT_PORT: &str = "5000";

/// Errors surfaced by an emulator session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("host must not be empty")]
    HostEmpty,

    #[error("shutdown requested")]
    ShutdownRequested,

    #[error("timed out waiting for emulator to connect to {host} after {attempts} attempts")]
    ConnectTimeout { host: String, attempts: u32 },

    #[error("failed to launch emulator")]
    Spawn(#[source] std::io::Error),

    /// Dial/read/write failure on the script port. Retried once with a
    /// fresh connection; never carries emulator semantics.
    #[error("script transport error: {0}")]
    Transport(String),

    /// The emulator answered with an `error` terminator.
    #[error("{0}")]
    Command(String),

    #[error("keyboard not unlocked, state was: {0}")]
    KeyboardLocked(String),

    #[error("invalid key {0}")]
    InvalidKey(String),

    #[error("maximum {0} retries reached")]
    RetriesExhausted(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub(crate) fn transport(message: String) -> Self {
        Self::Transport(message)
    }

    /// Whether this error is the distinguished shutdown outcome rather
    /// than a real failure.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::ShutdownRequested)
    }
}

/// A keyboard key the emulator can press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Enter,
    Tab,
    /// Program function key, 1..=24.
    Pf(u8),
}

impl Key {
    /// The script command for this key.
    pub fn command(self) -> Result<String, SessionError> {
        match self {
            Self::Enter => Ok("Enter".to_string()),
            Self::Tab => Ok("Tab".to_string()),
            Self::Pf(n) if (1..=24).contains(&n) => Ok(format!("PF({n})")),
            Self::Pf(n) => Err(SessionError::InvalidKey(format!("PF({n})"))),
        }
    }
}

/// One emulator session: a subprocess (when managed) plus a line-oriented
/// TCP connection to its script port.
///
/// A session is owned by exactly one worker; `&mut` receivers serialize
/// all command exchanges, so no two commands can overlap on one script
/// connection.
pub struct EmulatorSession {
    host: String,
    port: u16,
    script_port: String,

    conn: Option<ScriptConnection>,
    child: Option<tokio::process::Child>,

    launch: LaunchOptions,
    /// When false the emulator process is managed externally (tests, or
    /// an operator-run emulator) and connect only attaches to it.
    managed: bool,
    cancel: CancellationToken,
}

impl EmulatorSession {
    /// New managed session with no endpoint bound yet. Workers rebind it
    /// per job.
    pub fn new(launch: LaunchOptions, cancel: CancellationToken) -> Self {
        Self {
            host: String::new(),
            port: 0,
            script_port: String::new(),
            conn: None,
            child: None,
            launch,
            managed: true,
            cancel,
        }
    }

    /// Session attached to an already-running emulator on the given
    /// script port. No subprocess is spawned or killed.
    pub fn attached(
        host: &str,
        port: u16,
        script_port: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            script_port: script_port.into(),
            conn: None,
            child: None,
            launch: LaunchOptions::default(),
            managed: false,
            cancel,
        }
    }

    /// Point this session at a new host endpoint.
    pub fn rebind_host(&mut self, host: &str, port: u16) {
        self.host = host.to_string();
        self.port = port;
    }

    /// Move this session to a fresh script port. Attached sessions keep
    /// the fixed port of the emulator they were pointed at.
    pub fn rebind_script_port(&mut self, script_port: u16) {
        if self.managed {
            self.script_port = script_port.to_string();
        }
    }

    pub fn script_port(&self) -> &str {
        &self.script_port
    }

    fn hostname(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connect to the host: spawn the emulator if needed and wait until it
    /// reports a connection, retrying with fresh processes on failure.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if self.host.is_empty() {
            return Err(SessionError::HostEmpty);
        }
        if self.script_port.trim().is_empty() {
            warn!("script port not set, using default {DEFAULT_SCRIPT_PORT}");
            self.script_port = DEFAULT_SCRIPT_PORT.to_string();
        }

        let mut last: Option<SessionError> = None;
        for attempt in 1..=CONNECT_RETRIES {
            if self.cancel.is_cancelled() {
                return Err(SessionError::ShutdownRequested);
            }

            // Reset any lingering script connection before the next attempt.
            self.close_conn();

            match self.establish().await {
                Ok(()) => return Ok(()),
                Err(SessionError::ShutdownRequested) => {
                    return Err(SessionError::ShutdownRequested);
                }
                Err(e) => {
                    debug!(
                        host = %self.hostname(),
                        script_port = %self.script_port,
                        attempt,
                        error = %e,
                        "connect attempt failed",
                    );
                    last = Some(e);
                }
            }

            tokio::time::sleep(RETRY_DELAY).await;
        }

        let reason = last.map(|e| e.to_string()).unwrap_or_default();
        warn!(host = %self.hostname(), error = %reason, "giving up connecting");
        Err(SessionError::RetriesExhausted("connect"))
    }

    /// One connect attempt: ensure a subprocess exists, then poll the
    /// connection state until the emulator reports connected.
    async fn establish(&mut self) -> Result<(), SessionError> {
        if self.managed && !self.child_alive() {
            let binary = launch::resolve_binary(&self.launch)?;
            let child = launch::spawn_emulator(
                &binary,
                &self.script_port,
                self.launch.headless,
                &self.hostname(),
            )?;
            self.child = Some(child);
        }

        for _ in 0..SPAWN_WAIT_ATTEMPTS {
            if self.cancel.is_cancelled() {
                return Err(SessionError::ShutdownRequested);
            }
            if self.is_connected().await {
                return Ok(());
            }
            tokio::time::sleep(SPAWN_WAIT_INTERVAL).await;
        }

        // The emulator did not come up; make sure it does not linger and
        // hold the script port.
        self.kill_child();
        self.close_conn();
        Err(SessionError::ConnectTimeout {
            host: self.hostname(),
            attempts: SPAWN_WAIT_ATTEMPTS,
        })
    }

    fn child_alive(&mut self) -> bool {
        match &mut self.child {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn kill_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
        }
    }

    /// Whether the emulator reports an active host connection.
    pub async fn is_connected(&mut self) -> bool {
        match self.request("Query(ConnectionState)").await {
            Ok(lines) => first_data_value(&lines).is_some_and(|v| !v.is_empty()),
            Err(_) => false,
        }
    }

    /// Close the host session. Never fails: the emulator is allowed to be
    /// gone already.
    pub async fn disconnect(&mut self) {
        if self.conn.is_some() || self.child.is_some() {
            if self.is_connected().await {
                if let Err(e) = self.request("Quit").await {
                    debug!(error = %e, "quit command failed during disconnect");
                }
            }
        }
        self.close_conn();

        if let Some(mut child) = self.child.take() {
            tokio::spawn(async move {
                // Quit normally ends the process; force it after a grace.
                if tokio::time::timeout(Duration::from_secs(5), child.wait())
                    .await
                    .is_err()
                {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            });
        }
    }

    /// Fill the field at 1-based (row, column) with the given text. With
    /// both coordinates zero the text goes to the current cursor position.
    pub async fn fill_string(
        &mut self,
        row: u32,
        column: u32,
        text: &str,
    ) -> Result<(), SessionError> {
        if row > 0 && column > 0 {
            self.move_cursor(row, column).await?;
        }
        self.set_string(text).await
    }

    /// Type text at the current cursor position.
    pub async fn set_string(&mut self, text: &str) -> Result<(), SessionError> {
        let command = format!("String({text})");
        self.retry_command(&command, "SetString").await.map(|_| ())
    }

    async fn move_cursor(&mut self, row: u32, column: u32) -> Result<(), SessionError> {
        let command = format!(
            "MoveCursor({},{})",
            row.saturating_sub(1),
            column.saturating_sub(1),
        );
        self.retry_command(&command, "MoveCursor").await.map(|_| ())
    }

    /// Read `length` characters at 1-based (row, column), trimmed.
    pub async fn get_value(
        &mut self,
        row: u32,
        column: u32,
        length: u32,
    ) -> Result<String, SessionError> {
        let command = format!(
            "Ascii({},{},{length})",
            row.saturating_sub(1),
            column.saturating_sub(1),
        );
        let lines = self.retry_command(&command, "GetValue").await?;
        Ok(first_data_value(&lines).unwrap_or_default())
    }

    /// Press a keyboard key.
    pub async fn press(&mut self, key: Key) -> Result<(), SessionError> {
        let command = key.command()?;
        self.request(&command).await.map(|_| ())
    }

    /// Wait until the screen has an input field and the keyboard is
    /// unlocked.
    pub async fn wait_for_field(&mut self, timeout: Duration) -> Result<(), SessionError> {
        let command = format!("Wait({},InputField)", timeout.as_secs());

        for _ in 0..CONNECT_RETRIES {
            match self.request(&command).await {
                Ok(lines) => {
                    let output = lines.join("\n");
                    return match output.split_whitespace().next() {
                        None | Some("U") => Ok(()),
                        Some(state) => Err(SessionError::KeyboardLocked(state.to_string())),
                    };
                }
                Err(e) => {
                    debug!(error = %e, "wait for input field failed, retrying");
                }
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }

        Err(SessionError::RetriesExhausted("WaitForField"))
    }

    /// Number of rows on the saved screen image.
    pub async fn rows(&mut self) -> Result<u32, SessionError> {
        self.snap_number("Snap(Rows)", "GetRows").await
    }

    /// Number of columns on the saved screen image.
    pub async fn columns(&mut self) -> Result<u32, SessionError> {
        self.snap_number("Snap(Cols)", "GetColumns").await
    }

    async fn snap_number(&mut self, command: &str, op: &'static str) -> Result<u32, SessionError> {
        for _ in 0..COMMAND_RETRIES {
            if let Ok(lines) = self.request(command).await {
                if let Some(n) = first_data_value(&lines).and_then(|v| v.parse().ok()) {
                    return Ok(n);
                }
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }
        Err(SessionError::RetriesExhausted(op))
    }

    /// Current cursor position as reported by the emulator.
    pub async fn cursor_position(&mut self) -> Result<String, SessionError> {
        let lines = self.request("Query(cursor)").await?;
        Ok(first_data_value(&lines).unwrap_or_default())
    }

    /// Capture the whole screen and append it to the output file: raw text
    /// in API mode, an HTML `<pre>` block otherwise.
    pub async fn ascii_screen_grab(
        &mut self,
        path: &Path,
        api_mode: bool,
    ) -> Result<(), SessionError> {
        for _ in 0..CONNECT_RETRIES {
            match self.request("Ascii()").await {
                Ok(lines) => {
                    let screen = screen_text(&lines);
                    let content = if api_mode {
                        format!("{screen}\n")
                    } else {
                        format!("<pre>{screen}</pre>\n</body></html>")
                    };

                    let mut file = tokio::fs::OpenOptions::new()
                        .append(true)
                        .create(true)
                        .open(path)
                        .await?;
                    file.write_all(content.as_bytes()).await?;
                    return Ok(());
                }
                Err(e) => {
                    debug!(error = %e, "screen capture failed, retrying");
                }
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }

        Err(SessionError::RetriesExhausted("AsciiScreenGrab"))
    }

    /// Prepare the output file: truncate it in API mode, append an HTML
    /// preamble with the run timestamp otherwise.
    pub async fn initialize_output(
        &mut self,
        path: &Path,
        api_mode: bool,
    ) -> Result<(), SessionError> {
        if api_mode {
            tokio::fs::File::create(path).await?;
            return Ok(());
        }

        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let preamble = format!(
            concat!(
                "<html><head><title>ASCII Screen Capture</title>",
                "<style>body {{ font-family: 'Courier New', Courier, monospace; }} ",
                "pre {{ border: 1px solid #ccc; padding: 15px; }}</style></head><body>",
                "<h1>ASCII Screen Capture</h1>",
                "<p>Run Date and Time: {}</p>\n",
            ),
            now,
        );

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await?;
        file.write_all(preamble.as_bytes()).await?;
        Ok(())
    }

    /// Run one command with the command-level retry ladder.
    async fn retry_command(
        &mut self,
        command: &str,
        op: &'static str,
    ) -> Result<Vec<String>, SessionError> {
        for _ in 0..COMMAND_RETRIES {
            match self.request(command).await {
                Ok(lines) => return Ok(lines),
                Err(e) => {
                    debug!(command, error = %e, "command failed, retrying");
                }
            }
            tokio::time::sleep(RETRY_DELAY).await;
        }
        Err(SessionError::RetriesExhausted(op))
    }

    /// One request/response exchange with a single silent reconnect on
    /// transport faults. Semantic `error` responses are never retried
    /// here.
    async fn request(&mut self, command: &str) -> Result<Vec<String>, SessionError> {
        match self.exchange(command).await {
            Err(SessionError::Transport(first)) => {
                debug!(command, error = %first, "transport fault, redialing once");
                self.exchange(command).await
            }
            other => other,
        }
    }

    async fn exchange(&mut self, command: &str) -> Result<Vec<String>, SessionError> {
        if self.conn.is_none() {
            self.conn = Some(ScriptConnection::dial(&self.script_port).await?);
        }
        let conn = self.conn.as_mut().ok_or_else(|| {
            SessionError::transport("script connection not initialized".to_string())
        })?;

        let result = conn.exchange(command).await;
        if matches!(result, Err(SessionError::Transport(_))) {
            self.close_conn();
        }
        result
    }

    fn close_conn(&mut self) {
        self.conn = None;
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn test_key_commands() {
        assert_eq!(Key::Enter.command().expect("enter"), "Enter");
        assert_eq!(Key::Tab.command().expect("tab"), "Tab");
        assert_eq!(Key::Pf(7).command().expect("pf7"), "PF(7)");
        assert_eq!(Key::Pf(24).command().expect("pf24"), "PF(24)");
        assert!(matches!(
            Key::Pf(25).command(),
            Err(SessionError::InvalidKey(_)),
        ));
        assert!(matches!(
            Key::Pf(0).command(),
            Err(SessionError::InvalidKey(_)),
        ));
    }

    /// A script-port server that answers every command on every accepted
    /// connection, optionally dropping the first connection after one
    /// exchange.
    async fn serve(drop_first_after_one: bool) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            let mut first = true;
            loop {
                let Ok((sock, _)) = listener.accept().await else {
                    return;
                };
                let drop_early = drop_first_after_one && first;
                first = false;

                tokio::spawn(async move {
                    let mut reader = BufReader::new(sock);
                    let mut line = String::new();
                    let mut answered = 0usize;
                    loop {
                        line.clear();
                        match reader.read_line(&mut line).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {}
                        }
                        let response = if line.starts_with("Ascii(") {
                            "data: VALUE     \nU F U C(host)\nok\n"
                        } else if line.starts_with("Query(ConnectionState)") {
                            "data: host 127.0.0.1 3270\nU F U C(host)\nok\n"
                        } else {
                            "U F U C(host)\nok\n"
                        };
                        if reader
                            .get_mut()
                            .write_all(response.as_bytes())
                            .await
                            .is_err()
                        {
                            return;
                        }
                        answered += 1;
                        if drop_early && answered == 1 {
                            return; // Connection closes; next command hits EOF.
                        }
                    }
                });
            }
        });

        port
    }

    #[tokio::test]
    async fn test_get_value_trims_data_line() {
        let port = serve(false).await;
        let mut session =
            EmulatorSession::attached("127.0.0.1", 3270, port.to_string(), CancellationToken::new());

        let value = session.get_value(1, 2, 11).await.expect("get value");
        assert_eq!(value, "VALUE");
    }

    #[tokio::test]
    async fn test_transport_fault_recovers_with_one_redial() {
        let port = serve(true).await;
        let mut session =
            EmulatorSession::attached("127.0.0.1", 3270, port.to_string(), CancellationToken::new());

        // First command succeeds, then the server drops the connection.
        let first = session.get_value(1, 1, 5).await.expect("first command");
        assert_eq!(first, "VALUE");

        // Next command hits EOF on the stale connection and must succeed
        // via exactly one silent redial.
        let second = session.get_value(1, 1, 5).await.expect("second command");
        assert_eq!(second, "VALUE");
    }

    #[tokio::test]
    async fn test_connect_requires_host() {
        let mut session =
            EmulatorSession::attached("", 0, "9999", CancellationToken::new());
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::HostEmpty));
    }

    #[tokio::test]
    async fn test_connect_attached_reports_connected() {
        let port = serve(false).await;
        let mut session =
            EmulatorSession::attached("127.0.0.1", 3270, port.to_string(), CancellationToken::new());

        session.connect().await.expect("connect");
        assert!(session.is_connected().await);

        // Connect is idempotent against a healthy emulator.
        session.connect().await.expect("second connect");
    }

    #[tokio::test]
    async fn test_connect_shutdown_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut session = EmulatorSession::attached("127.0.0.1", 3270, "9999", cancel);

        let err = session.connect().await.unwrap_err();
        assert!(err.is_shutdown());
    }

    #[tokio::test]
    async fn test_disconnect_is_noop_when_never_connected() {
        let mut session =
            EmulatorSession::attached("127.0.0.1", 3270, "9999", CancellationToken::new());
        // Nothing to close; must not hang or panic.
        session.disconnect().await;
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_wait_for_field_parses_keyboard_state() {
        // Server whose status line reports a locked keyboard.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.expect("accept");
            let mut reader = BufReader::new(sock);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                if reader
                    .get_mut()
                    .write_all(b"L F U C(host)\nok\n")
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        let mut session =
            EmulatorSession::attached("127.0.0.1", 3270, port.to_string(), CancellationToken::new());
        let err = session
            .wait_for_field(Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            SessionError::KeyboardLocked(state) => assert_eq!(state, "L"),
            other => panic!("expected KeyboardLocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_initialize_output_and_screen_grab_modes() {
        let port = serve(false).await;
        let dir = tempfile::tempdir().expect("tempdir");
        let html = dir.path().join("out.html");
        let plain = dir.path().join("out.txt");

        let mut session =
            EmulatorSession::attached("127.0.0.1", 3270, port.to_string(), CancellationToken::new());

        session
            .initialize_output(&html, false)
            .await
            .expect("init html");
        session
            .ascii_screen_grab(&html, false)
            .await
            .expect("grab html");
        let html_body = std::fs::read_to_string(&html).expect("read html");
        assert!(html_body.contains("<h1>ASCII Screen Capture</h1>"));
        assert!(html_body.contains("<pre>VALUE"));

        session
            .initialize_output(&plain, true)
            .await
            .expect("init plain");
        session
            .ascii_screen_grab(&plain, true)
            .await
            .expect("grab plain");
        let plain_body = std::fs::read_to_string(&plain).expect("read plain");
        assert!(plain_body.starts_with("VALUE"));
        assert!(!plain_body.contains("<pre>"));
    }
}
