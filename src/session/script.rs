use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::SessionError;

/// Dial timeout for the script port.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline applied to each full request/response exchange.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// One line-oriented connection to an emulator's script port.
///
/// A request is a single command line; the response is zero or more
/// payload lines followed by a terminator line of `ok` or `error <msg>`.
/// Any I/O failure or missed deadline is a transport fault: the caller
/// must drop this connection and dial a fresh one.
#[derive(Debug)]
pub struct ScriptConnection {
    stream: BufReader<TcpStream>,
}

impl ScriptConnection {
    /// Dial the script port on loopback.
    pub async fn dial(script_port: &str) -> Result<Self, SessionError> {
        let addr = format!("127.0.0.1:{script_port}");
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| SessionError::transport(format!("dial {addr}: timed out")))?
            .map_err(|e| SessionError::transport(format!("dial {addr}: {e}")))?;

        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    /// Send one command and collect the response lines until a terminator.
    ///
    /// Returns the raw response lines (status lines included, `data:`
    /// prefixes intact). An `error <msg>` terminator surfaces as
    /// `SessionError::Command` and is not a transport fault.
    pub async fn exchange(&mut self, command: &str) -> Result<Vec<String>, SessionError> {
        tokio::time::timeout(EXCHANGE_TIMEOUT, self.exchange_inner(command))
            .await
            .map_err(|_| SessionError::transport(format!("{command}: exchange timed out")))?
    }

    async fn exchange_inner(&mut self, command: &str) -> Result<Vec<String>, SessionError> {
        let mut request = command.to_string();
        if !request.ends_with('\n') {
            request.push('\n');
        }

        self.stream
            .get_mut()
            .write_all(request.as_bytes())
            .await
            .map_err(|e| SessionError::transport(format!("write: {e}")))?;

        let mut lines = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            let n = self
                .stream
                .read_line(&mut line)
                .await
                .map_err(|e| SessionError::transport(format!("read: {e}")))?;
            if n == 0 {
                return Err(SessionError::transport("unexpected EOF".to_string()));
            }

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed == "ok" {
                return Ok(lines);
            }
            if let Some(rest) = trimmed.strip_prefix("error") {
                let msg = rest.trim();
                let msg = if msg.is_empty() {
                    "emulator reported an error"
                } else {
                    msg
                };
                return Err(SessionError::Command(msg.to_string()));
            }
            lines.push(trimmed.to_string());
        }
    }
}

/// The first `data:`-prefixed line with the prefix stripped and
/// surrounding whitespace trimmed.
pub fn first_data_value(lines: &[String]) -> Option<String> {
    lines.iter().find_map(|line| {
        line.trim()
            .strip_prefix("data:")
            .map(|rest| rest.trim().to_string())
    })
}

/// All `data:` lines with prefixes stripped, joined into screen text.
/// Lines without the prefix (status lines) are dropped.
pub fn screen_text(lines: &[String]) -> String {
    let rows: Vec<&str> = lines
        .iter()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();
    rows.join("\n")
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;

    async fn fake_port(responses: Vec<&'static str>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 512];
            for response in responses {
                let n = sock.read(&mut buf).await.expect("read");
                if n == 0 {
                    return;
                }
                sock.write_all(response.as_bytes()).await.expect("write");
            }
        });

        port
    }

    #[tokio::test]
    async fn test_exchange_collects_data_until_ok() {
        let port = fake_port(vec!["data: first\ndata: second\nU F U\nok\n"]).await;
        let mut conn = ScriptConnection::dial(&port.to_string())
            .await
            .expect("dial");

        let lines = conn.exchange("Ascii()").await.expect("exchange");
        assert_eq!(lines, ["data: first", "data: second", "U F U"]);
    }

    #[tokio::test]
    async fn test_exchange_error_terminator_is_command_failure() {
        let port = fake_port(vec!["error keyboard locked\n"]).await;
        let mut conn = ScriptConnection::dial(&port.to_string())
            .await
            .expect("dial");

        let err = conn.exchange("Enter").await.unwrap_err();
        match err {
            SessionError::Command(msg) => assert_eq!(msg, "keyboard locked"),
            other => panic!("expected Command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exchange_bare_error_gets_default_message() {
        let port = fake_port(vec!["error\n"]).await;
        let mut conn = ScriptConnection::dial(&port.to_string())
            .await
            .expect("dial");

        let err = conn.exchange("Enter").await.unwrap_err();
        match err {
            SessionError::Command(msg) => assert_eq!(msg, "emulator reported an error"),
            other => panic!("expected Command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exchange_eof_is_transport_fault() {
        let port = fake_port(vec![]).await;
        let mut conn = ScriptConnection::dial(&port.to_string())
            .await
            .expect("dial");

        let err = conn.exchange("Enter").await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_dial_refused_is_transport_fault() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let err = ScriptConnection::dial(&port.to_string()).await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)), "got {err:?}");
    }

    #[test]
    fn test_first_data_value() {
        let lines = vec![
            "U F U C(host) I 4 24 80".to_string(),
            "data: 24".to_string(),
        ];
        assert_eq!(first_data_value(&lines).as_deref(), Some("24"));
        assert_eq!(first_data_value(&[]), None);
    }

    #[test]
    fn test_screen_text_strips_prefixes_and_drops_status() {
        let lines = vec![
            "data: WELCOME TO THE SYSTEM".to_string(),
            "data:  USERID ===>".to_string(),
            "U F U C(host)".to_string(),
        ];
        assert_eq!(screen_text(&lines), "WELCOME TO THE SYSTEM\n USERID ===>");
    }
}
