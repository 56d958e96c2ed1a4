use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use tracing::warn;

use crate::config::{Step, StepKind};
use crate::session::{EmulatorSession, Key};

use super::StepError;

/// Placeholder replaced by the configured token value.
const TOKEN_PLACEHOLDER: &str = "{{token}}";

/// Warned once per process when a placeholder is found without a token.
static TOKEN_WARNING: Once = Once::new();

/// Ambient inputs each step may need besides the session.
pub struct StepContext<'a> {
    /// Sink for captured screens.
    pub output_path: &'a Path,
    /// Token substituted for `{{token}}` in step text.
    pub token: Option<&'a str>,
    /// Plain-text output instead of HTML wrapping.
    pub api_mode: bool,
}

/// Substitute the token placeholder in step text. Missing tokens leave
/// the text untouched and warn exactly once per process.
pub fn resolve_token(text: &str, token: Option<&str>) -> String {
    if !text.contains(TOKEN_PLACEHOLDER) {
        return text.to_string();
    }

    match token {
        Some(value) if !value.is_empty() => text.replace(TOKEN_PLACEHOLDER, value),
        _ => {
            TOKEN_WARNING.call_once(|| {
                warn!("{{{{token}}}} placeholder found in workflow text, but no token value was supplied");
            });
            text.to_string()
        }
    }
}

/// Execute one workflow step against the session.
pub async fn execute_step(
    session: &mut EmulatorSession,
    step: &Step,
    ctx: &StepContext<'_>,
) -> Result<(), StepError> {
    match step.kind {
        StepKind::Connect => session.connect().await.map_err(StepError::from),

        StepKind::Disconnect => {
            // The emulator is allowed to be gone already.
            session.disconnect().await;
            Ok(())
        }

        StepKind::FillString => {
            let text = resolve_token(&step.text, ctx.token);
            let c = step.coordinates;
            if c.row == 0 && c.column == 0 {
                session.set_string(&text).await?;
            } else {
                session.fill_string(c.row, c.column, &text).await?;
            }
            Ok(())
        }

        StepKind::CheckValue => {
            let expected = resolve_token(&step.text, ctx.token);
            let c = step.coordinates;
            let found = session.get_value(c.row, c.column, c.length).await?;
            let found = found.trim();
            if found != expected.trim() {
                return Err(StepError::CheckMismatch {
                    expected,
                    found: found.to_string(),
                });
            }
            Ok(())
        }

        StepKind::AsciiScreenGrab => {
            session
                .ascii_screen_grab(ctx.output_path, ctx.api_mode)
                .await
                .map_err(StepError::from)
        }

        StepKind::InitializeOutput => {
            session
                .initialize_output(ctx.output_path, ctx.api_mode)
                .await
                .map_err(StepError::from)
        }

        StepKind::WaitForField => {
            let timeout = if step.delay > 0.0 {
                Duration::from_secs_f64(step.delay)
            } else {
                Duration::from_secs(1)
            };
            session.wait_for_field(timeout).await.map_err(StepError::from)
        }

        StepKind::PressEnter => session.press(Key::Enter).await.map_err(StepError::from),
        StepKind::PressTab => session.press(Key::Tab).await.map_err(StepError::from),
        StepKind::PressPf(n) => session.press(Key::Pf(n)).await.map_err(StepError::from),

        StepKind::HumanDelay => {
            if step.delay <= 0.0 {
                return Err(StepError::HumanDelayWithoutDelay);
            }
            tokio::time::sleep(Duration::from_secs_f64(step.delay)).await;
            Ok(())
        }
    }
}
