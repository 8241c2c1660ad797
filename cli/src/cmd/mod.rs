pub mod send;
pub mod serve;

use anyhow::{Context, Result};
use scriptnet_sandbox::{Session, SessionOptions};
use std::path::Path;
use tracing::warn;

pub use send::handle_send_command;
pub use serve::handle_serve_command;

/// Load session options from a JSON file, or use the defaults.
pub fn load_options(path: Option<&Path>) -> Result<SessionOptions> {
    let Some(path) = path else {
        return Ok(SessionOptions::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read options file '{}'", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Invalid options file '{}'", path.display()))
}

/// Run a blocking session body while Ctrl-C interrupts its waits.
pub async fn run_interruptible<T, F>(session: Session, body: F) -> Result<T>
where
    F: FnOnce(Session) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let interrupter = session.interrupter();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            if let Err(err) = interrupter.interrupt() {
                warn!(error = %err, "failed to interrupt session");
            }
        }
    });

    let result = tokio::task::spawn_blocking(move || body(session))
        .await
        .context("Session task panicked")?;
    signal.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_options_default() {
        assert_eq!(load_options(None).unwrap(), SessionOptions::default());
    }

    #[test]
    fn test_load_options_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{ "label": "echo" }"#).unwrap();

        let options = load_options(Some(file.path())).unwrap();
        assert_eq!(options.label, "echo");
        assert_eq!(options.default_read_len, 1);
    }

    #[test]
    fn test_load_options_missing() {
        let err = load_options(Some(Path::new("/nonexistent/scriptnet.json"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read options file"));
    }
}
