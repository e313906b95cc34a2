//! Shared HTTP agent, bounded JSON posting and retry helpers.

use std::io::{self, Read};
use std::sync::OnceLock;
use std::time::Duration;

use serde::Serialize;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry settings for network operations with exponential backoff.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RetryConfig {
    /// Maximum number of attempts, including the first try.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Failure of a single POST attempt.
#[derive(Debug, thiserror::Error)]
pub(crate) enum PostError {
    #[error("HTTP {0}")]
    Status(u16),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Failed to read response: {0}")]
    Body(#[from] io::Error),
}

impl PostError {
    /// Connection problems, throttling and server errors are worth another try.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            Self::Status(code) => *code == 429 || *code >= 500,
            Self::Transport(_) => true,
            Self::Body(_) => false,
        }
    }
}

/// Return a shared HTTP agent with consistent timeouts.
pub(crate) fn agent() -> &'static ureq::Agent {
    static AGENT: OnceLock<ureq::Agent> = OnceLock::new();
    AGENT.get_or_init(|| {
        ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .timeout_write(WRITE_TIMEOUT)
            .build()
    })
}

/// POST `payload` as JSON and return the (size-bounded) response body.
pub(crate) fn post_json<T: Serialize>(
    url: &str,
    payload: &T,
    max_response_bytes: usize,
) -> Result<Vec<u8>, PostError> {
    match agent().post(url).send_json(payload) {
        Ok(response) => Ok(read_response_bytes(response, max_response_bytes)?),
        Err(ureq::Error::Status(code, _)) => Err(PostError::Status(code)),
        Err(ureq::Error::Transport(err)) => Err(PostError::Transport(err.to_string())),
    }
}

/// Retry an operation with bounded exponential backoff when the predicate allows it.
pub(crate) fn retry_with_backoff<T, E, F, R>(
    config: RetryConfig,
    mut action: F,
    mut should_retry: R,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    R: FnMut(&E) -> bool,
{
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        match action() {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= config.max_attempts || !should_retry(&err) {
                    return Err(err);
                }
                std::thread::sleep(backoff_delay(config.base_delay, config.max_delay, attempt));
            }
        }
    }
}

/// Read a response into memory, enforcing a maximum byte size.
fn read_response_bytes(response: ureq::Response, max_bytes: usize) -> Result<Vec<u8>, io::Error> {
    if let Some(length) = response
        .header("Content-Length")
        .and_then(|value| value.parse::<u64>().ok())
        && length > max_bytes as u64
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Response too large: {length} bytes"),
        ));
    }
    let mut limited = response.into_reader().take(max_bytes as u64 + 1);
    let mut bytes = Vec::new();
    limited.read_to_end(&mut bytes)?;
    if bytes.len() > max_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Response exceeded {max_bytes} bytes"),
        ));
    }
    Ok(bytes)
}

fn backoff_delay(base: Duration, max: Duration, attempt: usize) -> Duration {
    let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    /// Answer one request with `response` and hand back what was received.
    fn serve_once(response: &'static str) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                let read = stream.read(&mut buf).unwrap_or(0);
                let _ = tx.send(String::from_utf8_lossy(&buf[..read]).to_string());
                let _ = stream.write_all(response.as_bytes());
            }
        });
        (format!("http://{addr}/updates"), rx)
    }

    #[test]
    fn post_json_sends_body_and_reads_reply() {
        let (url, received) = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
        let body = post_json(&url, &serde_json::json!({ "sample_count": 3 }), 16).unwrap();
        assert_eq!(body, b"ok");
        let request = received.recv().unwrap();
        assert!(request.starts_with("POST /updates"));
        assert!(request.contains("application/json"));
    }

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        let (url, _rx) = serve_once("HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n");
        let err = post_json(&url, &1u8, 16).unwrap_err();
        assert!(matches!(err, PostError::Status(503)));
        assert!(err.is_transient());
        assert!(!PostError::Status(400).is_transient());
        assert!(PostError::Status(429).is_transient());
    }

    #[test]
    fn oversized_reply_is_rejected() {
        let (url, _rx) = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nok");
        let err = post_json(&url, &1u8, 10).unwrap_err();
        assert!(matches!(err, PostError::Body(_)));
    }

    #[test]
    fn retry_with_backoff_stops_after_success() {
        let mut attempts = 0usize;
        let config = RetryConfig {
            max_attempts: 4,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        let result: Result<u32, &'static str> = retry_with_backoff(
            config,
            || {
                attempts += 1;
                if attempts < 3 { Err("fail") } else { Ok(7) }
            },
            |_| true,
        );
        assert_eq!(result, Ok(7));
        assert_eq!(attempts, 3);
    }

    #[test]
    fn retry_with_backoff_honors_should_retry() {
        let mut attempts = 0usize;
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        let result: Result<u32, &'static str> = retry_with_backoff(
            config,
            || {
                attempts += 1;
                Err("fail")
            },
            |_| false,
        );
        assert_eq!(result, Err("fail"));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(350);
        assert_eq!(backoff_delay(base, max, 1), base);
        assert_eq!(backoff_delay(base, max, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, max, 3), max);
        assert_eq!(backoff_delay(base, max, 80), max);
    }
}
