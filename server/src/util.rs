use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;

/// Current unix time in whole seconds.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Current unix time in fractional seconds (for sub-second latency timing).
pub fn now_ts_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Round to one decimal for JSON presentation.
pub fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Bind a TCP listener, walking up to `attempts` adjacent ports when the
/// requested one is taken. Returns the listener and the port that stuck.
pub async fn bind_with_fallback(
    host: &str,
    port: u16,
    attempts: u16,
) -> std::io::Result<(tokio::net::TcpListener, u16)> {
    let mut last_err = None;
    for offset in 0..attempts {
        let candidate = port + offset;
        match tokio::net::TcpListener::bind((host, candidate)).await {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                if offset > 0 {
                    tracing::warn!("port {port} busy, bound {bound} instead");
                }
                return Ok((listener, bound));
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::other("no ports attempted")))
}
