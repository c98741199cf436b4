//! Shared reconnect-with-backoff loop for line-oriented TCP door
//! controllers (RFID readers, generic fingerprint units, the realtime
//! streaming adapter). Each caller supplies a parser for its own wire
//! format; this module owns the socket lifecycle.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::model::RawHardwareEvent;

use super::sink::EventSink;
use super::AdapterError;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Connect to `addr`, read newline-delimited messages, hand each one to
/// `parse_line`, and forward whatever it returns to `events`. On
/// disconnect, reconnects with exponential backoff until `cancel` fires.
pub async fn run_reconnecting<F>(
    adapter_name: &str,
    addr: &str,
    events: EventSink,
    mut cancel: watch::Receiver<bool>,
    parse_line: F,
) -> Result<(), AdapterError>
where
    F: Fn(&str) -> Option<RawHardwareEvent>,
{
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if *cancel.borrow() {
            return Ok(());
        }

        let stream = tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() { return Ok(()); }
                continue;
            }
            connected = TcpStream::connect(addr) => connected,
        };

        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(adapter = adapter_name, error = %e, backoff_ms = backoff.as_millis(), "connect failed, retrying");
                if sleep_or_cancel(backoff, &mut cancel).await {
                    return Ok(());
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        backoff = INITIAL_BACKOFF;
        tracing::info!(adapter = adapter_name, addr, "connected");

        let mut lines = BufReader::new(stream).lines();
        loop {
            let next = tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() { return Ok(()); }
                    continue;
                }
                line = lines.next_line() => line,
            };

            match next {
                Ok(Some(raw)) => {
                    if let Some(event) = parse_line(&raw) {
                        events.push(event).await;
                    }
                }
                Ok(None) => {
                    tracing::warn!(adapter = adapter_name, "connection closed by peer");
                    break;
                }
                Err(e) => {
                    tracing::warn!(adapter = adapter_name, error = %e, "read error");
                    break;
                }
            }
        }
    }
}

/// Sleeps for `duration` unless cancellation fires first. Returns true
/// if cancellation fired.
async fn sleep_or_cancel(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancel.changed() => *cancel.borrow(),
    }
}
