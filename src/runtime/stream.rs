use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc::UnboundedSender;

use super::WorkerStreamEvent;

/// Parse one stdout line into a protocol event. Lines that are not JSON are
/// surfaced as synthetic system events rather than dropped.
pub fn parse_line(line: &str) -> Value {
    serde_json::from_str(line).unwrap_or_else(|_| {
        json!({
            "type": "system",
            "content": line,
        })
    })
}

pub fn is_current(generations: &Mutex<HashMap<String, u64>>, session_id: &str, generation: u64) -> bool {
    generations.lock().get(session_id).copied() == Some(generation)
}

/// Pump stdout lines into the event channel, one event per non-empty line.
/// The loop exits as soon as it observes that its generation was superseded,
/// so a replaced process can never deliver stale events. The final
/// unterminated line, if any, is flushed before EOF.
pub async fn pump_lines<R: AsyncRead + Unpin>(
    reader: R,
    session_id: &str,
    generation: u64,
    generations: &Mutex<HashMap<String, u64>>,
    events: &UnboundedSender<WorkerStreamEvent>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !is_current(generations, session_id, generation) {
            return;
        }
        if line.trim().is_empty() {
            continue;
        }
        let _ = events.send(WorkerStreamEvent {
            session_id: session_id.to_string(),
            payload: parse_line(&line),
        });
    }
}

/// Pump stderr chunks as system events tagged with the stderr subtype.
pub async fn pump_stderr<R: AsyncRead + Unpin>(
    reader: R,
    session_id: &str,
    generation: u64,
    generations: &Mutex<HashMap<String, u64>>,
    events: &UnboundedSender<WorkerStreamEvent>,
) {
    let mut reader = reader;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if !is_current(generations, session_id, generation) {
                    return;
                }
                let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                let _ = events.send(WorkerStreamEvent {
                    session_id: session_id.to_string(),
                    payload: json!({
                        "type": "system",
                        "subtype": "stderr",
                        "content": chunk,
                    }),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn generations_for(session_id: &str, generation: u64) -> Mutex<HashMap<String, u64>> {
        let mut map = HashMap::new();
        map.insert(session_id.to_string(), generation);
        Mutex::new(map)
    }

    #[test]
    fn test_parse_line_json() {
        let event = parse_line(r#"{"type":"assistant","message":{"content":"hi"}}"#);
        assert_eq!(event["type"], "assistant");
    }

    #[test]
    fn test_parse_line_garbage_becomes_system_event() {
        let event = parse_line("warning: something odd");
        assert_eq!(event["type"], "system");
        assert_eq!(event["content"], "warning: something odd");
    }

    #[tokio::test]
    async fn test_pump_delivers_each_line() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let generations = generations_for("s-1", 1);
        let input: &[u8] = b"{\"type\":\"system\"}\n\nnot json\n";

        pump_lines(input, "s-1", 1, &generations, &tx).await;
        drop(tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload["type"], "system");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.payload["content"], "not json");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pump_flushes_unterminated_final_line() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let generations = generations_for("s-1", 1);
        let input: &[u8] = b"{\"type\":\"result\",\"subtype\":\"success\"}";

        pump_lines(input, "s-1", 1, &generations, &tx).await;
        drop(tx);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload["subtype"], "success");
    }

    #[tokio::test]
    async fn test_stale_generation_delivers_nothing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Current generation is 2; this pump runs as generation 1.
        let generations = generations_for("s-1", 2);
        let input: &[u8] = b"{\"type\":\"assistant\"}\n{\"type\":\"result\"}\n";

        pump_lines(input, "s-1", 1, &generations, &tx).await;
        drop(tx);

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stderr_chunks_tagged() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let generations = generations_for("s-1", 1);
        let input: &[u8] = b"permission denied";

        pump_stderr(input, "s-1", 1, &generations, &tx).await;
        drop(tx);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload["type"], "system");
        assert_eq!(event.payload["subtype"], "stderr");
        assert_eq!(event.payload["content"], "permission denied");
    }
}
