//! Console Relay - merges a server's stdout/stderr into one ordered stream
//!
//! - One reader task per raw channel feeds a single merge channel
//! - A single delivery task stamps each line (sequence + timestamp) in arrival order
//! - Lines land in a bounded ring buffer for polling and are broadcast to subscribers
//! - A lagging subscriber never blocks the producer or other subscribers

pub mod history;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::utils::current_timestamp;

/// Default number of lines kept for polling clients.
pub const DEFAULT_BUFFER_LINES: usize = 2_000;
const BROADCAST_CAPACITY: usize = 2_048;
const MERGE_CAPACITY: usize = 1_024;

// ─── Line Types ──────────────────────────────────────────────

/// A single line of console output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsoleLine {
    /// Monotonic per-descriptor sequence number, assigned at merge time
    pub seq: u64,
    /// Unix timestamp (seconds) at arrival
    pub timestamp: u64,
    pub source: LineSource,
    /// Raw text, escape sequences included
    pub text: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LineSource {
    Stdout,
    Stderr,
    /// Notices from the daemon itself
    System,
    /// Replayed from the server's log file after reattachment
    History,
}

/// Events seen by relay subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Line(ConsoleLine),
    /// The attached process terminated; run state has already been cleared.
    Exited { pid: u32, code: Option<i32> },
}

// ─── Line Buffer ─────────────────────────────────────────────

/// Ring buffer that stores recent lines and hands out sequence numbers.
struct LineBuffer {
    lines: VecDeque<ConsoleLine>,
    next_seq: u64,
    max_size: usize,
}

impl LineBuffer {
    fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            lines: VecDeque::with_capacity(max_size.min(DEFAULT_BUFFER_LINES)),
            next_seq: 1,
            max_size,
        }
    }

    fn push(&mut self, source: LineSource, text: String) -> ConsoleLine {
        let line = ConsoleLine {
            seq: self.next_seq,
            timestamp: current_timestamp(),
            source,
            text,
        };
        self.next_seq += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    /// All lines with seq > `since` (for polling).
    fn get_since(&self, since: u64) -> Vec<ConsoleLine> {
        self.lines.iter().filter(|l| l.seq > since).cloned().collect()
    }

    /// The most recent `count` lines.
    fn get_recent(&self, count: usize) -> Vec<ConsoleLine> {
        let skip = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

// ─── Relay ───────────────────────────────────────────────────

/// Per-descriptor console relay. Outlives individual processes so sequence
/// numbers stay monotonic across restarts.
#[derive(Clone)]
pub struct ConsoleRelay {
    buffer: Arc<Mutex<LineBuffer>>,
    events: broadcast::Sender<RelayEvent>,
}

impl ConsoleRelay {
    pub fn new(buffer_lines: usize) -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            buffer: Arc::new(Mutex::new(LineBuffer::with_capacity(buffer_lines))),
            events,
        }
    }

    fn buffer(&self) -> MutexGuard<'_, LineBuffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to every line published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Stamp, store and broadcast one line. The buffer lock is held across
    /// the send so broadcast order always equals sequence order.
    pub fn publish(&self, source: LineSource, text: impl Into<String>) -> ConsoleLine {
        let mut buffer = self.buffer();
        let line = buffer.push(source, text.into());
        // 구독자가 없으면 send가 실패하지만 버퍼에는 남아 있음
        let _ = self.events.send(RelayEvent::Line(line.clone()));
        line
    }

    pub fn publish_system(&self, text: impl Into<String>) -> ConsoleLine {
        self.publish(LineSource::System, text)
    }

    pub fn notify_exit(&self, pid: u32, code: Option<i32>) {
        let _ = self.events.send(RelayEvent::Exited { pid, code });
    }

    pub fn since(&self, since: u64) -> Vec<ConsoleLine> {
        self.buffer().get_since(since)
    }

    pub fn recent(&self, count: usize) -> Vec<ConsoleLine> {
        self.buffer().get_recent(count)
    }

    pub fn clear(&self) {
        self.buffer().lines.clear();
    }

    /// Bind the relay to a process's raw output channels.
    ///
    /// Spawns one reader per channel plus a single delivery task; the returned
    /// handle completes once both channels reach EOF and every line is delivered.
    pub fn attach<O, E>(&self, stdout: Option<O>, stderr: Option<E>) -> JoinHandle<()>
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (merge_tx, mut merge_rx) = mpsc::channel::<(LineSource, String)>(MERGE_CAPACITY);

        if let Some(stdout) = stdout {
            spawn_reader(stdout, LineSource::Stdout, merge_tx.clone());
        }
        if let Some(stderr) = stderr {
            spawn_reader(stderr, LineSource::Stderr, merge_tx.clone());
        }
        drop(merge_tx);

        let relay = self.clone();
        tokio::spawn(async move {
            while let Some((source, text)) = merge_rx.recv().await {
                relay.publish(source, text);
            }
            tracing::debug!("Console relay drained: both output channels closed");
        })
    }

    /// Replay lines as history (reattachment without live streams).
    pub fn replay(&self, lines: Vec<String>) -> usize {
        let count = lines.len();
        for text in lines {
            self.publish(LineSource::History, text);
        }
        count
    }
}

impl Default for ConsoleRelay {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_LINES)
    }
}

fn spawn_reader<R>(reader: R, source: LineSource, tx: mpsc::Sender<(LineSource, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // 잘못된 UTF-8 바이트가 있어도 채널을 닫지 않고 계속 읽어야 파이프가 막히지 않음
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send((source, line)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("Console {:?} reader stopped: {}", source, e);
                    break;
                }
            }
        }
    });
}

// ─── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    async fn next_line(rx: &mut broadcast::Receiver<RelayEvent>) -> ConsoleLine {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("relay delivered nothing")
            .expect("relay channel closed");
        match event {
            RelayEvent::Line(line) => line,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_line_buffer_push_and_query() {
        let mut buffer = LineBuffer::with_capacity(10);
        buffer.push(LineSource::Stdout, "line 1".into());
        buffer.push(LineSource::Stdout, "line 2".into());
        buffer.push(LineSource::Stderr, "err 3".into());

        assert_eq!(buffer.lines.len(), 3);
        assert_eq!(buffer.get_since(1).len(), 2);
        assert_eq!(buffer.get_recent(2)[0].text, "line 2");
        assert_eq!(buffer.get_recent(100).len(), 3);
    }

    #[test]
    fn test_line_buffer_ring() {
        let mut buffer = LineBuffer::with_capacity(50);
        for i in 0..150 {
            buffer.push(LineSource::Stdout, format!("line {}", i));
        }
        assert_eq!(buffer.lines.len(), 50);
        assert_eq!(buffer.lines.front().unwrap().seq, 101);
        assert_eq!(buffer.lines.back().unwrap().seq, 150);
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_every_line() {
        let relay = ConsoleRelay::default();
        let mut a = relay.subscribe();
        let mut b = relay.subscribe();

        relay.publish(LineSource::Stdout, "hello");
        relay.publish_system("world");

        for rx in [&mut a, &mut b] {
            assert_eq!(next_line(rx).await.text, "hello");
            assert_eq!(next_line(rx).await.text, "world");
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_producer() {
        let relay = ConsoleRelay::new(16);
        // 절대 읽지 않는 구독자
        let _stalled = relay.subscribe();
        let mut live = relay.subscribe();

        for i in 0..(BROADCAST_CAPACITY + 10) {
            relay.publish(LineSource::Stdout, format!("{}", i));
        }
        // 생산자가 막히지 않고 끝까지 진행했어야 함
        assert_eq!(relay.recent(1)[0].text, format!("{}", BROADCAST_CAPACITY + 9));
        // 살아있는 구독자는 lag 보고 후 계속 수신
        assert!(matches!(live.recv().await, Err(broadcast::error::RecvError::Lagged(_))));
        assert!(live.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_attach_preserves_interleaved_arrival_order() {
        let relay = ConsoleRelay::default();
        let mut rx = relay.subscribe();

        let (mut out_w, out_r) = tokio::io::duplex(256);
        let (mut err_w, err_r) = tokio::io::duplex(256);
        let done = relay.attach(Some(out_r), Some(err_r));

        // 각 쓰기가 구독자에게 도달한 뒤 다음 채널에 쓰기
        let script: [(bool, &str); 5] = [
            (true, "out-1"),
            (false, "err-1"),
            (true, "out-2"),
            (false, "err-2"),
            (false, "err-3"),
        ];
        let mut seen = Vec::new();
        for (to_stdout, text) in script {
            let w = if to_stdout { &mut out_w } else { &mut err_w };
            w.write_all(format!("{}\n", text).as_bytes()).await.unwrap();
            let line = next_line(&mut rx).await;
            assert_eq!(
                line.source,
                if to_stdout { LineSource::Stdout } else { LineSource::Stderr }
            );
            seen.push(line);
        }

        let texts: Vec<_> = seen.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["out-1", "err-1", "out-2", "err-2", "err-3"]);
        assert!(seen.windows(2).all(|w| w[0].seq < w[1].seq));

        drop(out_w);
        drop(err_w);
        tokio::time::timeout(Duration::from_secs(5), done).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sequence_survives_reattach() {
        let relay = ConsoleRelay::default();
        relay.publish_system("first process");
        let (w, r) = tokio::io::duplex(64);
        drop(w);
        relay
            .attach::<_, tokio::io::DuplexStream>(Some(r), None)
            .await
            .unwrap();
        let line = relay.publish_system("second process");
        assert_eq!(line.seq, 2);
    }

    #[tokio::test]
    async fn test_clear_keeps_sequence_monotonic() {
        let relay = ConsoleRelay::default();
        relay.publish_system("a");
        relay.clear();
        assert!(relay.recent(10).is_empty());
        assert_eq!(relay.publish_system("b").seq, 2);
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_end_stream() {
        let relay = ConsoleRelay::default();
        let mut rx = relay.subscribe();
        let (mut w, r) = tokio::io::duplex(256);
        let done = relay.attach::<_, tokio::io::DuplexStream>(Some(r), None);

        w.write_all(b"caf\xe9\r\nafter-bad-byte\n").await.unwrap();
        assert_eq!(next_line(&mut rx).await.text, "caf\u{FFFD}");
        assert_eq!(next_line(&mut rx).await.text, "after-bad-byte");

        drop(w);
        tokio::time::timeout(Duration::from_secs(5), done).await.unwrap().unwrap();
        assert_eq!(relay.recent(10).len(), 2);
    }
}
