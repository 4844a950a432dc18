//! Per-container output buffer with live subscriptions.

use std::collections::VecDeque;
use std::pin::Pin;

use dockyard_core::log::{LogLine, LogStreamKind};
use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::log::RotatingWriter;

/// Output lines of a container, oldest first.
pub type LogStream = Pin<Box<dyn Stream<Item = LogLine> + Send>>;

/// Live subscribers may fall this far behind before lines are skipped.
const LIVE_CAPACITY: usize = 1024;

struct Inner {
    history: VecDeque<LogLine>,
    live: Option<broadcast::Sender<LogLine>>,
    writer: Option<RotatingWriter>,
}

/// Bounded history of a container's output plus a fan-out to followers.
///
/// History and subscription are taken under one lock, so a follower sees
/// every line exactly once.
pub struct LogBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl LogBuffer {
    pub fn new(capacity: usize, writer: Option<RotatingWriter>) -> Self {
        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                history: VecDeque::new(),
                live: Some(live),
                writer,
            }),
        }
    }

    /// Record a line of output.
    pub fn push(&self, stream: LogStreamKind, line: String) {
        let line = LogLine {
            stream,
            line,
            time: chrono::Utc::now(),
        };

        let mut inner = self.inner.lock();
        if let Some(writer) = inner.writer.as_mut() {
            if let Err(e) = writer.write_entry(&line) {
                tracing::warn!(error = %e, "Failed to write container log; disabling log file");
                inner.writer = None;
            }
        }
        if inner.history.len() == self.capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(line.clone());
        if let Some(live) = &inner.live {
            let _ = live.send(line);
        }
    }

    /// Buffered lines, oldest first.
    pub fn history(&self) -> Vec<LogLine> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// History, followed by live lines when `follow` is set.
    ///
    /// A following stream ends when the buffer is closed. Dropping it has
    /// no effect on the container.
    pub fn stream(&self, follow: bool) -> LogStream {
        let inner = self.inner.lock();
        let history: Vec<LogLine> = inner.history.iter().cloned().collect();
        let live = match (&inner.live, follow) {
            (Some(live), true) => Some(live.subscribe()),
            _ => None,
        };
        drop(inner);

        let history = stream::iter(history);
        match live {
            None => history.boxed(),
            Some(receiver) => history
                .chain(BroadcastStream::new(receiver).filter_map(|item| async move {
                    match item {
                        Ok(line) => Some(line),
                        Err(lagged) => {
                            tracing::warn!(error = %lagged, "Log follower lagged");
                            None
                        }
                    }
                }))
                .boxed(),
        }
    }

    /// End all following streams. Later pushes are kept in history only.
    pub fn close(&self) {
        self.inner.lock().live = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[LogLine]) -> Vec<&str> {
        items.iter().map(|l| l.line.as_str()).collect()
    }

    #[tokio::test]
    async fn test_history_is_finite() {
        let buffer = LogBuffer::new(10, None);
        buffer.push(LogStreamKind::Stdout, "one".to_string());
        buffer.push(LogStreamKind::Stderr, "two".to_string());

        let collected: Vec<LogLine> = buffer.stream(false).collect().await;
        assert_eq!(lines(&collected), vec!["one", "two"]);
        assert_eq!(collected[1].stream, LogStreamKind::Stderr);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let buffer = LogBuffer::new(2, None);
        for i in 0..5 {
            buffer.push(LogStreamKind::Stdout, format!("line {}", i));
        }
        assert_eq!(lines(&buffer.history()), vec!["line 3", "line 4"]);
    }

    #[tokio::test]
    async fn test_follow_receives_live_lines() {
        let buffer = LogBuffer::new(10, None);
        buffer.push(LogStreamKind::Stdout, "before".to_string());

        let mut stream = buffer.stream(true);
        buffer.push(LogStreamKind::Stdout, "after".to_string());

        assert_eq!(stream.next().await.unwrap().line, "before");
        assert_eq!(stream.next().await.unwrap().line, "after");
    }

    #[tokio::test]
    async fn test_close_ends_followers() {
        let buffer = LogBuffer::new(10, None);
        let stream = buffer.stream(true);
        buffer.push(LogStreamKind::Stdout, "last".to_string());
        buffer.close();

        let collected: Vec<LogLine> = stream.collect().await;
        assert_eq!(lines(&collected), vec!["last"]);
    }

    #[tokio::test]
    async fn test_dropped_follower_does_not_block() {
        let buffer = LogBuffer::new(10, None);
        drop(buffer.stream(true));
        for i in 0..(LIVE_CAPACITY * 2) {
            buffer.push(LogStreamKind::Stdout, format!("{}", i));
        }
        assert_eq!(buffer.history().len(), 10);
    }
}
