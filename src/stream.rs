//! Broadcast stream of a job's combined stdout/stderr output.
//!
//! A `Stream` holds every line a job has ever produced. Each `Subscription`
//! replays that history from the start and then blocks for new lines, so a
//! subscriber created after a job has finished still sees the full output.

use std::sync::{Arc, Condvar, Mutex};
use std::time::SystemTime;

use crate::error::{Error, Result};

/// Maximum number of bytes carried by a single `Line` (see job.rs's pump
/// loop, which reads pipes in chunks of this size).
pub const MAX_LINE_BYTES: usize = 1024;

/// Which pipe a line of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Output,
    Error,
}

/// One chunk of output, tagged with its origin and the time it was observed.
#[derive(Debug, Clone)]
pub struct Line {
    pub timestamp: SystemTime,
    pub channel: Channel,
    pub bytes: Vec<u8>,
}

impl Line {
    pub fn new(channel: Channel, bytes: Vec<u8>) -> Self {
        debug_assert!(bytes.len() <= MAX_LINE_BYTES);
        Line {
            timestamp: SystemTime::now(),
            channel,
            bytes,
        }
    }
}

struct Inner {
    lines: Vec<Line>,
    closed: bool,
}

/// Shared, append-only buffer of `Line`s with a many-reader broadcast model.
///
/// Writers only ever append (the job's pump threads) and eventually close
/// the stream. Readers subscribe and drain from the beginning, blocking on
/// a condvar rather than polling.
pub struct Stream {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Stream {
    pub fn new() -> Arc<Self> {
        Arc::new(Stream {
            inner: Mutex::new(Inner {
                lines: Vec::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        })
    }

    /// Appends a line and wakes every blocked subscriber.
    ///
    /// Fails with `Error::Closed` if the stream has already been closed;
    /// callers (the pump loop) treat that as "stop pumping", not a real
    /// error.
    pub fn write(&self, line: Line) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(Error::Closed);
        }
        inner.lines.push(line);
        self.cond.notify_all();
        Ok(())
    }

    /// Marks the stream closed. Idempotent; wakes every blocked subscriber
    /// so they can observe end-of-stream once drained.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        inner.closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Registers a new reader starting at the beginning of the buffer.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        Subscription {
            stream: Arc::clone(self),
            cursor: 0,
        }
    }
}

/// A reader's private cursor into a `Stream`'s shared buffer.
pub struct Subscription {
    stream: Arc<Stream>,
    cursor: usize,
}

impl Subscription {
    /// Returns the next line, blocking until one is available or the
    /// stream closes and this cursor has caught up (`None`, end-of-stream).
    pub fn next(&mut self) -> Option<Line> {
        let mut inner = self.stream.inner.lock().unwrap();
        loop {
            if self.cursor < inner.lines.len() {
                let line = inner.lines[self.cursor].clone();
                self.cursor += 1;
                return Some(line);
            }
            if inner.closed {
                return None;
            }
            inner = self.stream.cond.wait(inner).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(s: &str) -> Line {
        Line::new(Channel::Output, s.as_bytes().to_vec())
    }

    #[test]
    fn subscriber_sees_full_history_from_the_start() {
        let stream = Stream::new();
        stream.write(line("a")).unwrap();
        stream.write(line("b")).unwrap();

        let mut sub = stream.subscribe();
        assert_eq!(sub.next().unwrap().bytes, b"a");
        assert_eq!(sub.next().unwrap().bytes, b"b");
    }

    #[test]
    fn late_subscriber_still_replays_from_the_beginning() {
        let stream = Stream::new();
        stream.write(line("a")).unwrap();
        stream.close();

        let mut sub = stream.subscribe();
        assert_eq!(sub.next().unwrap().bytes, b"a");
        assert!(sub.next().is_none());
    }

    #[test]
    fn write_after_close_fails() {
        let stream = Stream::new();
        stream.close();
        assert!(matches!(stream.write(line("a")), Err(Error::Closed)));
    }

    #[test]
    fn close_is_idempotent() {
        let stream = Stream::new();
        stream.close();
        stream.close();
        assert!(stream.is_closed());
    }

    #[test]
    fn two_subscribers_observe_identical_sequences() {
        let stream = Stream::new();
        for s in ["#1", "#2", "#3"] {
            stream.write(line(s)).unwrap();
        }
        stream.close();

        let mut a = stream.subscribe();
        let mut b = stream.subscribe();
        let mut drain = |sub: &mut Subscription| {
            let mut out = Vec::new();
            while let Some(l) = sub.next() {
                out.push(l.bytes);
            }
            out
        };
        assert_eq!(drain(&mut a), drain(&mut b));
    }

    #[test]
    fn blocked_subscriber_wakes_on_write() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let stream = Stream::new();
        let mut sub = stream.subscribe();
        let writer: Arc<Stream> = Arc::clone(&stream);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.write(line("late")).unwrap();
            writer.close();
        });

        assert_eq!(sub.next().unwrap().bytes, b"late");
        assert!(sub.next().is_none());
    }
}
