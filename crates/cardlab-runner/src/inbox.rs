//! Stream multiplexer: one reader thread per engine output stream feeding a
//! single ordered inbox.
//!
//! Readers only decode lines and forward them. Arrival order is stamped by
//! the consumer on receipt, so the order numbers reflect when each complete
//! line became visible, independent of which stream produced it.

use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Engine stdout.
    Primary,
    /// Engine stderr.
    Secondary,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Primary => "stdout",
            Channel::Secondary => "stderr",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxLine {
    pub channel: Channel,
    pub text: String,
    pub arrival_order: u64,
}

enum Message {
    Line(Channel, String),
    Closed(Channel),
    Failed(Channel, String),
}

/// What one bounded wait on the inbox produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    Line(InboxLine),
    /// The stream reached end of file.
    Closed(Channel),
    /// The reader hit an I/O error and stopped.
    ReadError { channel: Channel, message: String },
    /// Nothing arrived within the wait.
    Idle,
    /// Every producer is gone and the queue is drained.
    Disconnected,
}

/// Producer half, cloned into each reader thread.
#[derive(Clone)]
pub struct InboxProducer {
    tx: Sender<Message>,
}

impl InboxProducer {
    /// Never blocks: the inbox is unbounded. Sending after the consumer is
    /// gone is silently dropped.
    pub fn push_line(&self, channel: Channel, text: impl Into<String>) {
        let _ = self.tx.send(Message::Line(channel, text.into()));
    }

    pub fn close(&self, channel: Channel) {
        let _ = self.tx.send(Message::Closed(channel));
    }

    pub fn fail(&self, channel: Channel, message: impl Into<String>) {
        let _ = self.tx.send(Message::Failed(channel, message.into()));
    }
}

/// Consumer half. Owned by the correlation loop, the single consumer.
pub struct Inbox {
    rx: Receiver<Message>,
    next_order: u64,
}

/// Creates a connected producer/consumer pair.
pub fn inbox() -> (InboxProducer, Inbox) {
    let (tx, rx) = unbounded();
    (InboxProducer { tx }, Inbox { rx, next_order: 0 })
}

impl Inbox {
    /// Waits at most `timeout` for the next message.
    pub fn poll(&mut self, timeout: Duration) -> Poll {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => self.stamp(message),
            Err(RecvTimeoutError::Timeout) => Poll::Idle,
            Err(RecvTimeoutError::Disconnected) => Poll::Disconnected,
        }
    }

    /// Takes whatever is already queued without waiting.
    pub fn drain(&mut self) -> Vec<Poll> {
        let pending: Vec<Message> = self.rx.try_iter().collect();
        pending.into_iter().map(|m| self.stamp(m)).collect()
    }

    pub fn delivered(&self) -> u64 {
        self.next_order
    }

    fn stamp(&mut self, message: Message) -> Poll {
        match message {
            Message::Line(channel, text) => {
                let arrival_order = self.next_order;
                self.next_order += 1;
                Poll::Line(InboxLine {
                    channel,
                    text,
                    arrival_order,
                })
            }
            Message::Closed(channel) => Poll::Closed(channel),
            Message::Failed(channel, message) => Poll::ReadError { channel, message },
        }
    }
}

fn strip_line_ending(buf: &mut Vec<u8>) {
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
}

/// Spawns a reader that forwards every complete line of `stream` into the
/// inbox, then reports end of stream. Invalid UTF-8 is replaced, never fatal.
pub fn spawn_reader<R>(
    channel: Channel,
    stream: R,
    producer: InboxProducer,
) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("cardlab-{}-reader", channel.as_str()))
        .spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::with_capacity(256);
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => {
                        producer.close(channel);
                        break;
                    }
                    Ok(_) => {
                        strip_line_ending(&mut buf);
                        producer.push_line(channel, String::from_utf8_lossy(&buf).into_owned());
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        producer.fail(channel, e.to_string());
                        break;
                    }
                }
            }
            debug!(channel = %channel, "reader finished");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collect_until_closed(inbox: &mut Inbox, closes: usize) -> Vec<Poll> {
        let mut out = Vec::new();
        let mut seen = 0;
        while seen < closes {
            let poll = inbox.poll(Duration::from_secs(5));
            match poll {
                Poll::Closed(_) => seen += 1,
                Poll::Idle | Poll::Disconnected => panic!("reader stalled: {:?}", poll),
                _ => {}
            }
            out.push(poll);
        }
        out
    }

    #[test]
    fn reader_forwards_lines_then_closes() {
        let (producer, mut inbox) = inbox();
        let handle = spawn_reader(
            Channel::Secondary,
            Cursor::new(b"first\r\nsecond\nthird".to_vec()),
            producer,
        )
        .expect("spawn reader");
        let polls = collect_until_closed(&mut inbox, 1);
        handle.join().expect("join");
        let texts: Vec<String> = polls
            .iter()
            .filter_map(|p| match p {
                Poll::Line(l) => Some(l.text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
        assert_eq!(polls.last(), Some(&Poll::Closed(Channel::Secondary)));
    }

    #[test]
    fn arrival_order_is_monotonic_across_channels() {
        let (producer, mut inbox) = inbox();
        let out = spawn_reader(
            Channel::Primary,
            Cursor::new(b"a\nb\nc\n".to_vec()),
            producer.clone(),
        )
        .expect("spawn stdout");
        let err = spawn_reader(
            Channel::Secondary,
            Cursor::new(b"x\ny\n".to_vec()),
            producer,
        )
        .expect("spawn stderr");
        let polls = collect_until_closed(&mut inbox, 2);
        out.join().expect("join");
        err.join().expect("join");

        let lines: Vec<&InboxLine> = polls
            .iter()
            .filter_map(|p| match p {
                Poll::Line(l) => Some(l),
                _ => None,
            })
            .collect();
        assert_eq!(lines.len(), 5);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(line.arrival_order, i as u64);
        }
        let primary: Vec<&str> = lines
            .iter()
            .filter(|l| l.channel == Channel::Primary)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(primary, vec!["a", "b", "c"]);
        assert_eq!(inbox.delivered(), 5);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let (producer, mut inbox) = inbox();
        let handle = spawn_reader(
            Channel::Primary,
            Cursor::new(vec![b'o', b'k', 0xff, b'\n']),
            producer,
        )
        .expect("spawn");
        let polls = collect_until_closed(&mut inbox, 1);
        handle.join().expect("join");
        match &polls[0] {
            Poll::Line(l) => assert!(l.text.starts_with("ok")),
            other => panic!("expected line, got {:?}", other),
        }
    }

    #[test]
    fn idle_then_disconnected_when_producers_drop() {
        let (producer, mut inbox) = inbox();
        assert_eq!(inbox.poll(Duration::from_millis(10)), Poll::Idle);
        producer.push_line(Channel::Primary, "late");
        drop(producer);
        assert!(matches!(inbox.poll(Duration::from_millis(10)), Poll::Line(_)));
        assert_eq!(inbox.poll(Duration::from_millis(10)), Poll::Disconnected);
    }

    #[test]
    fn drain_returns_queued_messages_without_waiting() {
        let (producer, mut inbox) = inbox();
        producer.push_line(Channel::Primary, "one");
        producer.fail(Channel::Secondary, "broken pipe");
        let drained = inbox.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(
            drained[1],
            Poll::ReadError {
                channel: Channel::Secondary,
                message: "broken pipe".to_string()
            }
        );
        assert!(inbox.drain().is_empty());
    }
}
