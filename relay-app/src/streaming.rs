//! Relays buffered shell output to chat in bounded, paced chunks.

use crate::outbox::{Conversation, Outbox};
use crate::redact::redact;
use crate::remote_session::RemoteSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub chunk_max_chars: usize,
    pub chunk_pacing: Duration,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
}

/// Splits `text` into pieces of at most `max_chars` characters, cutting only
/// on character boundaries. Concatenating the pieces yields `text`.
pub fn chunk_output(text: &str, max_chars: usize) -> Vec<&str> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::with_capacity(text.len() / max_chars + 1);
    let mut rest = text;
    while !rest.is_empty() {
        let cut = rest
            .char_indices()
            .nth(max_chars)
            .map_or(rest.len(), |(index, _)| index);
        let (chunk, tail) = rest.split_at(cut);
        chunks.push(chunk);
        rest = tail;
    }
    chunks
}

pub fn fence(chunk: &str) -> String {
    format!("```\n{chunk}\n```")
}

/// Redacts `text`, then sends it as fenced chunks with pacing between them.
/// Returns the number of messages sent.
pub async fn emit_chunks(
    outbox: &Outbox,
    to: &Conversation,
    text: &str,
    settings: &StreamSettings,
) -> usize {
    let redacted = redact(text);
    let chunks = chunk_output(&redacted, settings.chunk_max_chars);
    let total = chunks.len();
    for (index, chunk) in chunks.into_iter().enumerate() {
        outbox.send_text(to, fence(chunk)).await;
        if index + 1 < total && !settings.chunk_pacing.is_zero() {
            tokio::time::sleep(settings.chunk_pacing).await;
        }
    }
    total
}

/// Drains `session` every poll interval until it disconnects or closes.
/// Output that arrives before a remote disconnect is still flushed.
/// Starting a loop stops any loop already streaming the same session.
pub fn spawn_stream_loop(
    session: Arc<RemoteSession>,
    outbox: Outbox,
    to: Conversation,
    settings: StreamSettings,
) -> JoinHandle<()> {
    let cancel = session.claim_stream();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(
            Instant::now() + settings.poll_interval,
            settings.poll_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let connected = {
                let _emitting = session.lock_output().await;
                // Read before draining; anything that lands while chunks are
                // paced out goes on the next tick.
                let connected = session.is_connected();
                let output = session.drain_output();
                if !output.trim().is_empty() {
                    let sent = emit_chunks(&outbox, &to, &output, &settings).await;
                    tracing::debug!(host = %session.host(), chunks = sent, "streamed shell output");
                }
                connected
            };
            if !connected {
                break;
            }
        }
        cancel.cancel();
        tracing::debug!(host = %session.host(), "stream loop stopped");
    })
}

/// Drains `session` once after the settle delay, unless a stream loop is
/// already delivering its output.
pub fn spawn_one_shot_drain(
    session: Arc<RemoteSession>,
    outbox: Outbox,
    to: Conversation,
    settings: StreamSettings,
) -> JoinHandle<()> {
    let cancel = session.child_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(settings.settle_delay) => {}
        }
        if session.stream_active() {
            tracing::debug!(host = %session.host(), "stream loop active; skipping one-shot drain");
            return;
        }
        let _emitting = session.lock_output().await;
        let output = session.drain_output();
        if !output.trim().is_empty() {
            emit_chunks(&outbox, &to, &output, &settings).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_session::CloseReason;
    use crate::test_support::{RecordingAdapter, open_fake_session};
    use relay_remote::ShellEvent;

    fn settings() -> StreamSettings {
        StreamSettings {
            chunk_max_chars: 3_500,
            chunk_pacing: Duration::from_millis(600),
            poll_interval: Duration::from_secs(5),
            settle_delay: Duration::from_secs(2),
        }
    }

    fn chat() -> Conversation {
        Conversation::new("whatsapp", "628123")
    }

    #[test]
    fn chunk_count_is_ceiling_of_length_over_max() {
        let text = "x".repeat(7_001);
        let chunks = chunk_output(&text, 3_500);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], "x");
        assert_eq!(chunks.concat(), text);

        assert_eq!(chunk_output(&"y".repeat(3_500), 3_500).len(), 1);
        assert!(chunk_output("", 3_500).is_empty());
    }

    #[test]
    fn chunks_never_split_a_character() {
        let text = "héllo wörld ☃☃☃";
        let chunks = chunk_output(text, 4);
        assert_eq!(chunks.concat(), text);
        assert_eq!(chunks.len(), text.chars().count().div_ceil(4));
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 4));
    }

    #[tokio::test(start_paused = true)]
    async fn emit_paces_and_fences_chunks() {
        let adapter = RecordingAdapter::new("whatsapp");
        let mut settings = settings();
        settings.chunk_max_chars = 5;
        let started = Instant::now();
        let sent = emit_chunks(&adapter.outbox(), &chat(), "abcdefghij", &settings).await;

        assert_eq!(sent, 2);
        assert_eq!(
            adapter.texts(),
            vec!["```\nabcde\n```".to_string(), "```\nfghij\n```".to_string()]
        );
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(600) && elapsed < Duration::from_millis(1_200));
    }

    #[tokio::test]
    async fn emitted_output_is_redacted() {
        let adapter = RecordingAdapter::new("whatsapp");
        emit_chunks(
            &adapter.outbox(),
            &chat(),
            "inet 192.168.1.20 password: hunter2",
            &settings(),
        )
        .await;
        let text = adapter.texts().concat();
        assert!(!text.contains("192.168.1.20"));
        assert!(!text.contains("hunter2"));
    }

    #[tokio::test(start_paused = true)]
    async fn stream_loop_polls_until_remote_close() {
        let fake = open_fake_session("node-1").await;
        let adapter = RecordingAdapter::new("whatsapp");
        let handle = spawn_stream_loop(fake.session.clone(), adapter.outbox(), chat(), settings());

        fake.endpoint
            .events
            .send(ShellEvent::Stdout(b"Installing panel".to_vec()))
            .expect("stdout");
        fake.settle().await;
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(adapter.texts().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(adapter.texts(), vec!["```\nInstalling panel\n```".to_string()]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(adapter.texts().len(), 1, "blank polls send nothing");

        fake.endpoint
            .events
            .send(ShellEvent::Stdout(b"done".to_vec()))
            .expect("stdout");
        fake.endpoint.events.send(ShellEvent::Closed).expect("closed");
        fake.settle().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.await.expect("loop exits");
        assert_eq!(adapter.texts().last().map(String::as_str), Some("```\ndone\n```"));
    }

    #[tokio::test(start_paused = true)]
    async fn stream_loop_flushes_output_that_lands_during_pacing() {
        let fake = open_fake_session("node-1").await;
        let adapter = RecordingAdapter::new("whatsapp");
        let mut settings = settings();
        settings.chunk_max_chars = 5;
        let handle = spawn_stream_loop(fake.session.clone(), adapter.outbox(), chat(), settings);

        fake.endpoint
            .events
            .send(ShellEvent::Stdout(b"aaaaabbbbbccccc".to_vec()))
            .expect("stdout");
        fake.settle().await;
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(adapter.texts().len(), 1, "still pacing the first drain");

        fake.endpoint
            .events
            .send(ShellEvent::Stdout(b"DONE".to_vec()))
            .expect("stdout");
        fake.endpoint.events.send(ShellEvent::Closed).expect("closed");
        fake.settle().await;

        handle.await.expect("loop exits");
        assert_eq!(
            adapter.texts(),
            vec![
                "```\naaaaa\n```".to_string(),
                "```\nbbbbb\n```".to_string(),
                "```\nccccc\n```".to_string(),
                "```\nDONE\n```".to_string(),
            ]
        );
        assert!(fake.session.drain_output().is_empty());
        assert!(!fake.session.stream_active());
    }

    #[tokio::test(start_paused = true)]
    async fn new_stream_loop_replaces_the_running_one() {
        let fake = open_fake_session("node-1").await;
        let adapter = RecordingAdapter::new("whatsapp");
        let first = spawn_stream_loop(fake.session.clone(), adapter.outbox(), chat(), settings());
        let second = spawn_stream_loop(fake.session.clone(), adapter.outbox(), chat(), settings());
        first.await.expect("replaced loop exits");
        assert!(fake.session.stream_active());

        fake.endpoint
            .events
            .send(ShellEvent::Stdout(b"Installing wings".to_vec()))
            .expect("stdout");
        fake.settle().await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(adapter.texts(), vec!["```\nInstalling wings\n```".to_string()]);

        fake.session.close(CloseReason::Operator, None);
        second.await.expect("loop exits");
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_drain_leaves_output_to_the_stream_loop() {
        let fake = open_fake_session("node-1").await;
        let adapter = RecordingAdapter::new("whatsapp");
        let stream = spawn_stream_loop(fake.session.clone(), adapter.outbox(), chat(), settings());
        let drain =
            spawn_one_shot_drain(fake.session.clone(), adapter.outbox(), chat(), settings());

        fake.endpoint
            .events
            .send(ShellEvent::Stdout(b"uptime 3 days".to_vec()))
            .expect("stdout");
        fake.settle().await;
        drain.await.expect("drain");
        assert!(adapter.texts().is_empty());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(adapter.texts(), vec!["```\nuptime 3 days\n```".to_string()]);

        fake.session.close(CloseReason::Operator, None);
        stream.await.expect("loop exits");
    }

    #[tokio::test(start_paused = true)]
    async fn stream_loop_stops_when_session_closes() {
        let fake = open_fake_session("node-1").await;
        let adapter = RecordingAdapter::new("whatsapp");
        let handle = spawn_stream_loop(fake.session.clone(), adapter.outbox(), chat(), settings());

        fake.session.close(CloseReason::Operator, None);
        handle.await.expect("loop exits");
        assert!(adapter.texts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_drain_waits_for_settle_delay() {
        let fake = open_fake_session("node-1").await;
        let adapter = RecordingAdapter::new("whatsapp");
        let handle =
            spawn_one_shot_drain(fake.session.clone(), adapter.outbox(), chat(), settings());

        fake.endpoint
            .events
            .send(ShellEvent::Stdout(b"up 3 days".to_vec()))
            .expect("stdout");
        fake.settle().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(adapter.texts().is_empty());

        handle.await.expect("drain");
        assert_eq!(adapter.texts(), vec!["```\nup 3 days\n```".to_string()]);
    }
}
