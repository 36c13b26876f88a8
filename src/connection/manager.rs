//! Connection manager: owns the coordinator WebSocket.
//!
//! Connects, reads task commands into the inbound queue, writes result
//! frames from the outbound queue, pings after outbound silence, and on any
//! failure tears the session down and reconnects after a fixed delay.
//!
//! Ending a session only advances the session counter. Nothing here ever
//! waits on the engine thread outside a live session, so a stalled engine
//! cannot keep the node from reconnecting.

use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::ConnectionState;
use crate::config::NodeConfig;
use crate::error::ConnectionError;
use crate::protocol::{SessionCommand, SessionFrame, SessionId, TaskCommand};

pub struct ConnectionManager {
    url: Url,
    /// `url` without the query, which carries the token.
    display_url: Url,
    reconnect_delay: Duration,
    keepalive_interval: Duration,
    commands: mpsc::Sender<SessionCommand>,
    outbound: mpsc::Receiver<SessionFrame>,
    session: watch::Sender<SessionId>,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(
        url: Url,
        config: &NodeConfig,
        commands: mpsc::Sender<SessionCommand>,
        outbound: mpsc::Receiver<SessionFrame>,
        session: watch::Sender<SessionId>,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        let mut display_url = url.clone();
        display_url.set_query(None);
        Self {
            url,
            display_url,
            reconnect_delay: config.reconnect_delay,
            keepalive_interval: config.keepalive_interval,
            commands,
            outbound,
            session,
            state,
        }
    }

    /// Keep a session with the coordinator alive forever. Only returns once
    /// the scheduling loop is gone.
    pub async fn run(mut self) -> ConnectionError {
        loop {
            match self.run_session().await {
                Err(ConnectionError::SchedulerGone) => {
                    self.set_state(ConnectionState::Disconnected);
                    return ConnectionError::SchedulerGone;
                }
                Err(e) => warn!(url = %self.display_url, error = %e, "Coordinator session ended"),
                Ok(()) => info!(url = %self.display_url, "Coordinator session ended"),
            }
            self.set_state(ConnectionState::Disconnected);
            self.end_session();

            info!(
                delay_ms = self.reconnect_delay.as_millis() as u64,
                "Waiting to reconnect"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = self.commands.closed() => return ConnectionError::SchedulerGone,
            }
        }
    }

    async fn run_session(&mut self) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::Connecting);
        let (ws, _response) =
            connect_async(self.url.as_str())
                .await
                .map_err(|e| ConnectionError::Connect {
                    url: self.display_url.to_string(),
                    reason: e.to_string(),
                })?;

        let session = *self.session.borrow();
        self.set_state(ConnectionState::Connected);
        info!(url = %self.display_url, session, "Connected to coordinator");

        let (sink, stream) = ws.split();
        let result = tokio::select! {
            r = read_loop(stream, &self.commands, session) => r,
            r = write_loop(sink, &mut self.outbound, self.keepalive_interval, session) => r,
        };
        self.set_state(ConnectionState::Closing);
        result
    }

    /// Retire the current session. Tasks submitted on it are abandoned by
    /// the scheduling loop and their output is no longer written.
    fn end_session(&self) -> SessionId {
        self.session.send_modify(|session| *session += 1);
        let next = *self.session.borrow();
        debug!(session = next, "Session counter advanced");
        next
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Connection state changed");
        }
    }
}

/// Decode inbound text frames into task commands tagged with `session`.
/// Malformed commands are logged and skipped; every other frame only counts
/// as liveness.
async fn read_loop<S, E>(
    mut stream: S,
    commands: &mpsc::Sender<SessionCommand>,
    session: SessionId,
) -> Result<(), ConnectionError>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    while let Some(message) = stream.next().await {
        match message.map_err(|e| ConnectionError::Read(e.to_string()))? {
            Message::Text(text) => {
                let text = text.as_str();
                if text.is_empty() {
                    debug!("Received keepalive");
                    continue;
                }
                match TaskCommand::decode(text) {
                    Ok(command) => {
                        debug!(task_id = command.task_id(), "Received task command");
                        commands
                            .send(SessionCommand { session, command })
                            .await
                            .map_err(|_| ConnectionError::SchedulerGone)?;
                    }
                    Err(e) => warn!(error = %e, "Discarding malformed task command"),
                }
            }
            Message::Close(frame) => {
                info!(?frame, "Coordinator sent close");
                return Err(ConnectionError::Closed);
            }
            _ => debug!("Received non-text frame"),
        }
    }
    Err(ConnectionError::Closed)
}

/// Send result frames of `session` as binary messages, dropping frames of
/// earlier sessions. An empty text frame goes out after `keepalive` without
/// a sent frame.
async fn write_loop<S>(
    mut sink: S,
    outbound: &mut mpsc::Receiver<SessionFrame>,
    keepalive: Duration,
    session: SessionId,
) -> Result<(), ConnectionError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let silence = tokio::time::sleep(keepalive);
    tokio::pin!(silence);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(SessionFrame { session: origin, frame }) = frame else {
                    return Err(ConnectionError::SchedulerGone);
                };
                if origin != session {
                    debug!(task_id = frame.task_id, origin, session, "Dropping frame of previous session");
                    continue;
                }
                debug!(
                    task_id = frame.task_id,
                    bytes = frame.payload.len(),
                    completion = frame.is_completion(),
                    "Sending result frame"
                );
                sink.send(Message::binary(frame.encode()))
                    .await
                    .map_err(|e| ConnectionError::Write(e.to_string()))?;
            }
            () = &mut silence => {
                debug!("Sending keepalive");
                sink.send(Message::text(String::new()))
                    .await
                    .map_err(|e| ConnectionError::Write(e.to_string()))?;
            }
        }
        silence.as_mut().reset(Instant::now() + keepalive);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResultFrame;
    use crate::task::{ChatTurn, Task};

    const KEEPALIVE: Duration = Duration::from_millis(100);

    fn drain(rx: &mut mpsc::Receiver<SessionCommand>) -> Vec<SessionCommand> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn frame(session: SessionId, frame: ResultFrame) -> SessionFrame {
        SessionFrame { session, frame }
    }

    #[tokio::test]
    async fn read_loop_forwards_commands_and_skips_garbage() {
        let (tx, mut rx) = mpsc::channel(8);
        let frames = futures::stream::iter(vec![
            Ok::<_, String>(Message::text(
                r#"{"id":1,"messages":[{"role":"user","content":"Hi"}]}"#.to_string(),
            )),
            Ok(Message::text("{broken".to_string())),
            Ok(Message::text(String::new())),
            Ok(Message::binary(vec![1, 2, 3])),
            Ok(Message::text(r#"{"id":2,"stop":true}"#.to_string())),
        ]);

        let result = read_loop(frames, &tx, 7).await;
        assert!(matches!(result, Err(ConnectionError::Closed)));
        assert_eq!(
            drain(&mut rx),
            vec![
                SessionCommand {
                    session: 7,
                    command: TaskCommand::Submit(Task::new(1, vec![ChatTurn::user("Hi")])),
                },
                SessionCommand {
                    session: 7,
                    command: TaskCommand::Stop(2),
                },
            ]
        );
    }

    #[tokio::test]
    async fn read_loop_stops_on_error_and_close() {
        let (tx, _rx) = mpsc::channel(8);
        let failing = futures::stream::iter(vec![Err::<Message, _>("reset by peer".to_string())]);
        assert!(matches!(
            read_loop(failing, &tx, 0).await,
            Err(ConnectionError::Read(reason)) if reason == "reset by peer"
        ));

        let closing = futures::stream::iter(vec![
            Ok::<_, String>(Message::Close(None)),
            Ok(Message::text(r#"{"id":3,"stop":true}"#.to_string())),
        ]);
        assert!(matches!(read_loop(closing, &tx, 0).await, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn read_loop_reports_missing_scheduler() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let frames = futures::stream::iter(vec![Ok::<_, String>(Message::text(
            r#"{"id":4,"stop":true}"#.to_string(),
        ))]);
        assert!(matches!(
            read_loop(frames, &tx, 0).await,
            Err(ConnectionError::SchedulerGone)
        ));
    }

    #[tokio::test]
    async fn write_loop_sends_binary_frames_then_keepalive() {
        let (sink, mut sent) = futures::channel::mpsc::unbounded::<Message>();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        out_tx.send(frame(0, ResultFrame::chunk(1, b"abc".to_vec()))).await.unwrap();
        out_tx.send(frame(0, ResultFrame::completion(1))).await.unwrap();

        let writer = tokio::spawn(async move {
            let _ = write_loop(sink, &mut out_rx, KEEPALIVE, 0).await;
        });

        assert_eq!(sent.next().await, Some(Message::binary(vec![0, 0, 0, 1, b'a', b'b', b'c'])));
        assert_eq!(sent.next().await, Some(Message::binary(vec![0, 0, 0, 1])));

        let ping = tokio::time::timeout(Duration::from_secs(2), sent.next())
            .await
            .expect("keepalive not sent");
        assert_eq!(ping, Some(Message::text(String::new())));

        writer.abort();
    }

    #[tokio::test]
    async fn write_loop_pings_only_after_full_silence() {
        let (sink, mut sent) = futures::channel::mpsc::unbounded::<Message>();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let writer = tokio::spawn(async move {
            let _ = write_loop(sink, &mut out_rx, KEEPALIVE, 0).await;
        });

        // Traffic well inside the keepalive interval for several intervals.
        let mut last_sent = Instant::now();
        for id in 0..12 {
            last_sent = Instant::now();
            out_tx.send(frame(0, ResultFrame::completion(id))).await.unwrap();
            let message = tokio::time::timeout(Duration::from_secs(2), sent.next())
                .await
                .expect("frame not written");
            assert_eq!(message, Some(Message::binary(id.to_be_bytes().to_vec())));
            tokio::time::sleep(KEEPALIVE / 4).await;
        }

        let ping = tokio::time::timeout(Duration::from_secs(2), sent.next())
            .await
            .expect("keepalive not sent");
        assert_eq!(ping, Some(Message::text(String::new())));
        assert!(
            last_sent.elapsed() >= KEEPALIVE,
            "keepalive sent {:?} after the last frame",
            last_sent.elapsed()
        );

        writer.abort();
    }

    #[tokio::test]
    async fn write_loop_drops_frames_of_previous_sessions() {
        let (sink, mut sent) = futures::channel::mpsc::unbounded::<Message>();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        out_tx.send(frame(2, ResultFrame::chunk(1, b"old".to_vec()))).await.unwrap();
        out_tx.send(frame(2, ResultFrame::completion(1))).await.unwrap();
        out_tx.send(frame(3, ResultFrame::completion(5))).await.unwrap();

        let writer = tokio::spawn(async move {
            let _ = write_loop(sink, &mut out_rx, Duration::from_secs(60), 3).await;
        });

        assert_eq!(sent.next().await, Some(Message::binary(vec![0, 0, 0, 5])));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), sent.next())
                .await
                .is_err()
        );

        writer.abort();
    }

    #[tokio::test]
    async fn write_loop_fails_when_sink_is_gone() {
        let (sink, sent) = futures::channel::mpsc::unbounded::<Message>();
        drop(sent);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        out_tx.send(frame(0, ResultFrame::completion(9))).await.unwrap();

        assert!(matches!(
            write_loop(sink, &mut out_rx, KEEPALIVE, 0).await,
            Err(ConnectionError::Write(_))
        ));
    }

    #[tokio::test]
    async fn write_loop_ends_when_outbound_closes() {
        let (sink, _sent) = futures::channel::mpsc::unbounded::<Message>();
        let (out_tx, mut out_rx) = mpsc::channel::<SessionFrame>(8);
        drop(out_tx);

        assert!(matches!(
            write_loop(sink, &mut out_rx, Duration::from_secs(60), 0).await,
            Err(ConnectionError::SchedulerGone)
        ));
    }

    #[tokio::test]
    async fn ending_a_session_never_waits_on_the_scheduler() {
        // Inbound full and never drained, as when the engine thread is stuck.
        let (cmd_tx, _cmd_rx) = mpsc::channel(1);
        cmd_tx
            .try_send(SessionCommand {
                session: 0,
                command: TaskCommand::Stop(1),
            })
            .unwrap();
        let (_out_tx, out_rx) = mpsc::channel(1);
        let (session_tx, session_rx) = watch::channel(0);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let config = NodeConfig::default();
        let manager = ConnectionManager::new(
            config.connect_url().unwrap(),
            &config,
            cmd_tx,
            out_rx,
            session_tx,
            state_tx,
        );
        assert!(manager.display_url.query().is_none());

        assert_eq!(manager.end_session(), 1);
        assert_eq!(manager.end_session(), 2);
        assert_eq!(*session_rx.borrow(), 2);

        manager.set_state(ConnectionState::Connecting);
        assert_eq!(*state_rx.borrow(), ConnectionState::Connecting);
    }
}
