use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{timeout, Instant};

use crate::error::{Result, SyncError};
use crate::presence::RoomRegistry;

use super::channel_state::{step, ChannelInput, ChannelState, ReconnectPolicy};
use super::channel_types::{ChannelNotice, ClientEvent, ServerEvent};
use super::transport::{Transport, TransportConnection};

const EVENT_BUFFER: usize = 256;
const NOTICE_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy)]
enum Command {
    Connect,
    Disconnect,
}

enum ConnectionEnd {
    Dropped,
    DisconnectRequested,
    HandleDropped,
}

/// Owns the session's one persistent live-channel connection.
///
/// All lifecycle work happens in a spawned driver task; this handle only
/// queues commands and outbound events. Inbound domain events fan out on a
/// broadcast channel, lifecycle notices on a second one, and the current
/// [`ChannelState`] is observable through a watch.
pub struct LiveChannel {
    command_tx: mpsc::UnboundedSender<Command>,
    outbound: Arc<RwLock<Option<mpsc::UnboundedSender<ClientEvent>>>>,
    state_rx: watch::Receiver<ChannelState>,
    events_tx: broadcast::Sender<ServerEvent>,
    notices_tx: broadcast::Sender<ChannelNotice>,
}

impl LiveChannel {
    /// Create the channel and spawn its driver. No connection is attempted
    /// until [`LiveChannel::connect`] is called.
    pub fn new(
        url: String,
        credential: String,
        policy: ReconnectPolicy,
        registry: Arc<RoomRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (notices_tx, _) = broadcast::channel(NOTICE_BUFFER);
        let outbound = Arc::new(RwLock::new(None));

        let driver = Driver {
            url,
            credential,
            policy,
            registry,
            transport,
            state_tx,
            events_tx: events_tx.clone(),
            notices_tx: notices_tx.clone(),
            outbound: outbound.clone(),
        };
        tokio::spawn(driver.run(command_rx));

        Self {
            command_tx,
            outbound,
            state_rx,
            events_tx,
            notices_tx,
        }
    }

    /// Ask the driver to establish the connection. Returns immediately;
    /// progress is visible via [`LiveChannel::state`] and notices.
    pub fn connect(&self) {
        let _ = self.command_tx.send(Command::Connect);
    }

    pub fn disconnect(&self) {
        let _ = self.command_tx.send(Command::Disconnect);
    }

    /// Queue an event for the authority. Fails when no connection is up;
    /// room membership does not need to queue sends because the driver
    /// replays `join_room` for every registered room on (re)connect.
    pub fn send(&self, event: ClientEvent) -> Result<()> {
        let guard = self.outbound.read().expect("outbound lock poisoned");
        match guard.as_ref() {
            Some(tx) => tx
                .send(event)
                .map_err(|_| SyncError::ChannelClosed("connection closing".to_string())),
            None => Err(SyncError::ChannelClosed("not connected".to_string())),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events_tx.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<ChannelNotice> {
        self.notices_tx.subscribe()
    }

    /// Block until the pending connect resolves one way or the other.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut notices = self.notices_tx.subscribe();
        if self.state().is_connected() {
            return Ok(());
        }
        loop {
            match notices.recv().await {
                Ok(ChannelNotice::Connected { .. }) => return Ok(()),
                Ok(ChannelNotice::AuthRejected(msg)) => return Err(SyncError::Auth(msg)),
                Ok(ChannelNotice::GaveUp) => {
                    return Err(SyncError::Transport(
                        "connection attempts exhausted".to_string(),
                    ))
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SyncError::ChannelClosed("driver stopped".to_string()))
                }
            }
        }
    }
}

struct Driver {
    url: String,
    credential: String,
    policy: ReconnectPolicy,
    registry: Arc<RoomRegistry>,
    transport: Arc<dyn Transport>,
    state_tx: watch::Sender<ChannelState>,
    events_tx: broadcast::Sender<ServerEvent>,
    notices_tx: broadcast::Sender<ChannelNotice>,
    outbound: Arc<RwLock<Option<mpsc::UnboundedSender<ClientEvent>>>>,
}

impl Driver {
    async fn run(self, mut command_rx: mpsc::UnboundedReceiver<Command>) {
        let mut state = ChannelState::Disconnected;
        let mut last_attempt: Option<Instant> = None;
        let mut connected_before = false;

        loop {
            self.publish(&state);
            match state.clone() {
                ChannelState::Disconnected | ChannelState::GaveUp => {
                    match command_rx.recv().await {
                        Some(Command::Connect) => {
                            state = step(&state, ChannelInput::ConnectRequested, &self.policy);
                        }
                        Some(Command::Disconnect) => {}
                        None => return,
                    }
                }

                ChannelState::Connecting { attempt } => {
                    self.throttle(&mut last_attempt).await;
                    tracing::info!("Live channel connecting (attempt {attempt})");

                    let dial = self.transport.connect(&self.url, &self.credential);
                    match timeout(self.policy.connect_timeout, dial).await {
                        Ok(Ok(mut conn)) => {
                            state = step(&state, ChannelInput::AttemptSucceeded, &self.policy);
                            self.publish(&state);
                            tracing::info!("Live channel connected");
                            let resumed = connected_before;
                            connected_before = true;

                            if self.rejoin_rooms(conn.as_mut()).await.is_err() {
                                // Connection died before membership was
                                // restored; treat as an ordinary drop.
                                let _ = self.notices_tx.send(ChannelNotice::Disconnected);
                                state = step(&state, ChannelInput::ConnectionLost, &self.policy);
                                continue;
                            }

                            let _ = self.notices_tx.send(ChannelNotice::Connected { resumed });

                            let end = self.run_connection(conn, &mut command_rx).await;
                            match end {
                                ConnectionEnd::Dropped => {
                                    tracing::warn!("Live channel connection lost");
                                    let _ = self.notices_tx.send(ChannelNotice::Disconnected);
                                    state =
                                        step(&state, ChannelInput::ConnectionLost, &self.policy);
                                }
                                ConnectionEnd::DisconnectRequested => {
                                    tracing::info!("Live channel disconnected");
                                    let _ = self.notices_tx.send(ChannelNotice::Disconnected);
                                    state = step(
                                        &state,
                                        ChannelInput::DisconnectRequested,
                                        &self.policy,
                                    );
                                }
                                ConnectionEnd::HandleDropped => return,
                            }
                        }
                        Ok(Err(err)) if err.is_auth() => {
                            tracing::error!("Live channel handshake rejected: {err}");
                            let _ = self
                                .notices_tx
                                .send(ChannelNotice::AuthRejected(err.to_string()));
                            state = step(&state, ChannelInput::DisconnectRequested, &self.policy);
                        }
                        Ok(Err(err)) => {
                            tracing::warn!("Live channel connect failed: {err}");
                            state = self.fail_attempt(&state);
                        }
                        Err(_) => {
                            tracing::warn!(
                                "Live channel connect timed out after {:?}",
                                self.policy.connect_timeout
                            );
                            state = self.fail_attempt(&state);
                        }
                    }
                }

                ChannelState::Reconnecting { delay, .. } => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            state = step(&state, ChannelInput::BackoffElapsed, &self.policy);
                        }
                        cmd = command_rx.recv() => match cmd {
                            Some(Command::Disconnect) => {
                                state = step(&state, ChannelInput::DisconnectRequested, &self.policy);
                            }
                            Some(Command::Connect) => {}
                            None => return,
                        },
                    }
                }

                // Connected is handled inline above; reaching it here means
                // the connection already ended.
                ChannelState::Connected => {
                    state = step(&state, ChannelInput::ConnectionLost, &self.policy);
                }
            }
        }
    }

    /// Defer an attempt started less than `min_connect_interval` after the
    /// previous one.
    async fn throttle(&self, last_attempt: &mut Option<Instant>) {
        if let Some(prev) = *last_attempt {
            let elapsed = prev.elapsed();
            if elapsed < self.policy.min_connect_interval {
                tokio::time::sleep(self.policy.min_connect_interval - elapsed).await;
            }
        }
        *last_attempt = Some(Instant::now());
    }

    fn fail_attempt(&self, state: &ChannelState) -> ChannelState {
        let next = step(state, ChannelInput::AttemptFailed, &self.policy);
        if next.is_terminal() {
            tracing::error!("Live channel giving up after repeated connect failures");
            let _ = self.notices_tx.send(ChannelNotice::GaveUp);
        }
        next
    }

    /// Membership does not survive a transport reconnection; replay joins
    /// for every room the session holds.
    async fn rejoin_rooms(&self, conn: &mut dyn TransportConnection) -> Result<()> {
        for room_id in self.registry.all() {
            let frame = serde_json::to_string(&ClientEvent::JoinRoom { room_id })
                .expect("join frame serializes");
            conn.send(frame).await?;
            tracing::debug!("Re-joined room {room_id}");
        }
        Ok(())
    }

    async fn run_connection(
        &self,
        mut conn: Box<dyn TransportConnection>,
        command_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> ConnectionEnd {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        *self.outbound.write().expect("outbound lock poisoned") = Some(out_tx);

        let end = loop {
            tokio::select! {
                frame = conn.recv() => match frame {
                    Some(text) => self.dispatch_frame(&text),
                    None => break ConnectionEnd::Dropped,
                },
                event = out_rx.recv() => {
                    // The sender half lives in `self.outbound`, so recv only
                    // fails if that slot was replaced; treat it as a drop.
                    let Some(event) = event else { break ConnectionEnd::Dropped };
                    let frame = serde_json::to_string(&event).expect("client event serializes");
                    if let Err(err) = conn.send(frame).await {
                        tracing::warn!("Live channel send failed: {err}");
                        break ConnectionEnd::Dropped;
                    }
                }
                cmd = command_rx.recv() => match cmd {
                    Some(Command::Disconnect) => break ConnectionEnd::DisconnectRequested,
                    Some(Command::Connect) => {}
                    None => break ConnectionEnd::HandleDropped,
                },
            }
        };

        *self.outbound.write().expect("outbound lock poisoned") = None;
        conn.close().await;
        end
    }

    fn dispatch_frame(&self, text: &str) {
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => {
                let _ = self.events_tx.send(event);
            }
            Err(err) => {
                tracing::warn!("Ignoring unparseable live channel frame: {err}");
            }
        }
    }

    fn publish(&self, state: &ChannelState) {
        let _ = self.state_tx.send(state.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    /// Scripted transport: each connect attempt pops the next outcome.
    struct FakeTransport {
        outcomes: Mutex<Vec<ConnectOutcome>>,
        attempts: Arc<Mutex<u32>>,
    }

    enum ConnectOutcome {
        Fail,
        Succeed(FakeConn),
    }

    struct FakeConn {
        sent: Arc<Mutex<Vec<String>>>,
        inbound: mpsc::UnboundedReceiver<String>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn connect(
            &self,
            _url: &str,
            _credential: &str,
        ) -> crate::error::Result<Box<dyn TransportConnection>> {
            *self.attempts.lock().unwrap() += 1;
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                return Err(SyncError::Transport("refused".to_string()));
            }
            match outcomes.remove(0) {
                ConnectOutcome::Fail => Err(SyncError::Transport("refused".to_string())),
                ConnectOutcome::Succeed(conn) => Ok(Box::new(conn)),
            }
        }
    }

    #[async_trait]
    impl TransportConnection for FakeConn {
        async fn send(&mut self, frame: String) -> crate::error::Result<()> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn recv(&mut self) -> Option<String> {
            self.inbound.recv().await
        }

        async fn close(&mut self) {}
    }

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            max_attempts,
            min_connect_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(5),
        }
    }

    fn conn_pair() -> (FakeConn, mpsc::UnboundedSender<String>, Arc<Mutex<Vec<String>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        (
            FakeConn {
                sent: sent.clone(),
                inbound: rx,
            },
            tx,
            sent,
        )
    }

    fn channel_with(
        outcomes: Vec<ConnectOutcome>,
        max_attempts: u32,
        registry: Arc<RoomRegistry>,
    ) -> (LiveChannel, Arc<Mutex<u32>>) {
        let attempts = Arc::new(Mutex::new(0));
        let transport = Arc::new(FakeTransport {
            outcomes: Mutex::new(outcomes),
            attempts: attempts.clone(),
        });
        let channel = LiveChannel::new(
            "ws://test".to_string(),
            "token".to_string(),
            policy(max_attempts),
            registry,
            transport,
        );
        (channel, attempts)
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_attempt_ceiling() {
        let (channel, attempts) =
            channel_with(Vec::new(), 3, Arc::new(RoomRegistry::new()));
        let mut notices = channel.notices();

        channel.connect();
        assert!(channel.wait_connected().await.is_err());

        loop {
            match notices.recv().await.unwrap() {
                ChannelNotice::GaveUp => break,
                _ => continue,
            }
        }
        assert_eq!(*attempts.lock().unwrap(), 3);
        // Give the driver a beat to settle, then confirm no further dialing.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*attempts.lock().unwrap(), 3);
        assert!(channel.state().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_and_rejoins_rooms() {
        let room = Uuid::new_v4();
        let registry = Arc::new(RoomRegistry::new());
        registry.add(room);

        let (conn1, feed1, _sent1) = conn_pair();
        let (conn2, _feed2, sent2) = conn_pair();
        let (channel, _) = channel_with(
            vec![
                ConnectOutcome::Succeed(conn1),
                ConnectOutcome::Fail,
                ConnectOutcome::Succeed(conn2),
            ],
            5,
            registry,
        );
        let mut notices = channel.notices();

        channel.connect();
        channel.wait_connected().await.unwrap();

        // Server closes the connection.
        drop(feed1);
        loop {
            if let ChannelNotice::Connected { resumed: true } = notices.recv().await.unwrap() {
                break;
            }
        }

        let frames = sent2.lock().unwrap().clone();
        let expected = serde_json::to_string(&ClientEvent::JoinRoom { room_id: room }).unwrap();
        assert_eq!(frames, [expected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_frames_fan_out_and_bad_frames_are_skipped() {
        let (conn, feed, _sent) = conn_pair();
        let (channel, _) = channel_with(
            vec![ConnectOutcome::Succeed(conn)],
            3,
            Arc::new(RoomRegistry::new()),
        );
        let mut events = channel.subscribe();

        channel.connect();
        channel.wait_connected().await.unwrap();

        feed.send("not json".to_string()).unwrap();
        let payload = serde_json::json!({
            "type": "channel_error",
            "message": "slow down",
        });
        feed.send(payload.to_string()).unwrap();

        match events.recv().await.unwrap() {
            ServerEvent::ChannelError(p) => assert_eq!(p.message, "slow down"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_connection() {
        let (channel, _) = channel_with(Vec::new(), 1, Arc::new(RoomRegistry::new()));
        let err = channel
            .send(ClientEvent::LeaveRoom {
                room_id: Uuid::new_v4(),
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::ChannelClosed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_events_reach_the_wire() {
        let (conn, _feed, sent) = conn_pair();
        let (channel, _) = channel_with(
            vec![ConnectOutcome::Succeed(conn)],
            3,
            Arc::new(RoomRegistry::new()),
        );

        channel.connect();
        channel.wait_connected().await.unwrap();

        let room_id = Uuid::new_v4();
        channel.send(ClientEvent::JoinRoom { room_id }).unwrap();

        // Let the driver's select loop pick the event up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let frames = sent.lock().unwrap().clone();
        assert_eq!(
            frames,
            [serde_json::to_string(&ClientEvent::JoinRoom { room_id }).unwrap()]
        );
    }
}
