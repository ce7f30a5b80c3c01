//! Command session over the launcher radio link.
//!
//! At most one command is in flight. Each accepted send hands back a
//! [`Completion`] that resolves exactly once: with the device's response
//! code, or with timeout, link loss or cancellation. The session is driven
//! by explicit timestamps so the owner decides where time comes from.

use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use launcher_protocol::{AckFrame, MachineCommand, ResponseCode};

/// How long a sent command waits for its acknowledgement.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Scanning,
    Connecting,
    ConnectedIdle,
    AwaitingAck,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Opaque name of a discovered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralId(pub String);

/// Opaque name of an endpoint on a connected device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicId(pub String);

/// Endpoints found by service discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristics {
    /// Commands are written here.
    pub command: CharacteristicId,
    /// Acknowledgements arrive from here.
    pub notify: CharacteristicId,
}

/// Things a transport reports back, in the order they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    PeripheralFound(PeripheralId),
    Connected,
    ServicesDiscovered(Characteristics),
    Notification {
        characteristic: CharacteristicId,
        data: Bytes,
    },
    Disconnected {
        reason: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("transport i/o: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// A radio or serial stack able to reach the launcher.
///
/// Every method starts an operation and returns right away. Outcomes come
/// back later as [`TransportEvent`]s fed to [`LinkSession::handle_event`].
pub trait Transport {
    fn start_scan(&mut self) -> Result<(), TransportError>;
    fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError>;
    fn discover_services(&mut self) -> Result<(), TransportError>;
    fn write(&mut self, characteristic: &CharacteristicId, frame: &[u8]) -> Result<(), TransportError>;
    fn disconnect(&mut self);
}

/// Why a sent command did not succeed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandError {
    #[error("command rejected by launcher")]
    Rejected,
    #[error("no acknowledgement before deadline")]
    Timeout,
    #[error("link lost while awaiting acknowledgement")]
    LinkLost,
    #[error("session shut down")]
    Cancelled,
}

/// Why a command was not sent at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("a command is already awaiting acknowledgement")]
    Busy,
    #[error("launcher not connected")]
    NotConnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type CommandResult = Result<ResponseCode, CommandError>;

/// Receiving half of a command's single resolution.
pub type Completion = oneshot::Receiver<CommandResult>;

/// Anything that accepts launcher commands.
pub trait CommandSink {
    fn submit(&mut self, command: MachineCommand) -> Result<Completion, SendError>;
}

struct PendingCommand {
    command: MachineCommand,
    sent_at: Instant,
    deadline: Instant,
    completion: oneshot::Sender<CommandResult>,
}

pub struct LinkSession<T: Transport> {
    transport: T,
    state: LinkState,
    characteristics: Option<Characteristics>,
    pending: Option<PendingCommand>,
    ack_timeout: Duration,
}

impl<T: Transport> LinkSession<T> {
    pub fn new(transport: T, ack_timeout: Duration) -> Self {
        Self {
            transport,
            state: LinkState::Disconnected,
            characteristics: None,
            pending: None,
            ack_timeout,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// The command awaiting acknowledgement, if any.
    pub fn pending_command(&self) -> Option<&MachineCommand> {
        self.pending.as_ref().map(|p| &p.command)
    }

    /// When the armed acknowledgement timer expires.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            info!("link state {} -> {}", self.state, state);
            self.state = state;
        }
    }

    /// Begin scanning. Does nothing unless disconnected.
    pub fn start(&mut self) -> Result<(), TransportError> {
        if self.state != LinkState::Disconnected {
            debug!("start requested in state {}, ignoring", self.state);
            return Ok(());
        }
        self.transport.start_scan()?;
        self.set_state(LinkState::Scanning);
        Ok(())
    }

    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::PeripheralFound(peripheral) => {
                if self.state != LinkState::Scanning {
                    debug!("ignoring peripheral {:?} in state {}", peripheral.0, self.state);
                    return;
                }
                info!("found launcher {:?}, connecting", peripheral.0);
                match self.transport.connect(&peripheral) {
                    Ok(()) => self.set_state(LinkState::Connecting),
                    Err(e) => {
                        warn!("connect to {:?} failed: {e}", peripheral.0);
                        self.set_state(LinkState::Disconnected);
                    }
                }
            }
            TransportEvent::Connected => {
                if self.state != LinkState::Connecting {
                    debug!("ignoring connected event in state {}", self.state);
                    return;
                }
                if let Err(e) = self.transport.discover_services() {
                    warn!("service discovery failed to start: {e}");
                    self.transport.disconnect();
                    self.set_state(LinkState::Disconnected);
                }
            }
            TransportEvent::ServicesDiscovered(characteristics) => {
                if self.state != LinkState::Connecting {
                    debug!("ignoring discovered services in state {}", self.state);
                    return;
                }
                info!(
                    "launcher ready, command endpoint {:?}",
                    characteristics.command.0
                );
                self.characteristics = Some(characteristics);
                self.set_state(LinkState::ConnectedIdle);
            }
            TransportEvent::Notification {
                characteristic,
                data,
            } => {
                let expected = self.characteristics.as_ref().map(|c| &c.notify);
                if expected != Some(&characteristic) {
                    debug!("ignoring notification from {:?}", characteristic.0);
                    return;
                }
                self.handle_ack_bytes(&data, now);
            }
            TransportEvent::Disconnected { reason } => {
                if self.state == LinkState::Disconnected {
                    return;
                }
                warn!("launcher link lost: {reason}");
                self.resolve(Err(CommandError::LinkLost), now);
                self.characteristics = None;
                self.set_state(LinkState::Disconnected);
            }
        }
    }

    fn handle_ack_bytes(&mut self, data: &[u8], now: Instant) {
        let ack = match AckFrame::from_bytes(data) {
            Ok(ack) => ack,
            Err(e) => {
                // The timer stays armed.
                warn!("discarding acknowledgement {data:02X?}: {e}");
                return;
            }
        };
        let Some(deadline) = self.next_deadline() else {
            debug!("unsolicited acknowledgement {:?}", ack.response_code());
            return;
        };
        if now >= deadline {
            debug!("acknowledgement arrived after deadline");
            self.resolve(Err(CommandError::Timeout), now);
            return;
        }
        let result = match ack.response_code() {
            ResponseCode::Rejected => Err(CommandError::Rejected),
            code => Ok(code),
        };
        self.resolve(result, now);
    }

    /// Write a command and arm its acknowledgement timer.
    pub fn send(&mut self, command: MachineCommand, now: Instant) -> Result<Completion, SendError> {
        match self.state {
            LinkState::AwaitingAck => return Err(SendError::Busy),
            LinkState::ConnectedIdle => {}
            _ => return Err(SendError::NotConnected),
        }
        let characteristic = match &self.characteristics {
            Some(c) => c.command.clone(),
            None => return Err(SendError::NotConnected),
        };
        self.transport.write(&characteristic, &command.to_bytes())?;
        debug!("sent {command}");

        let (tx, rx) = oneshot::channel();
        self.pending = Some(PendingCommand {
            command,
            sent_at: now,
            deadline: now + self.ack_timeout,
            completion: tx,
        });
        self.set_state(LinkState::AwaitingAck);
        Ok(rx)
    }

    /// Expire the pending command if its deadline has passed. Returns true
    /// if a command was resolved.
    pub fn poll_timeout(&mut self, now: Instant) -> bool {
        match self.next_deadline() {
            Some(deadline) if now >= deadline => {
                warn!("no acknowledgement within {:?}", self.ack_timeout);
                self.resolve(Err(CommandError::Timeout), now)
            }
            _ => false,
        }
    }

    /// Cancel any pending command, drop the connection and go idle.
    pub fn shutdown(&mut self) {
        self.resolve(Err(CommandError::Cancelled), Instant::now());
        if self.state != LinkState::Disconnected {
            self.transport.disconnect();
        }
        self.characteristics = None;
        self.set_state(LinkState::Disconnected);
    }

    fn resolve(&mut self, result: CommandResult, now: Instant) -> bool {
        let Some(pending) = self.pending.take() else {
            return false;
        };
        if self.state == LinkState::AwaitingAck {
            self.set_state(LinkState::ConnectedIdle);
        }
        let elapsed = now.saturating_duration_since(pending.sent_at);
        match &result {
            Ok(code) => info!("command acknowledged ({code:?}) after {elapsed:?}"),
            Err(e) => warn!("command {} failed after {elapsed:?}: {e}", pending.command),
        }
        if pending.completion.send(result).is_err() {
            debug!("completion receiver already dropped");
        }
        true
    }
}

impl<T: Transport> CommandSink for LinkSession<T> {
    fn submit(&mut self, command: MachineCommand) -> Result<Completion, SendError> {
        self.send(command, Instant::now())
    }
}

/// A [`CommandSink`] that sends at a time chosen by the caller.
pub struct SinkAt<'a, T: Transport> {
    session: &'a mut LinkSession<T>,
    now: Instant,
}

impl<T: Transport> LinkSession<T> {
    pub fn sink_at(&mut self, now: Instant) -> SinkAt<'_, T> {
        SinkAt { session: self, now }
    }
}

impl<T: Transport> CommandSink for SinkAt<'_, T> {
    fn submit(&mut self, command: MachineCommand) -> Result<Completion, SendError> {
        self.session.send(command, self.now)
    }
}

impl<T: Transport> Drop for LinkSession<T> {
    fn drop(&mut self) {
        self.resolve(Err(CommandError::Cancelled), Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot::error::TryRecvError;

    #[derive(Default)]
    struct FakeTransport {
        scans: usize,
        connects: Vec<PeripheralId>,
        discoveries: usize,
        writes: Vec<(CharacteristicId, Vec<u8>)>,
        disconnects: usize,
        fail_writes: bool,
    }

    impl Transport for FakeTransport {
        fn start_scan(&mut self) -> Result<(), TransportError> {
            self.scans += 1;
            Ok(())
        }
        fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
            self.connects.push(peripheral.clone());
            Ok(())
        }
        fn discover_services(&mut self) -> Result<(), TransportError> {
            self.discoveries += 1;
            Ok(())
        }
        fn write(
            &mut self,
            characteristic: &CharacteristicId,
            frame: &[u8],
        ) -> Result<(), TransportError> {
            if self.fail_writes {
                return Err(TransportError::Closed);
            }
            self.writes.push((characteristic.clone(), frame.to_vec()));
            Ok(())
        }
        fn disconnect(&mut self) {
            self.disconnects += 1;
        }
    }

    fn characteristics() -> Characteristics {
        Characteristics {
            command: CharacteristicId("cmd".into()),
            notify: CharacteristicId("notify".into()),
        }
    }

    fn ack(code: ResponseCode) -> TransportEvent {
        TransportEvent::Notification {
            characteristic: characteristics().notify,
            data: Bytes::copy_from_slice(&AckFrame::new(code).to_bytes()),
        }
    }

    fn raw(data: &[u8]) -> TransportEvent {
        TransportEvent::Notification {
            characteristic: characteristics().notify,
            data: Bytes::copy_from_slice(data),
        }
    }

    fn connected_session(now: Instant) -> eyre::Result<LinkSession<FakeTransport>> {
        let mut session = LinkSession::new(FakeTransport::default(), DEFAULT_ACK_TIMEOUT);
        session.start()?;
        session.handle_event(TransportEvent::PeripheralFound(PeripheralId("launcher".into())), now);
        session.handle_event(TransportEvent::Connected, now);
        session.handle_event(TransportEvent::ServicesDiscovered(characteristics()), now);
        assert_eq!(session.state(), LinkState::ConnectedIdle);
        Ok(session)
    }

    fn command() -> MachineCommand {
        MachineCommand::new(63, 63, 45, 45, 50, launcher_protocol::Control::Launch)
    }

    fn ms(t0: Instant, millis: u64) -> Instant {
        t0 + Duration::from_millis(millis)
    }

    #[test]
    fn connection_sequence() -> eyre::Result<()> {
        let t0 = Instant::now();
        let mut session = LinkSession::new(FakeTransport::default(), DEFAULT_ACK_TIMEOUT);
        assert!(matches!(
            session.send(command(), t0),
            Err(SendError::NotConnected)
        ));

        session.start()?;
        assert_eq!(session.state(), LinkState::Scanning);
        assert!(matches!(
            session.send(command(), t0),
            Err(SendError::NotConnected)
        ));

        session.handle_event(TransportEvent::PeripheralFound(PeripheralId("launcher".into())), t0);
        assert_eq!(session.state(), LinkState::Connecting);
        assert_eq!(session.transport().connects.len(), 1);

        session.handle_event(TransportEvent::Connected, t0);
        assert_eq!(session.transport().discoveries, 1);
        assert!(matches!(
            session.send(command(), t0),
            Err(SendError::NotConnected)
        ));

        session.handle_event(TransportEvent::ServicesDiscovered(characteristics()), t0);
        assert_eq!(session.state(), LinkState::ConnectedIdle);
        assert!(session.transport().writes.is_empty());
        Ok(())
    }

    #[test]
    fn send_writes_frame_and_success_resolves() -> eyre::Result<()> {
        let t0 = Instant::now();
        let mut session = connected_session(t0)?;
        let mut completion = session.send(command(), t0)?;
        assert_eq!(session.state(), LinkState::AwaitingAck);
        assert_eq!(session.next_deadline(), Some(ms(t0, 2000)));
        assert_eq!(
            session.transport().writes,
            vec![(characteristics().command, command().to_bytes().to_vec())]
        );
        assert_eq!(completion.try_recv(), Err(TryRecvError::Empty));

        session.handle_event(ack(ResponseCode::Accepted), ms(t0, 150));
        assert_eq!(completion.try_recv(), Ok(Ok(ResponseCode::Accepted)));
        assert_eq!(session.state(), LinkState::ConnectedIdle);
        assert_eq!(session.next_deadline(), None);
        assert!(!session.poll_timeout(ms(t0, 5000)));
        Ok(())
    }

    #[test]
    fn completed_counts_as_success() -> eyre::Result<()> {
        let t0 = Instant::now();
        let mut session = connected_session(t0)?;
        let mut completion = session.send(command(), t0)?;
        session.handle_event(ack(ResponseCode::Completed), ms(t0, 10));
        assert_eq!(completion.try_recv(), Ok(Ok(ResponseCode::Completed)));
        Ok(())
    }

    #[test]
    fn rejected_resolves_failure() -> eyre::Result<()> {
        let t0 = Instant::now();
        let mut session = connected_session(t0)?;
        let mut completion = session.send(command(), t0)?;
        session.handle_event(ack(ResponseCode::Rejected), ms(t0, 10));
        assert_eq!(completion.try_recv(), Ok(Err(CommandError::Rejected)));
        assert_eq!(session.state(), LinkState::ConnectedIdle);
        Ok(())
    }

    #[test]
    fn second_send_is_busy() -> eyre::Result<()> {
        let t0 = Instant::now();
        let mut session = connected_session(t0)?;
        let mut first = session.send(command(), t0)?;
        let other = MachineCommand::stop();
        assert!(matches!(
            session.send(other, ms(t0, 5)),
            Err(SendError::Busy)
        ));
        assert_eq!(session.transport().writes.len(), 1);
        assert_eq!(session.pending_command(), Some(&command()));
        assert_eq!(session.next_deadline(), Some(ms(t0, 2000)));

        session.handle_event(ack(ResponseCode::Accepted), ms(t0, 100));
        assert_eq!(first.try_recv(), Ok(Ok(ResponseCode::Accepted)));
        let _second = session.send(other, ms(t0, 200))?;
        assert_eq!(session.transport().writes.len(), 2);
        Ok(())
    }

    #[test]
    fn ack_just_before_deadline_wins() -> eyre::Result<()> {
        let t0 = Instant::now();
        let mut session = connected_session(t0)?;
        let mut completion = session.send(command(), t0)?;
        session.handle_event(ack(ResponseCode::Accepted), ms(t0, 1999));
        assert!(!session.poll_timeout(ms(t0, 2000)));
        assert_eq!(completion.try_recv(), Ok(Ok(ResponseCode::Accepted)));
        Ok(())
    }

    #[test]
    fn ack_after_deadline_times_out_once() -> eyre::Result<()> {
        let t0 = Instant::now();
        let mut session = connected_session(t0)?;
        let mut completion = session.send(command(), t0)?;
        // Timer not yet polled when the late ack arrives.
        session.handle_event(ack(ResponseCode::Accepted), ms(t0, 2001));
        assert!(!session.poll_timeout(ms(t0, 2001)));
        assert_eq!(completion.try_recv(), Ok(Err(CommandError::Timeout)));
        assert_eq!(session.state(), LinkState::ConnectedIdle);
        Ok(())
    }

    #[test]
    fn timer_fires_then_late_ack_ignored() -> eyre::Result<()> {
        let t0 = Instant::now();
        let mut session = connected_session(t0)?;
        let mut completion = session.send(command(), t0)?;
        assert!(!session.poll_timeout(ms(t0, 1999)));
        assert!(session.poll_timeout(ms(t0, 2000)));
        session.handle_event(ack(ResponseCode::Accepted), ms(t0, 2001));
        assert_eq!(completion.try_recv(), Ok(Err(CommandError::Timeout)));
        assert_eq!(session.state(), LinkState::ConnectedIdle);
        Ok(())
    }

    #[test]
    fn malformed_acks_are_ignored() -> eyre::Result<()> {
        let t0 = Instant::now();
        let mut session = connected_session(t0)?;
        let mut completion = session.send(command(), t0)?;

        let mut bad_crc = AckFrame::new(ResponseCode::Accepted).to_bytes();
        bad_crc[4] ^= 0xFF;
        session.handle_event(raw(&bad_crc), ms(t0, 10));
        session.handle_event(raw(&[0x5A, 0xA5, 0x82, 0x01]), ms(t0, 20));
        session.handle_event(raw(&[0x00, 0xA5, 0x82, 0x01, 0xA3]), ms(t0, 30));
        // Well-formed ack on an unexpected endpoint.
        session.handle_event(
            TransportEvent::Notification {
                characteristic: CharacteristicId("other".into()),
                data: Bytes::copy_from_slice(&AckFrame::new(ResponseCode::Accepted).to_bytes()),
            },
            ms(t0, 40),
        );

        assert_eq!(completion.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(session.state(), LinkState::AwaitingAck);
        assert_eq!(session.next_deadline(), Some(ms(t0, 2000)));

        assert!(session.poll_timeout(ms(t0, 2000)));
        assert_eq!(completion.try_recv(), Ok(Err(CommandError::Timeout)));
        Ok(())
    }

    #[test]
    fn disconnect_fails_pending_with_link_lost() -> eyre::Result<()> {
        let t0 = Instant::now();
        let mut session = connected_session(t0)?;
        let mut completion = session.send(command(), t0)?;
        session.handle_event(
            TransportEvent::Disconnected {
                reason: "out of range".into(),
            },
            ms(t0, 500),
        );
        assert_eq!(completion.try_recv(), Ok(Err(CommandError::LinkLost)));
        assert_eq!(session.state(), LinkState::Disconnected);
        assert_eq!(session.next_deadline(), None);
        assert!(!session.poll_timeout(ms(t0, 3000)));
        assert!(matches!(
            session.send(command(), ms(t0, 600)),
            Err(SendError::NotConnected)
        ));
        Ok(())
    }

    #[test]
    fn reconnect_requires_rediscovery() -> eyre::Result<()> {
        let t0 = Instant::now();
        let mut session = connected_session(t0)?;
        session.handle_event(
            TransportEvent::Disconnected {
                reason: "reset".into(),
            },
            t0,
        );
        session.start()?;
        session.handle_event(TransportEvent::PeripheralFound(PeripheralId("launcher".into())), t0);
        session.handle_event(TransportEvent::Connected, t0);
        assert!(matches!(
            session.send(command(), t0),
            Err(SendError::NotConnected)
        ));
        assert_eq!(session.transport().discoveries, 2);

        session.handle_event(TransportEvent::ServicesDiscovered(characteristics()), t0);
        let _completion = session.send(command(), t0)?;
        assert_eq!(session.state(), LinkState::AwaitingAck);
        Ok(())
    }

    #[test]
    fn write_failure_leaves_session_idle() -> eyre::Result<()> {
        let t0 = Instant::now();
        let mut session = connected_session(t0)?;
        session.transport_mut().fail_writes = true;
        assert!(matches!(
            session.send(command(), t0),
            Err(SendError::Transport(TransportError::Closed))
        ));
        assert_eq!(session.state(), LinkState::ConnectedIdle);
        assert_eq!(session.next_deadline(), None);
        Ok(())
    }

    #[test]
    fn shutdown_and_drop_cancel_pending() -> eyre::Result<()> {
        let t0 = Instant::now();
        let mut session = connected_session(t0)?;
        let mut completion = session.send(command(), t0)?;
        session.shutdown();
        assert_eq!(completion.try_recv(), Ok(Err(CommandError::Cancelled)));
        assert_eq!(session.state(), LinkState::Disconnected);
        assert_eq!(session.transport().disconnects, 1);

        let mut session = connected_session(t0)?;
        let mut completion = session.send(command(), t0)?;
        drop(session);
        assert_eq!(completion.try_recv(), Ok(Err(CommandError::Cancelled)));
        Ok(())
    }

    #[test]
    fn events_out_of_order_are_ignored() -> eyre::Result<()> {
        let t0 = Instant::now();
        let mut session = LinkSession::new(FakeTransport::default(), DEFAULT_ACK_TIMEOUT);
        session.handle_event(TransportEvent::Connected, t0);
        session.handle_event(TransportEvent::ServicesDiscovered(characteristics()), t0);
        assert_eq!(session.state(), LinkState::Disconnected);
        session.handle_event(ack(ResponseCode::Accepted), t0);
        assert_eq!(session.state(), LinkState::Disconnected);
        Ok(())
    }

    #[test]
    fn sink_at_arms_deadline_from_given_time() -> eyre::Result<()> {
        let t0 = Instant::now();
        let mut session = connected_session(t0)?;
        let sent_at = ms(t0, 500);
        let completion = session.sink_at(sent_at).submit(command());
        assert!(completion.is_ok());
        assert_eq!(session.next_deadline(), Some(sent_at + DEFAULT_ACK_TIMEOUT));
        assert!(matches!(
            session.sink_at(ms(t0, 600)).submit(command()),
            Err(SendError::Busy)
        ));
        Ok(())
    }
}
