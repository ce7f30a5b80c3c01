//! [Transport] over a serial radio bridge.
//!
//! The bridge has no discovery of its own. Opening the port counts as finding
//! the launcher, and the command/notify endpoints are fixed names. The port is
//! owned by a background task, so every [Transport] method only enqueues a
//! request and results arrive later on the event channel.

use bytes::Bytes;
use color_eyre::eyre::Result;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::codec::Framed;
use tracing as log;

use launcher_link::{
    CharacteristicId, Characteristics, PeripheralId, Transport, TransportError, TransportEvent,
};
use launcher_protocol::{LauncherCodec, MachineCommand};

pub(crate) const COMMAND_ENDPOINT: &str = "serial-tx";
pub(crate) const NOTIFY_ENDPOINT: &str = "serial-rx";

const WRITE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug)]
enum Request {
    Open,
    Connect,
    Discover,
    Write(MachineCommand),
    Close,
}

/// Handle held by the link session.
pub(crate) struct SerialTransport {
    req_tx: mpsc::UnboundedSender<Request>,
}

impl SerialTransport {
    fn request(&self, req: Request) -> Result<(), TransportError> {
        self.req_tx.send(req).map_err(|_| TransportError::Closed)
    }
}

impl Transport for SerialTransport {
    fn start_scan(&mut self) -> Result<(), TransportError> {
        self.request(Request::Open)
    }

    fn connect(&mut self, _peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.request(Request::Connect)
    }

    fn discover_services(&mut self) -> Result<(), TransportError> {
        self.request(Request::Discover)
    }

    fn write(&mut self, characteristic: &CharacteristicId, frame: &[u8]) -> Result<(), TransportError> {
        if characteristic.0 != COMMAND_ENDPOINT {
            return Err(TransportError::Io(format!(
                "no writable endpoint {:?}",
                characteristic.0
            )));
        }
        let cmd = MachineCommand::from_bytes(frame)
            .map_err(|e| TransportError::Io(format!("refusing to write frame: {e}")))?;
        self.request(Request::Write(cmd))
    }

    fn disconnect(&mut self) {
        if self.request(Request::Close).is_err() {
            log::debug!("serial task already stopped");
        }
    }
}

/// Create the transport handle and the task that owns the serial port.
///
/// The returned future must be spawned. It runs until the handle is dropped
/// or the event receiver closes.
pub(crate) fn serial_transport(
    port_path: String,
    baud_rate: u32,
    events_tx: mpsc::Sender<TransportEvent>,
) -> (SerialTransport, impl std::future::Future<Output = Result<()>>) {
    let opener = move || -> std::io::Result<SerialStream> {
        let port = tokio_serial::new(&port_path, baud_rate).open_native_async()?;
        Ok(port)
    };
    let name = PeripheralId(format!("serial bridge at {baud_rate} baud"));
    transport_with(opener, name, events_tx)
}

fn transport_with<S, F>(
    opener: F,
    name: PeripheralId,
    events_tx: mpsc::Sender<TransportEvent>,
) -> (SerialTransport, impl std::future::Future<Output = Result<()>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut() -> std::io::Result<S>,
{
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let task = run_serial_link(req_rx, events_tx, opener, name);
    (SerialTransport { req_tx }, task)
}

enum Port<S> {
    Closed,
    Opened(S),
    Connected {
        device_tx: SplitSink<Framed<S, LauncherCodec>, MachineCommand>,
        device_rx: SplitStream<Framed<S, LauncherCodec>>,
    },
}

enum Wake {
    Request(Option<Request>),
    Inbound(Option<std::io::Result<Bytes>>),
}

async fn next_inbound<S>(port: &mut Port<S>) -> Option<std::io::Result<Bytes>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match port {
        Port::Connected { device_rx, .. } => device_rx.next().await,
        _ => std::future::pending().await,
    }
}

#[tracing::instrument(skip_all)]
async fn run_serial_link<S, F>(
    mut req_rx: mpsc::UnboundedReceiver<Request>,
    events_tx: mpsc::Sender<TransportEvent>,
    mut opener: F,
    name: PeripheralId,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut() -> std::io::Result<S>,
{
    let mut port: Port<S> = Port::Closed;
    loop {
        let wake = tokio::select! {
            req = req_rx.recv() => Wake::Request(req),
            inbound = next_inbound(&mut port) => Wake::Inbound(inbound),
        };

        let event = match wake {
            Wake::Request(None) => break,
            Wake::Request(Some(req)) => {
                log::trace!("serial request {req:?}");
                handle_request(req, &mut port, &mut opener, &name).await
            }
            Wake::Inbound(Some(Ok(data))) => Some(TransportEvent::Notification {
                characteristic: CharacteristicId(NOTIFY_ENDPOINT.into()),
                data,
            }),
            Wake::Inbound(Some(Err(e))) => {
                port = Port::Closed;
                Some(TransportEvent::Disconnected {
                    reason: format!("serial read failed: {e}"),
                })
            }
            Wake::Inbound(None) => {
                port = Port::Closed;
                Some(TransportEvent::Disconnected {
                    reason: "serial port closed".into(),
                })
            }
        };

        if let Some(event) = event {
            if events_tx.send(event).await.is_err() {
                log::debug!("transport event receiver closed");
                break;
            }
        }
    }
    Ok(())
}

async fn handle_request<S, F>(
    req: Request,
    port: &mut Port<S>,
    opener: &mut F,
    name: &PeripheralId,
) -> Option<TransportEvent>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut() -> std::io::Result<S>,
{
    let lost = |reason: String| Some(TransportEvent::Disconnected { reason });
    match req {
        Request::Open => {
            *port = Port::Closed;
            match opener() {
                Ok(stream) => {
                    *port = Port::Opened(stream);
                    Some(TransportEvent::PeripheralFound(name.clone()))
                }
                Err(e) => lost(format!("cannot open serial port: {e}")),
            }
        }
        Request::Connect => match std::mem::replace(port, Port::Closed) {
            Port::Opened(stream) => {
                let (device_tx, device_rx) = Framed::new(stream, LauncherCodec::new()).split();
                *port = Port::Connected {
                    device_tx,
                    device_rx,
                };
                Some(TransportEvent::Connected)
            }
            _ => lost("connect requested before the port was opened".into()),
        },
        Request::Discover => match port {
            Port::Connected { .. } => Some(TransportEvent::ServicesDiscovered(Characteristics {
                command: CharacteristicId(COMMAND_ENDPOINT.into()),
                notify: CharacteristicId(NOTIFY_ENDPOINT.into()),
            })),
            _ => lost("discovery requested without a connection".into()),
        },
        Request::Write(cmd) => {
            let Port::Connected { device_tx, .. } = port else {
                return lost("write requested without a connection".into());
            };
            match tokio::time::timeout(WRITE_TIMEOUT, device_tx.send(cmd)).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => {
                    *port = Port::Closed;
                    lost(format!("serial write failed: {e}"))
                }
                Err(_) => {
                    *port = Port::Closed;
                    lost("serial write timed out".into())
                }
            }
        }
        Request::Close => {
            *port = Port::Closed;
            None
        }
    }
}
