//! Tokio host for a [`SessionDispatcher`] over one CM TCP connection.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;

use crate::crypt::KeyExchange;
use crate::dispatcher::{
    FrameSink, HeartbeatScheduler, IncomingMessage, LogOnDetails, OutgoingMessage, Replies,
    SessionDispatcher, SessionEvent,
};
use crate::emsg::EMsg;
use crate::error::ProtocolError;
use crate::frame::{self, FRAME_HEADER_LEN};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
enum Command {
    Send(OutgoingMessage),
    LogOn(LogOnDetails),
}

/// Forwards encoded frames to the writer task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    frames: mpsc::UnboundedSender<Vec<u8>>,
}

impl FrameSink for ChannelSink {
    fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        self.frames.send(frame).map_err(|_| ProtocolError::SinkClosed)
    }
}

/// Holds the heartbeat interval until the run loop picks it up.
#[derive(Debug, Default)]
pub struct HeartbeatSlot {
    interval: Option<Duration>,
}

impl HeartbeatScheduler for HeartbeatSlot {
    fn schedule_heartbeat(&mut self, interval: Duration) {
        self.interval = Some(interval);
    }
}

/// Command side of a running [`CmConnection`].
#[derive(Debug, Clone)]
pub struct CmHandle {
    commands: mpsc::Sender<Command>,
}

impl CmHandle {
    pub async fn send(&self, message: OutgoingMessage) -> Result<(), ProtocolError> {
        self.commands.send(Command::Send(message)).await.map_err(|_| ProtocolError::SinkClosed)
    }

    pub async fn log_on(&self, details: LogOnDetails) -> Result<(), ProtocolError> {
        self.commands.send(Command::LogOn(details)).await.map_err(|_| ProtocolError::SinkClosed)
    }
}

pub struct CmConnection {
    addr: String,
    stream: TcpStream,
    dispatcher: SessionDispatcher<ChannelSink, HeartbeatSlot>,
    frames: mpsc::UnboundedReceiver<Vec<u8>>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
}

impl CmConnection {
    /// Connects using the backend's public key for the handshake.
    pub async fn connect(
        addr: &str,
        cancel: CancellationToken,
    ) -> Result<(Self, CmHandle, mpsc::Receiver<SessionEvent>), ProtocolError> {
        Self::connect_with(addr, KeyExchange::backend()?, cancel).await
    }

    pub async fn connect_with(
        addr: &str,
        exchange: KeyExchange,
        cancel: CancellationToken,
    ) -> Result<(Self, CmHandle, mpsc::Receiver<SessionEvent>), ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        log::info!("cm: connected to <{}>", addr);

        let (frames_tx, frames) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::channel(CHANNEL_CAPACITY);
        let (events, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let sink = ChannelSink { frames: frames_tx };
        let dispatcher = SessionDispatcher::new(exchange, sink, HeartbeatSlot::default());

        let connection =
            Self { addr: addr.to_string(), stream, dispatcher, frames, commands, events, cancel };
        Ok((connection, CmHandle { commands: commands_tx }, events_rx))
    }

    pub fn with_protocol_version(mut self, protocol_version: u32) -> Self {
        self.dispatcher = self.dispatcher.with_protocol_version(protocol_version);
        self
    }

    pub fn register<F>(&mut self, emsg: EMsg, handler: F)
    where
        F: FnMut(&IncomingMessage<'_>, &mut Replies) + Send + 'static,
    {
        self.dispatcher.register(emsg, handler);
    }

    /// Drives the connection until it is cancelled, the peer closes it or a
    /// protocol error occurs.
    pub async fn run(self) -> Result<(), ProtocolError> {
        let Self { addr, stream, mut dispatcher, frames, mut commands, events, cancel } = self;
        let (read_half, write_half) = stream.into_split();
        let stop = CancellationToken::new();

        let (inbound_tx, mut inbound) = mpsc::channel(CHANNEL_CAPACITY);
        let rx_task = tokio::spawn(read_frames(read_half, inbound_tx, stop.clone()));
        let tx_task = tokio::spawn(write_frames(write_half, frames, stop.clone()));

        dispatcher.connected();
        let mut heartbeat: Option<Interval> = None;

        let result = loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = stop.cancelled() => break Ok(()),
                frame = inbound.recv() => match frame {
                    Some(Ok(frame)) => feed(&mut dispatcher, &frame),
                    Some(Err(err)) => Err(err),
                    None => break Ok(()),
                },
                Some(command) = commands.recv() => match command {
                    Command::Send(message) => dispatcher.send_message(message),
                    Command::LogOn(details) => dispatcher.log_on(&details),
                },
                _ = tick(&mut heartbeat) => dispatcher.heartbeat(),
            };

            if let Err(err) = step {
                break Err(err);
            }

            if let Some(interval) = dispatcher.scheduler_mut().interval.take() {
                log::debug!("cm: heartbeat every {:?}", interval);
                heartbeat = Some(tokio::time::interval_at(Instant::now() + interval, interval));
            }

            while let Some(event) = dispatcher.take_event() {
                let _ = events.send(event).await;
            }
        };

        stop.cancel();
        let _ = rx_task.await;
        let _ = tx_task.await;

        match &result {
            Ok(()) => log::info!("cm: disconnected from <{}>", addr),
            Err(ProtocolError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                log::info!("cm: <{}> closed the connection", addr);
                return Ok(());
            }
            Err(err) => log::warn!("cm: dropping connection to <{}>: {}", addr, err),
        }
        result
    }
}

fn feed(
    dispatcher: &mut SessionDispatcher<ChannelSink, HeartbeatSlot>,
    frame: &[u8],
) -> Result<(), ProtocolError> {
    dispatcher.readable(&frame[..FRAME_HEADER_LEN])?;
    dispatcher.readable(&frame[FRAME_HEADER_LEN..])?;
    Ok(())
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn read_frame(stream: &mut OwnedReadHalf) -> Result<Vec<u8>, ProtocolError> {
    let mut frame = vec![0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut frame).await?;
    let len = frame::decode_header(&frame)?;
    frame.resize(FRAME_HEADER_LEN + len, 0);
    stream.read_exact(&mut frame[FRAME_HEADER_LEN..]).await?;
    Ok(frame)
}

async fn read_frames(
    mut stream: OwnedReadHalf,
    inbound: mpsc::Sender<Result<Vec<u8>, ProtocolError>>,
    stop: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => break,
            frame = read_frame(&mut stream) => frame,
        };
        let failed = frame.is_err();
        if inbound.send(frame).await.is_err() || failed {
            break;
        }
    }
}

async fn write_frames(
    mut stream: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    stop: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(err) = stream.write_all(&frame).await {
            log::warn!("cm: write failed: {}", err);
            stop.cancel();
            break;
        }
        if let Err(err) = stream.flush().await {
            log::warn!("cm: flush failed: {}", err);
            stop.cancel();
            break;
        }
    }
}
