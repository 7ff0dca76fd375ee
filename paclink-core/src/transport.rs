//! KISS over TCP: the one async component.
//!
//! The endpoint owns the socket. Decoded frames are delivered through an
//! mpsc channel in transport order; outbound frames are serialized through
//! a second channel so only one writer ever touches the socket. The
//! protocol thread stays synchronous; it never sees the socket.

use crate::error::CoreError;
use paclink_proto::frame::Ax25Frame;
use paclink_proto::kiss::{self, KissCodec};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct KissEndpointConfig {
    pub host: String,
    pub port: u16,
    /// TNC port (channel) outbound frames are stamped with.
    pub channel: u8,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl Default for KissEndpointConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8001,
            channel: 0,
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
        }
    }
}

/// A decoded inbound frame together with the TNC port it arrived on.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub port: u8,
    pub frame: Ax25Frame,
}

/// Connection lifecycle notifications for the embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
}

/// The KISS/TCP endpoint.
pub struct KissEndpoint {
    config: KissEndpointConfig,
}

impl KissEndpoint {
    pub fn new(config: KissEndpointConfig) -> Self {
        Self { config }
    }

    /// Runs the connect/read/write loop until `outbound` closes.
    ///
    /// Reconnects with capped exponential backoff. Frames that fail to
    /// decode as AX.25 are counted and dropped; the loop itself survives
    /// any input.
    pub async fn run(
        self,
        frames: mpsc::Sender<InboundFrame>,
        mut outbound: mpsc::Receiver<Vec<u8>>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), CoreError> {
        let mut backoff = self.config.reconnect_min;
        loop {
            let address = format!("{}:{}", self.config.host, self.config.port);
            let stream = match TcpStream::connect(&address).await {
                Ok(stream) => {
                    info!(%address, "KISS endpoint connected");
                    backoff = self.config.reconnect_min;
                    let _ = events.send(TransportEvent::Connected).await;
                    stream
                }
                Err(err) => {
                    warn!(%address, %err, "KISS connect failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.reconnect_max);
                    continue;
                }
            };

            let disconnected = self
                .drive_connection(stream, &frames, &mut outbound)
                .await?;
            let _ = events.send(TransportEvent::Disconnected).await;
            if !disconnected {
                // The outbound channel closed: the engine is shutting down.
                return Ok(());
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.reconnect_max);
        }
    }

    /// Returns true when the socket dropped (reconnect), false when the
    /// outbound channel closed (shut down).
    async fn drive_connection(
        &self,
        stream: TcpStream,
        frames: &mpsc::Sender<InboundFrame>,
        outbound: &mut mpsc::Receiver<Vec<u8>>,
    ) -> Result<bool, CoreError> {
        let (mut reader, mut writer) = stream.into_split();
        let mut codec = KissCodec::new();
        let mut read_buf = vec![0u8; 4096];
        loop {
            tokio::select! {
                read = reader.read(&mut read_buf) => {
                    match read {
                        Ok(0) => return Ok(true),
                        Ok(n) => {
                            for kiss_frame in codec.feed(&read_buf[..n]) {
                                if kiss_frame.command != kiss::CMD_DATA {
                                    continue;
                                }
                                match Ax25Frame::decode(&kiss_frame.payload) {
                                    Ok(frame) => {
                                        let inbound = InboundFrame {
                                            port: kiss_frame.port,
                                            frame,
                                        };
                                        if frames.send(inbound).await.is_err() {
                                            return Ok(false);
                                        }
                                    }
                                    Err(err) => {
                                        debug!(%err, "dropping undecodable frame");
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            warn!(%err, "KISS read error");
                            return Ok(true);
                        }
                    }
                }
                to_send = outbound.recv() => {
                    match to_send {
                        Some(raw) => {
                            let encoded = kiss::encode(self.config.channel, &raw);
                            if let Err(err) = writer.write_all(&encoded).await {
                                warn!(%err, "KISS write error");
                                return Ok(true);
                            }
                        }
                        None => return Ok(false),
                    }
                }
            }
        }
    }
}
