//! The Postgres replication source.
//!
//! [`PgSource`] implements the core's [`ReplicationSource`] over a
//! [`ReplicationTransport`]: the transport owns the actual replication
//! connection (an external collaborator), while this layer owns message
//! decoding, transaction assembly, resume positions, and the
//! exponential-backoff reconnect loop.

use async_trait::async_trait;
use tracing::{info, warn};

use shapestream_core::collector::{ReplicationError, ReplicationSource, SourceEvent};
use shapestream_core::offset::Lsn;

use crate::config::PgReplicationConfig;
use crate::decoder::decode;
use crate::stream::TxnAssembler;

// ---------------------------------------------------------------------------
// ReplicationTransport
// ---------------------------------------------------------------------------

/// The wire side of a replication connection.
///
/// Implementations manage the Postgres session (`START_REPLICATION` on
/// the configured slot and publication) and deliver raw `pgoutput`
/// message payloads.
#[async_trait]
pub trait ReplicationTransport: Send {
    /// (Re)establishes the connection, resuming the stream at
    /// `start_lsn`.
    async fn connect(&mut self, start_lsn: Lsn) -> std::io::Result<()>;

    /// Receives the next `pgoutput` payload; `None` on clean shutdown.
    async fn recv(&mut self) -> std::io::Result<Option<Vec<u8>>>;

    /// Reports the durably flushed position upstream (standby status
    /// update), letting the server discard WAL.
    async fn send_status(&mut self, flushed: Lsn) -> std::io::Result<()>;
}

// ---------------------------------------------------------------------------
// PgSource
// ---------------------------------------------------------------------------

/// A [`ReplicationSource`] over a `pgoutput` transport.
pub struct PgSource<T: ReplicationTransport> {
    transport: T,
    config: PgReplicationConfig,
    assembler: TxnAssembler,
    /// Highest LSN confirmed durable across all shapes; the resume
    /// position for reconnects.
    resume_lsn: Lsn,
    connected: bool,
}

impl<T: ReplicationTransport> PgSource<T> {
    /// Creates a source resuming from `resume_lsn` (the highest
    /// committed LSN across active shapes at startup).
    #[must_use]
    pub fn new(transport: T, config: PgReplicationConfig, resume_lsn: Lsn) -> Self {
        let assembler = TxnAssembler::new(config.replica_identity_check);
        Self {
            transport,
            config,
            assembler,
            resume_lsn,
            connected: false,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &PgReplicationConfig {
        &self.config
    }

    /// Returns the current resume position.
    #[must_use]
    pub fn resume_lsn(&self) -> Lsn {
        self.resume_lsn
    }

    /// Returns the transaction assembler (partition parentage feed).
    pub fn assembler_mut(&mut self) -> &mut TxnAssembler {
        &mut self.assembler
    }

    /// Connects with doubling backoff, bounded by `max_backoff`.
    async fn connect_with_backoff(&mut self) -> Result<(), ReplicationError> {
        let mut delay = self.config.initial_backoff;
        let mut attempts = 0u32;
        loop {
            match self.transport.connect(self.resume_lsn).await {
                Ok(()) => {
                    info!(
                        publication = %self.config.publication_name,
                        slot = %self.config.slot_name,
                        resume = %self.resume_lsn,
                        "replication connected"
                    );
                    self.connected = true;
                    return Ok(());
                }
                Err(err) => {
                    attempts += 1;
                    if let Some(max) = self.config.max_connect_attempts {
                        if attempts >= max {
                            return Err(ReplicationError::Disconnected(format!(
                                "gave up after {attempts} attempts: {err}"
                            )));
                        }
                    }
                    warn!(%err, ?delay, attempts, "replication connect failed; backing off");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.max_backoff);
                }
            }
        }
    }
}

#[async_trait]
impl<T: ReplicationTransport> ReplicationSource for PgSource<T> {
    async fn next_event(&mut self) -> Result<SourceEvent, ReplicationError> {
        loop {
            if !self.connected {
                self.connect_with_backoff().await?;
            }
            match self.transport.recv().await {
                Ok(Some(bytes)) => {
                    let msg = decode(&bytes)
                        .map_err(|e| ReplicationError::Protocol(e.to_string()))?;
                    let event = self
                        .assembler
                        .handle_message(msg)
                        .map_err(|e| ReplicationError::Protocol(e.to_string()))?;
                    if let Some(event) = event {
                        return Ok(event);
                    }
                }
                Ok(None) => return Err(ReplicationError::EndOfStream),
                Err(err) => {
                    warn!(%err, resume = %self.resume_lsn, "replication disconnected");
                    self.connected = false;
                }
            }
        }
    }

    async fn acknowledge(&mut self, lsn: Lsn) -> Result<(), ReplicationError> {
        self.resume_lsn = lsn;
        if let Err(err) = self.transport.send_status(lsn).await {
            // The next recv will surface the broken connection; the
            // status update rides again after reconnect.
            warn!(%err, %lsn, "failed to send standby status");
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
