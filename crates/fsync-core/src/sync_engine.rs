//! SyncEngine: drives one sync session in either role.
//!
//! Listener (accepts, receives files):
//!
//! 1. Handshake, then send our fingerprints for the whole directory
//! 2. Receive the fingerprints the initiator has and we lack
//! 3. Ask the operator, send the Boolean answer
//! 4. If accepted, download one file per fingerprint, in list order
//!
//! Initiator (dials, sends files):
//!
//! 1. Fingerprint local files matching the requested patterns
//! 2. Handshake, receive the listener's fingerprints
//! 3. Send `unique_to(local, remote)`, wait for the answer
//! 4. If accepted, upload each file in the same list order
//!
//! No file name travels with the chunk stream. Both sides walk the one list
//! that was exchanged, so [`SyncEngine::push_batch`] and
//! [`SyncEngine::receive_batch`] each own the list and its transfer loop.

use crate::confirm::{Confirm, TransferOffer};
use crate::fingerprint::{self, DirectoryScope, FileFingerprint};
use crate::peers::{PeerAddress, PeerStore};
use crate::sync::{
    InitiatorState, ListenOutcome, ListenerState, PeerReport, PushOutcome, Result, SyncConfig,
    SyncError, SyncStep, during,
};
use crate::transport::{self, NoProgress, TransferProgress, Transport};

use std::collections::HashSet;
use std::net::SocketAddr;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// A bound socket waiting for a single sync session.
#[derive(Debug)]
pub struct SyncListener {
    listener: TcpListener,
}

impl SyncListener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| SyncError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

pub struct SyncEngine {
    scope: DirectoryScope,
    config: SyncConfig,
    progress: Box<dyn TransferProgress>,
    listener_state: ListenerState,
    initiator_state: InitiatorState,
}

impl SyncEngine {
    pub fn new(scope: DirectoryScope, config: SyncConfig) -> Self {
        Self {
            scope,
            config,
            progress: Box::new(NoProgress),
            listener_state: ListenerState::Idle,
            initiator_state: InitiatorState::Idle,
        }
    }

    /// Report per-file transfer progress to `progress`.
    pub fn with_progress(mut self, progress: Box<dyn TransferProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn scope(&self) -> &DirectoryScope {
        &self.scope
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// State the last listener session reached.
    pub fn listener_state(&self) -> ListenerState {
        self.listener_state
    }

    /// State the last initiator session reached.
    pub fn initiator_state(&self) -> InitiatorState {
        self.initiator_state
    }

    fn set_listener_state(&mut self, next: ListenerState) {
        debug!("Listener state: {:?} -> {:?}", self.listener_state, next);
        self.listener_state = next;
    }

    fn set_initiator_state(&mut self, next: InitiatorState) {
        debug!("Initiator state: {:?} -> {:?}", self.initiator_state, next);
        self.initiator_state = next;
    }

    // ==================== Listener role ====================

    /// Accept exactly one connection on `listener` and serve it.
    pub async fn await_sync(
        &mut self,
        listener: &SyncListener,
        confirm: &dyn Confirm,
    ) -> Result<ListenOutcome> {
        self.set_listener_state(ListenerState::Listening);
        let (stream, peer) = match listener.listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                self.set_listener_state(ListenerState::Aborted);
                return Err(SyncError::Accept(e));
            }
        };
        info!(peer = %peer, "Accepted sync connection");
        self.serve(stream, confirm).await
    }

    /// Run the listener role on an already-connected stream.
    pub async fn serve<S>(&mut self, stream: S, confirm: &dyn Confirm) -> Result<ListenOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.set_listener_state(ListenerState::Connected);
        let result = self.run_listener(stream, confirm).await;
        match &result {
            Ok(ListenOutcome::Received { files, bytes }) => {
                self.set_listener_state(ListenerState::Done);
                info!(files, bytes, "Sync complete");
            }
            Ok(ListenOutcome::Declined) => {
                self.set_listener_state(ListenerState::Aborted);
                info!("Sync declined, nothing transferred");
            }
            Err(e) => {
                self.set_listener_state(ListenerState::Aborted);
                warn!(error = %e, "Listener session failed");
            }
        }
        result
    }

    async fn run_listener<S>(&mut self, stream: S, confirm: &dyn Confirm) -> Result<ListenOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.scope.revalidate()?;
        let mut transport = Transport::accept(stream, self.config.transport())
            .await
            .map_err(during(SyncStep::Handshake))?;
        self.set_listener_state(ListenerState::HandshakeDone);

        let local = self.scope.fingerprint_matching(&[]).await?;
        debug!("Offering {} local fingerprints", local.len());
        transport
            .send_fingerprints(&local)
            .await
            .map_err(during(SyncStep::SendFingerprints))?;

        self.receive_batch(&mut transport, confirm).await
    }

    /// Receive the missing-file list, confirm it, then download each entry in
    /// list order.
    pub async fn receive_batch<S>(
        &mut self,
        transport: &mut Transport<S>,
        confirm: &dyn Confirm,
    ) -> Result<ListenOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let incoming = transport
            .receive_fingerprints()
            .await
            .map_err(during(SyncStep::ReceiveUniqueList))?;
        let total_size = Self::validate_incoming(&self.scope, &incoming).await?;
        self.set_listener_state(ListenerState::HashesExchanged);

        let offer = TransferOffer {
            files: &incoming,
            total_size,
        };
        info!(
            files = offer.files.len(),
            bytes = offer.total_size,
            "Peer offers files"
        );

        self.set_listener_state(ListenerState::AwaitingConfirmation);
        let accepted = if incoming.is_empty() {
            true
        } else {
            confirm.confirm(&offer).await?
        };
        transport
            .send_value(&accepted)
            .await
            .map_err(during(SyncStep::SendConfirmation))?;
        if !accepted {
            return Ok(ListenOutcome::Declined);
        }

        self.set_listener_state(ListenerState::Transferring);
        self.scope.revalidate()?;
        let mut bytes = 0;
        for fp in &incoming {
            let path = self.scope.resolve(&fp.name)?;
            let received = transport
                .download_file(&path, self.progress.as_mut())
                .await
                .map_err(during(SyncStep::Download(fp.name.clone())))?;
            if received != fp.size {
                warn!(
                    file = %fp.name,
                    bytes = received,
                    expected = fp.size,
                    "Received size differs from fingerprint"
                );
            } else {
                info!(file = %fp.name, bytes = received, "Received file");
            }
            bytes += received;
        }

        Ok(ListenOutcome::Received {
            files: incoming.len(),
            bytes,
        })
    }

    /// Every offered name must land inside the scope, once, on a regular
    /// file or a free name. Returns the advertised total size.
    async fn validate_incoming(
        scope: &DirectoryScope,
        incoming: &[FileFingerprint],
    ) -> Result<u64> {
        let violation = |reason: String| SyncError::Protocol {
            step: SyncStep::ReceiveUniqueList,
            reason,
        };

        let mut seen = HashSet::new();
        for fp in incoming {
            let path = scope
                .resolve(&fp.name)
                .map_err(|e| violation(e.to_string()))?;
            if !seen.insert(fp.name.as_str()) {
                return Err(violation(format!("{} offered more than once", fp.name)));
            }
            // Writes follow symlinks, so only plain files may be overwritten
            match fs::symlink_metadata(&path).await {
                Ok(meta) if !meta.file_type().is_file() => {
                    return Err(violation(format!(
                        "{} exists locally and is not a regular file",
                        fp.name
                    )));
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(violation(format!("cannot inspect {}: {}", fp.name, e)));
                }
            }
        }

        fingerprint::total_size(incoming)
            .ok_or_else(|| violation("advertised sizes overflow".to_string()))
    }

    // ==================== Initiator role ====================

    /// Sync with each peer in turn. A failed peer does not stop the rest.
    pub async fn init_sync(&mut self, peers: &[PeerAddress], patterns: &[String]) -> Vec<PeerReport> {
        let mut reports = Vec::with_capacity(peers.len());
        for peer in peers {
            info!(peer = %peer, "Syncing with peer");
            let result = self.sync_with_peer(peer, patterns).await;
            match &result {
                Ok(PushOutcome::Sent { files, bytes }) => {
                    info!(peer = %peer, files, bytes, "Sync complete")
                }
                Ok(PushOutcome::Declined) => info!(peer = %peer, "Peer declined the transfer"),
                Err(e) => warn!(peer = %peer, error = %e, "Sync with peer failed"),
            }
            reports.push(PeerReport {
                peer: peer.clone(),
                result,
            });
        }
        reports
    }

    /// [`init_sync`](Self::init_sync) against every peer in `store`.
    pub async fn init_sync_registered(
        &mut self,
        store: &dyn PeerStore,
        patterns: &[String],
    ) -> Result<Vec<PeerReport>> {
        let peers = store.load()?;
        if peers.is_empty() {
            warn!("No registered peers");
        }
        Ok(self.init_sync(&peers, patterns).await)
    }

    /// Dial one peer and push what it lacks.
    pub async fn sync_with_peer(
        &mut self,
        peer: &PeerAddress,
        patterns: &[String],
    ) -> Result<PushOutcome> {
        self.set_initiator_state(InitiatorState::Idle);
        let result = self.dial_and_push(peer, patterns).await;
        self.finish_initiator(&result);
        result
    }

    async fn dial_and_push(&mut self, peer: &PeerAddress, patterns: &[String]) -> Result<PushOutcome> {
        // Recomputed per peer so a long peer list never pushes stale hashes
        let local = self.scope.fingerprint_matching(patterns).await?;
        self.set_initiator_state(InitiatorState::Connecting);
        let stream = transport::dial(&peer.to_string(), &self.config.transport())
            .await
            .map_err(during(SyncStep::Connect))?;
        self.run_initiator(stream, local).await
    }

    /// Run the initiator role on an already-connected stream.
    pub async fn push<S>(&mut self, stream: S, patterns: &[String]) -> Result<PushOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.set_initiator_state(InitiatorState::Idle);
        let result = match self.scope.fingerprint_matching(patterns).await {
            Ok(local) => {
                self.set_initiator_state(InitiatorState::Connecting);
                self.run_initiator(stream, local).await
            }
            Err(e) => Err(e.into()),
        };
        self.finish_initiator(&result);
        result
    }

    fn finish_initiator(&mut self, result: &Result<PushOutcome>) {
        match result {
            Ok(PushOutcome::Sent { .. }) => self.set_initiator_state(InitiatorState::Done),
            Ok(PushOutcome::Declined) | Err(_) => {
                self.set_initiator_state(InitiatorState::Aborted)
            }
        }
    }

    async fn run_initiator<S>(&mut self, stream: S, local: Vec<FileFingerprint>) -> Result<PushOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut transport = Transport::connect(stream, self.config.transport())
            .await
            .map_err(during(SyncStep::Handshake))?;
        self.set_initiator_state(InitiatorState::HandshakeDone);

        let remote = transport
            .receive_fingerprints()
            .await
            .map_err(during(SyncStep::ReceiveFingerprints))?;
        let unique = fingerprint::unique_to(&local, &remote);
        debug!(
            "{} local, {} remote, {} missing on peer",
            local.len(),
            remote.len(),
            unique.len()
        );
        self.set_initiator_state(InitiatorState::HashesExchanged);

        self.push_batch(&mut transport, &unique).await
    }

    /// Send the missing-file list, wait for the answer, then upload each
    /// entry in list order.
    pub async fn push_batch<S>(
        &mut self,
        transport: &mut Transport<S>,
        files: &[FileFingerprint],
    ) -> Result<PushOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        transport
            .send_fingerprints(files)
            .await
            .map_err(during(SyncStep::SendUniqueList))?;

        let accepted: bool = transport
            .receive_value_within(self.config.confirm_timeout)
            .await
            .map_err(during(SyncStep::ReceiveConfirmation))?;
        if !accepted {
            return Ok(PushOutcome::Declined);
        }

        self.set_initiator_state(InitiatorState::Sending);
        self.scope.revalidate()?;
        let mut bytes = 0;
        for fp in files {
            let path = self.scope.resolve(&fp.name)?;
            let sent = transport
                .upload_file(&path, self.progress.as_mut())
                .await
                .map_err(during(SyncStep::Upload(fp.name.clone())))?;
            info!(file = %fp.name, bytes = sent, "Sent file");
            bytes += sent;
        }

        Ok(PushOutcome::Sent {
            files: files.len(),
            bytes,
        })
    }
}
