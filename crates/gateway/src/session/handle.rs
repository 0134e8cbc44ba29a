//! The public handle to one multiplexed session.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use protocol::messages::{
    Close, Data, FileDelete, FileDownload, FileEntry, FileList, FileRead, FileRename, FileWrite,
    Message, MonitorStart, MonitorStop, MonitoringSample, Resize,
};
use tokio::io::AsyncRead;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::inner::SessionInner;
use super::state::{CloseReason, Geometry, SessionState};
use crate::error::{FileErrorKind, FileOpError, GatewayError, Result, UploadFailure};
use crate::files::requests::FileOp;
use crate::files::upload::{self, UploadOutcome};
use crate::files::Refresh;

/// Snapshot of a session for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub server_id: String,
    pub state: SessionState,
    pub geometry: Geometry,
    pub monitoring: bool,
    pub active_uploads: usize,
    pub pending_requests: usize,
}

/// Cloneable handle to a session. All clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("server_id", &self.inner.server_id)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl Session {
    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn geometry(&self) -> Geometry {
        self.inner.geometry()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.inner.id.clone(),
            server_id: self.inner.server_id.clone(),
            state: self.inner.state(),
            geometry: self.inner.geometry(),
            monitoring: self.monitoring_enabled(),
            active_uploads: self.inner.uploads.len(),
            pending_requests: self.inner.requests.in_flight(),
        }
    }

    /// Watch lifecycle state changes.
    pub fn state_changes(&self) -> tokio::sync::watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the backend reports the session ready.
    ///
    /// Fails with the close reason if the session closes first.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut states = self.inner.state.subscribe();
        let reached = states
            .wait_for(|state| *state != SessionState::Connecting)
            .await
            .map(|state| *state);
        match reached {
            Ok(state) if state.accepts_commands() => Ok(()),
            _ => Err(self.inner.closed_error()),
        }
    }

    // ------------------------------------------------------------------
    // Terminal
    // ------------------------------------------------------------------

    /// Subscribe to terminal output. Only output received after subscribing
    /// is delivered.
    pub fn output(&self) -> broadcast::Receiver<Vec<u8>> {
        self.inner.output.subscribe()
    }

    /// Send keystrokes or pasted bytes to the remote shell.
    pub async fn send_data(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.inner.ensure_ready()?;
        self.inner
            .send(Message::Data(Data {
                bytes: bytes.into(),
            }))
            .await
    }

    /// Report a new terminal size. Sent on every call.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.inner.ensure_ready()?;
        *self
            .inner
            .geometry
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Geometry::new(cols, rows);
        self.inner
            .send(Message::Resize(Resize { cols, rows }))
            .await
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// List a remote directory.
    pub async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let response = self
            .request(FileOp::List, path, |request_id| {
                Message::FileList(FileList {
                    request_id,
                    path: path.to_string(),
                })
            })
            .await?;
        match response {
            Message::FileListData(listing) => Ok(listing.entries),
            other => Err(unexpected(&other)),
        }
    }

    /// Read a remote text file. Non-UTF-8 content fails with
    /// [`FileErrorKind::NotText`].
    pub async fn read(&self, path: &str) -> Result<String> {
        let response = self
            .request(FileOp::Read, path, |request_id| {
                Message::FileRead(FileRead {
                    request_id,
                    path: path.to_string(),
                })
            })
            .await?;
        let Message::FileReadData(data) = response else {
            return Err(unexpected(&response));
        };
        String::from_utf8(data.content).map_err(|_| {
            GatewayError::File(FileOpError {
                kind: FileErrorKind::NotText,
                path: path.to_string(),
                message: "content is not valid UTF-8".to_string(),
            })
        })
    }

    /// Overwrite a remote text file.
    pub async fn write(&self, path: &str, content: &str) -> Result<Refresh> {
        self.request(FileOp::Write, path, |request_id| {
            Message::FileWrite(FileWrite {
                request_id,
                path: path.to_string(),
                content: content.to_string(),
            })
        })
        .await?;
        Ok(Refresh::parents_of(&[path]))
    }

    /// Rename or move a remote path.
    pub async fn rename(&self, from: &str, to: &str) -> Result<Refresh> {
        self.request(FileOp::Rename, from, |request_id| {
            Message::FileRename(FileRename {
                request_id,
                from: from.to_string(),
                to: to.to_string(),
            })
        })
        .await?;
        Ok(Refresh::parents_of(&[from, to]))
    }

    /// Delete a remote file.
    pub async fn delete(&self, path: &str) -> Result<Refresh> {
        self.request(FileOp::Delete, path, |request_id| {
            Message::FileDelete(FileDelete {
                request_id,
                path: path.to_string(),
            })
        })
        .await?;
        Ok(Refresh::parents_of(&[path]))
    }

    /// Fetch a remote file's raw bytes.
    pub async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let response = self
            .request(FileOp::Download, path, |request_id| {
                Message::FileDownload(FileDownload {
                    request_id,
                    path: path.to_string(),
                })
            })
            .await?;
        match response {
            Message::FileDownloadData(data) => Ok(data.data),
            other => Err(unexpected(&other)),
        }
    }

    /// Re-list every directory named by `refresh`.
    pub async fn refresh(&self, refresh: &Refresh) -> Result<Vec<(String, Vec<FileEntry>)>> {
        let mut listings = Vec::with_capacity(refresh.directories.len());
        for dir in &refresh.directories {
            listings.push((dir.clone(), self.list(dir).await?));
        }
        Ok(listings)
    }

    /// Send one correlated file request and wait for its response.
    ///
    /// Waits for the request class slot first; the response wait is bounded
    /// by the request timeout.
    async fn request(
        &self,
        op: FileOp,
        path: &str,
        build: impl FnOnce(u64) -> Message,
    ) -> Result<Message> {
        let inner = &self.inner;
        inner.ensure_ready()?;

        let _slot = inner
            .requests
            .acquire(op.class())
            .await
            .ok_or_else(|| inner.closed_error())?;
        // The session may have changed while queued.
        inner.ensure_ready()?;

        let (request_id, response) = inner.requests.register(op, path);
        if inner.closed.is_cancelled() {
            inner.requests.forget(request_id);
            return Err(inner.closed_error());
        }
        debug!(session_id = %inner.id, request_id, op = ?op, path, "sending file request");
        if let Err(e) = inner.send(build(request_id)).await {
            inner.requests.forget(request_id);
            return Err(e);
        }

        match tokio::time::timeout(inner.ctx.options.request_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(inner.closed_error()),
            Err(_) => {
                inner.requests.forget(request_id);
                warn!(session_id = %inner.id, request_id, op = ?op, path, "file request timed out");
                Err(GatewayError::RequestTimeout {
                    session_id: inner.id.clone(),
                    request_id,
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Uploads
    // ------------------------------------------------------------------

    /// Upload exactly `size` bytes from `source` to `path`.
    pub async fn upload<R>(&self, path: &str, source: R, size: u64) -> Result<UploadOutcome>
    where
        R: AsyncRead + Unpin,
    {
        self.inner.ensure_ready()?;
        Ok(upload::run(&self.inner, path, source, size).await?)
    }

    /// Upload a local file to `remote_path`.
    pub async fn upload_file(&self, local: &Path, remote_path: &str) -> Result<UploadOutcome> {
        let source_error = |e: std::io::Error| {
            GatewayError::Upload(crate::error::UploadError {
                path: remote_path.to_string(),
                failure: UploadFailure::Source(format!("{}: {}", local.display(), e)),
                bytes_acknowledged: 0,
                total_bytes: 0,
                state: upload::UploadState::Aborted,
            })
        };
        let file = tokio::fs::File::open(local).await.map_err(source_error)?;
        let size = file.metadata().await.map_err(source_error)?.len();
        self.upload(remote_path, file, size).await
    }

    /// Paths with an upload currently running.
    pub fn active_uploads(&self) -> Vec<String> {
        self.inner.uploads.paths()
    }

    // ------------------------------------------------------------------
    // Monitoring
    // ------------------------------------------------------------------

    /// Ask the backend to start streaming resource samples.
    ///
    /// Allowed in any state but closed; repeated calls are no-ops.
    pub async fn start_monitoring(&self) -> Result<()> {
        if self.inner.state().is_closed() {
            return Err(self.inner.closed_error());
        }
        if self.inner.monitoring.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(session_id = %self.inner.id, "starting monitoring");
        if let Err(e) = self.inner.send(Message::MonitorStart(MonitorStart {})).await {
            self.inner.monitoring.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Stop monitoring and drop the stored sample.
    pub async fn stop_monitoring(&self) -> Result<()> {
        if !self.inner.monitoring.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.ctx.monitors.remove(&self.inner.id);
        info!(session_id = %self.inner.id, "stopping monitoring");
        self.inner.send(Message::MonitorStop(MonitorStop {})).await
    }

    pub fn monitoring_enabled(&self) -> bool {
        self.inner.monitoring.load(Ordering::SeqCst)
    }

    /// The most recent sample, if monitoring is on and one has arrived.
    pub fn latest_sample(&self) -> Option<MonitoringSample> {
        self.inner.ctx.monitors.latest(&self.inner.id)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Close the session.
    ///
    /// Aborts running uploads and stops monitoring before sending `close`.
    /// Pending requests fail with `SessionClosed`. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.close_with(CloseReason::ClientClosed, Duration::from_secs(1))
            .await
    }

    /// Close, bounding each farewell message by `send_timeout` so a stuck
    /// transport cannot hold the teardown.
    pub(crate) async fn close_with(&self, reason: CloseReason, send_timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        if inner.state().is_closed() {
            return Ok(());
        }

        // Running uploads send their own abort; nothing of theirs may follow.
        let released = inner.uploads.stop_all();
        if !released.is_empty() {
            let all_released = async {
                for upload in &released {
                    upload.cancelled().await;
                }
            };
            if tokio::time::timeout(send_timeout, all_released).await.is_err() {
                warn!(session_id = %inner.id, "uploads still stopping during close");
            }
        }

        let mut farewell = Vec::new();
        if inner.monitoring.swap(false, Ordering::SeqCst) {
            farewell.push(Message::MonitorStop(MonitorStop {}));
        }
        farewell.push(Message::Close(Close { reason: None }));

        for message in farewell {
            let kind = message.kind();
            match tokio::time::timeout(send_timeout, inner.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(session_id = %inner.id, kind, "transport gone during close: {}", e);
                    break;
                }
                Err(_) => {
                    warn!(session_id = %inner.id, kind, "timed out sending during close");
                    break;
                }
            }
        }

        inner.terminate(reason);
        Ok(())
    }
}

fn unexpected(message: &Message) -> GatewayError {
    GatewayError::Protocol(format!("unexpected response {}", message.kind()))
}
