// Copyright (c) 2024-2025 Federico G. Schwindt <fgsch@lodoss.net>
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use std::path::PathBuf;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::download::{
    DownloadError, DownloadOptions, SessionId, TransferEvent, TransferOutcome, TransferReport,
    TransferSession, transfer,
};
use crate::progress::{ProgressEvent, ProgressSender};
use crate::range::RangeRequest;
use crate::writer::RangeFileWriter;

struct ActiveSession {
    id: SessionId,
    token: CancellationToken,
    handle: JoinHandle<TransferReport>,
}

/// Lifecycle of transfer sessions for one resource.
///
/// At most one session is active at a time. Seeking cancels the active
/// session and waits for its terminal report before the next one starts, so
/// two sessions never write to the destination at once.
pub struct StreamController {
    client: reqwest::Client,
    url: String,
    destination: PathBuf,
    options: DownloadOptions,
    events: ProgressSender,
    token: CancellationToken,
    next_session: u64,
    active: Option<ActiveSession>,
}

impl StreamController {
    /// Sessions are cancelled when `token` is.
    pub fn new(
        client: reqwest::Client,
        url: String,
        destination: PathBuf,
        options: DownloadOptions,
        events: ProgressSender,
        token: CancellationToken,
    ) -> Self {
        Self {
            client,
            url,
            destination,
            options,
            events,
            token,
            next_session: 1,
            active: None,
        }
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.active.as_ref().map(|active| active.id)
    }

    /// Fetch `window` of the resource (all of it when `None`) as a new
    /// resource: progress and telemetry start over.
    ///
    /// Returns the report of the session this one replaced, if any.
    pub async fn start(
        &mut self,
        window: Option<RangeRequest>,
    ) -> (Option<TransferReport>, SessionId) {
        let previous = self.cancel().await;
        let _ = self.events.send(ProgressEvent::Reset);
        (previous, self.spawn(window, true))
    }

    /// Move the transfer to `offset`, keeping what is already on disk.
    ///
    /// The active session reaches its terminal state before the new one is
    /// spawned; its report is returned.
    pub async fn seek(&mut self, offset: u64) -> (Option<TransferReport>, SessionId) {
        let previous = self.cancel().await;
        let _ = self.events.send(ProgressEvent::SeekReset);
        (
            previous,
            self.spawn(Some(RangeRequest::starting_at(offset)), false),
        )
    }

    /// Cancel the active session and wait for its report.
    pub async fn cancel(&mut self) -> Option<TransferReport> {
        let active = self.active.take()?;
        active.token.cancel();
        Some(Self::join(active).await)
    }

    /// Wait for the active session to finish on its own.
    pub async fn wait(&mut self) -> Option<TransferReport> {
        let active = self.active.take()?;
        Some(Self::join(active).await)
    }

    async fn join(active: ActiveSession) -> TransferReport {
        active.handle.await.unwrap_or_else(|err| TransferReport {
            session: active.id,
            received: 0,
            expected: None,
            outcome: TransferOutcome::Failed(DownloadError::Task(err.to_string())),
        })
    }

    /// A new resource replaces the destination. A seek writes over it.
    fn spawn(&mut self, window: Option<RangeRequest>, truncate: bool) -> SessionId {
        let id = SessionId(self.next_session);
        self.next_session += 1;
        let token = self.token.child_token();

        let client = self.client.clone();
        let url = self.url.clone();
        let destination = self.destination.clone();
        let options = self.options.clone();
        let events = self.events.clone();
        let handle = tokio::spawn({
            let token = token.clone();
            async move {
                let offset = window.map_or(0, |window| window.start);
                let writer = match RangeFileWriter::open(&destination, offset, truncate).await {
                    Ok(writer) => writer,
                    Err(err) => {
                        let report = TransferReport {
                            session: id,
                            received: 0,
                            expected: None,
                            outcome: TransferOutcome::Failed(err.into()),
                        };
                        tracing::error!("{}", report.summary());
                        let _ = events.send(
                            TransferEvent::Finished {
                                session: id,
                                summary: report.summary(),
                            }
                            .into(),
                        );
                        return report;
                    }
                };
                let session = TransferSession::new(id, window, writer);
                transfer(&client, &url, session, &options, &events, &token).await
            }
        });

        self.active = Some(ActiveSession { id, token, handle });
        id
    }
}
