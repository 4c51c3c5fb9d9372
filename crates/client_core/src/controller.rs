//! The upload session controller: one calculation at a time, from input
//! validation through progress relay to result delivery.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::Result;
use bytes::Bytes;
use shared::{
    domain::{DeliveryMode, NoticeId, RequestId, SessionStatus, Severity},
    error::ErrorBody,
    protocol::{CalculateResponse, PushEvent},
};
use tokio::{runtime::Handle, sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    blobs::BlobRegistry,
    config::ClientSettings,
    error::{ControllerError, MSG_CALCULATION_DONE, MSG_CALCULATION_FAILED},
    notices::NoticeBoard,
    progress::ProgressRelay,
    progress_channel::{ProgressChannel, WsProgressChannel},
    transport::{
        filename_from_content_disposition, ComputeReply, ComputeService, Endpoints,
        HttpComputeService,
    },
    types::{BlobDownload, Notice, ResultHandle},
    view::View,
};

/// Used when a direct-payload response carries no usable `content-disposition`.
pub const DEFAULT_RESULT_FILENAME: &str = "commute_result.xlsx";

#[derive(Debug, Clone, Default)]
struct SessionState {
    request_id: RequestId,
    status: SessionStatus,
    result: Option<ResultHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub request_id: RequestId,
    pub status: SessionStatus,
    pub result: Option<ResultHandle>,
    pub progress_percent: u8,
}

enum Delivery {
    ServerFile { filename: String },
    Payload { filename: String, content: Bytes },
}

pub struct UploadController {
    view: Arc<dyn View>,
    compute: Arc<dyn ComputeService>,
    channel: Arc<dyn ProgressChannel>,
    endpoints: Endpoints,
    delivery_mode: DeliveryMode,
    notices: NoticeBoard,
    blobs: BlobRegistry,
    progress: Arc<ProgressRelay>,
    session: Mutex<SessionState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Settles an abandoned run and re-enables the trigger on every exit path,
/// including the calculation future being dropped mid-request.
struct RunGuard<'a> {
    controller: &'a UploadController,
    request_id: RequestId,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let abandoned = {
            let mut session = self.controller.session();
            let abandoned =
                session.request_id == self.request_id && session.status.is_running();
            if abandoned {
                session.status = SessionStatus::Failed;
            }
            abandoned
        };
        if abandoned {
            warn!(request_id = %self.request_id, "calculation abandoned before settling");
            self.controller.progress.finish(false);
            self.controller.view.set_progress_visible(false);
        }
        self.controller.validate();
    }
}

impl UploadController {
    /// Notice timers use the runtime current at construction, if any.
    pub fn new(
        view: Arc<dyn View>,
        compute: Arc<dyn ComputeService>,
        channel: Arc<dyn ProgressChannel>,
        endpoints: Endpoints,
        delivery_mode: DeliveryMode,
    ) -> Arc<Self> {
        Self::assemble(
            view,
            compute,
            channel,
            endpoints,
            delivery_mode,
            Handle::try_current().ok(),
        )
    }

    /// For hosts that call the synchronous operations from a non-runtime
    /// thread, such as a GUI event loop.
    pub fn with_runtime(
        view: Arc<dyn View>,
        compute: Arc<dyn ComputeService>,
        channel: Arc<dyn ProgressChannel>,
        endpoints: Endpoints,
        delivery_mode: DeliveryMode,
        runtime: Handle,
    ) -> Arc<Self> {
        Self::assemble(view, compute, channel, endpoints, delivery_mode, Some(runtime))
    }

    fn assemble(
        view: Arc<dyn View>,
        compute: Arc<dyn ComputeService>,
        channel: Arc<dyn ProgressChannel>,
        endpoints: Endpoints,
        delivery_mode: DeliveryMode,
        runtime: Option<Handle>,
    ) -> Arc<Self> {
        Arc::new(Self {
            notices: NoticeBoard::new(Arc::clone(&view), runtime),
            progress: Arc::new(ProgressRelay::new(Arc::clone(&view))),
            view,
            compute,
            channel,
            endpoints,
            delivery_mode,
            blobs: BlobRegistry::new(),
            session: Mutex::new(SessionState::default()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Wires the HTTP compute service and the WebSocket push channel from settings.
    pub fn from_settings(settings: &ClientSettings, view: Arc<dyn View>) -> Result<Arc<Self>> {
        let compute = HttpComputeService::from_settings(settings)?;
        let endpoints = compute.endpoints().clone();
        let channel = WsProgressChannel::new(endpoints.websocket()?);
        Ok(Self::new(
            view,
            Arc::new(compute),
            Arc::new(channel),
            endpoints,
            settings.delivery_mode,
        ))
    }

    fn session(&self) -> MutexGuard<'_, SessionState> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribes to the progress channel once and starts the render loop.
    ///
    /// A channel that cannot connect only costs progress display; calculations still work.
    pub async fn init(self: &Arc<Self>) {
        if !self.tasks().is_empty() {
            return;
        }
        if let Err(err) = self.channel.connect().await {
            warn!("progress channel unavailable: {err:#}");
        }

        let mut rx = self.channel.subscribe();
        let weak: Weak<Self> = Arc::downgrade(self);
        let forward = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(controller) = weak.upgrade() else {
                            break;
                        };
                        controller.on_progress_push(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "progress subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        let render = tokio::spawn(Arc::clone(&self.progress).run());

        let mut tasks = self.tasks();
        tasks.push(forward);
        tasks.push(render);
        drop(tasks);

        self.validate();
    }

    /// Unsubscribes from the progress channel, revokes held blobs and drops notices.
    pub async fn dispose(&self) {
        for task in self.tasks().drain(..) {
            task.abort();
        }
        self.channel.close().await;
        self.progress.finish(false);
        let revoked = self.blobs.revoke_all();
        {
            let mut session = self.session();
            if matches!(session.result, Some(ResultHandle::LocalBlob { .. })) {
                session.result = None;
            }
        }
        self.notices.clear();
        debug!(revoked, "controller disposed");
    }

    /// Ready iff the address is non-empty and exactly one file is selected.
    /// The trigger stays disabled while a calculation runs.
    pub fn validate(&self) -> bool {
        let ready = self.view.validation_inputs().is_ready();
        let running = self.session().status.is_running();
        self.view.set_trigger_enabled(ready && !running);
        ready
    }

    pub async fn start_calculation(&self) -> Result<(), ControllerError> {
        let request_id = {
            let mut session = self.session();
            if matches!(
                session.status,
                SessionStatus::Running | SessionStatus::Validating
            ) {
                return Err(ControllerError::Busy);
            }
            self.discard_result(&mut session);
            session.request_id = session.request_id.next();
            session.status = SessionStatus::Validating;
            session.request_id
        };

        let Some(upload) = self.view.validation_inputs().into_upload() else {
            self.session().status = SessionStatus::Idle;
            self.validate();
            return Err(self.report(ControllerError::Validation));
        };

        self.session().status = SessionStatus::Running;
        let _guard = RunGuard {
            controller: self,
            request_id,
        };
        self.view.set_trigger_enabled(false);
        self.view.set_progress_visible(true);
        self.view.show_result(None);
        self.progress.begin(request_id);
        info!(
            request_id = %request_id,
            filename = %upload.file.filename,
            size = upload.file.content.len(),
            mode = ?self.delivery_mode,
            "calculation started"
        );

        let outcome = match self.compute.calculate(upload).await {
            Ok(reply) => self.interpret(reply),
            Err(err) => Err(ControllerError::transport(format!("{err:#}"))),
        };
        self.settle(request_id, outcome)
    }

    fn interpret(&self, reply: ComputeReply) -> Result<Delivery, ControllerError> {
        match self.delivery_mode {
            DeliveryMode::Descriptor => {
                if !reply.is_success() {
                    return Err(ControllerError::Request {
                        status: reply.status,
                        message: ErrorBody::message_from_bytes(&reply.body)
                            .unwrap_or_else(|| MSG_CALCULATION_FAILED.to_string()),
                    });
                }
                let body: CalculateResponse = serde_json::from_slice(&reply.body)
                    .map_err(|err| ControllerError::transport(format!("malformed response: {err}")))?;
                if body.filename.trim().is_empty() {
                    return Err(ControllerError::transport("response carries an empty filename"));
                }
                Ok(Delivery::ServerFile {
                    filename: body.filename,
                })
            }
            DeliveryMode::DirectPayload => {
                if !reply.is_success() {
                    return Err(ControllerError::Request {
                        status: reply.status,
                        message: MSG_CALCULATION_FAILED.to_string(),
                    });
                }
                let filename = reply
                    .content_disposition
                    .as_deref()
                    .and_then(filename_from_content_disposition)
                    .unwrap_or_else(|| DEFAULT_RESULT_FILENAME.to_string());
                Ok(Delivery::Payload {
                    filename,
                    content: reply.body,
                })
            }
        }
    }

    fn settle(
        &self,
        request_id: RequestId,
        outcome: Result<Delivery, ControllerError>,
    ) -> Result<(), ControllerError> {
        let delivery = match outcome {
            Ok(delivery) => delivery,
            Err(err) => {
                self.session().status = SessionStatus::Failed;
                self.progress.finish(false);
                self.view.set_progress_visible(false);
                warn!(request_id = %request_id, "calculation failed: {err}");
                return Err(self.report(err));
            }
        };

        match delivery {
            Delivery::ServerFile { filename } => {
                let handle = ResultHandle::ServerFile { filename };
                {
                    let mut session = self.session();
                    session.status = SessionStatus::Succeeded;
                    session.result = Some(handle.clone());
                }
                self.progress.finish(true);
                self.view.show_result(Some(&handle));
                info!(request_id = %request_id, result = ?handle, "calculation finished");
            }
            Delivery::Payload { filename, content } => {
                let url = self.blobs.create_url(content.clone());
                {
                    let mut session = self.session();
                    session.status = SessionStatus::Succeeded;
                    session.result = Some(ResultHandle::LocalBlob { url: url.clone() });
                }
                self.progress.finish(true);
                self.view.save_download(&BlobDownload {
                    url: url.clone(),
                    filename: filename.clone(),
                    content,
                });
                self.blobs.revoke(&url);
                self.session().result = None;
                info!(request_id = %request_id, %filename, "calculation finished, payload handed to view");
            }
        }
        self.notices.show(MSG_CALCULATION_DONE, Severity::Success);
        Ok(())
    }

    fn discard_result(&self, session: &mut SessionState) {
        if let Some(ResultHandle::LocalBlob { url }) = session.result.take() {
            self.blobs.revoke(&url);
        }
    }

    fn report(&self, err: ControllerError) -> ControllerError {
        if let Some(text) = err.notice_text() {
            self.notices.show(text, Severity::Error);
        }
        err
    }

    /// Sends the view to the server-side artifact of the last successful calculation.
    pub fn download_result(&self) -> Result<String, ControllerError> {
        let filename = self
            .session()
            .result
            .as_ref()
            .and_then(ResultHandle::filename)
            .map(str::to_string);
        let Some(filename) = filename else {
            return Err(self.report(ControllerError::ResultMissing));
        };
        let url = self.endpoints.download(&filename).to_string();
        debug!(%url, "navigating to result download");
        self.view.navigate(&url);
        Ok(url)
    }

    /// Sends the view to the server's example input file.
    pub fn download_sample(&self) -> String {
        let url = self.endpoints.sample().to_string();
        self.view.navigate(&url);
        url
    }

    /// Applies one push event; returns whether it was accepted for rendering.
    pub fn on_progress_push(&self, event: &PushEvent) -> bool {
        match event {
            PushEvent::ProgressUpdate(update) => self.progress.push(update),
        }
    }

    pub fn show_message(&self, text: impl Into<String>, severity: Severity) -> NoticeId {
        self.notices.show(text, severity)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let session = self.session().clone();
        SessionSnapshot {
            request_id: session.request_id,
            status: session.status,
            result: session.result,
            progress_percent: self.progress.displayed(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.session().status
    }

    pub fn result(&self) -> Option<ResultHandle> {
        self.session().result.clone()
    }

    pub fn active_notices(&self) -> Vec<Notice> {
        self.notices.active()
    }

    pub fn live_blob_count(&self) -> usize {
        self.blobs.live_count()
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }
}

impl Drop for UploadController {
    fn drop(&mut self) {
        for task in self.tasks().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
