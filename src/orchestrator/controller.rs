//! Job lifecycle controller.
//!
//! Owns start/poll/download/cleanup orchestration for one job at a time and emits
//! events for presentation layers. Remote calls run in spawned tasks and report
//! back as [`Completion`]s, so command handling never waits on the network.

use crate::engine::retry::{with_retry, RetryPolicy};
use crate::engine::{JobTransport, PollEvent, Poller};
use crate::error::{ControllerError, TransportError};
use crate::model::{
    ControllerConfig, ControllerSnapshot, DownloadKind, DownloadedFile, InfoEvent, JobEvent,
    JobFailure, JobHandle, JobState, JobStatus,
};
use crate::orchestrator::post_process::{self, PendingCleanup};
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// Commands emitted by UI layers to control the job.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    Start(String),
    Download(DownloadKind),
    Cancel,
    Quit,
}

/// Results of background work, fed back into the controller.
///
/// Everything except poll events carries the generation it was spawned in;
/// results from an older generation are dropped.
#[derive(Debug)]
pub(crate) enum Completion {
    Poll(String, PollEvent),
    Started {
        generation: u64,
        model: String,
        result: Result<JobHandle, TransportError>,
    },
    Fetched {
        generation: u64,
        kind: DownloadKind,
        filename: String,
        result: Result<DownloadedFile, TransportError>,
        /// Part of the post-completion batch, which ends with `AutoDownloadsDone`.
        auto: bool,
    },
    AutoDownloadsDone {
        generation: u64,
    },
}

/// The poll loop bound to the job it polls.
struct PollSession {
    handle: JobHandle,
    poller: Poller,
}

pub(crate) struct JobController {
    transport: Arc<dyn JobTransport>,
    cfg: ControllerConfig,
    event_tx: UnboundedSender<JobEvent>,
    done_tx: UnboundedSender<Completion>,
    done_rx: UnboundedReceiver<Completion>,
    snapshot: ControllerSnapshot,
    session: Option<PollSession>,
    cleanups: Vec<PendingCleanup>,
    // Bumped on every start, cancel and shutdown.
    generation: u64,
    work: Vec<JoinHandle<()>>,
    // Spawned tasks whose final completion has not been handled yet.
    outstanding: usize,
}

impl JobController {
    pub fn new(
        transport: Arc<dyn JobTransport>,
        cfg: ControllerConfig,
        event_tx: UnboundedSender<JobEvent>,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            cfg,
            event_tx,
            done_tx,
            done_rx,
            snapshot: ControllerSnapshot::default(),
            session: None,
            cleanups: Vec::new(),
            generation: 0,
            work: Vec::new(),
            outstanding: 0,
        }
    }

    pub fn snapshot(&self) -> &ControllerSnapshot {
        &self.snapshot
    }

    pub fn has_active_session(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.poller.is_active())
    }

    /// A start or download request is still in flight.
    pub fn is_busy(&self) -> bool {
        self.outstanding > 0
    }

    /// Next completion from the poller or a spawned request.
    pub async fn recv(&mut self) -> Option<Completion> {
        self.done_rx.recv().await
    }

    /// Start a new remote job, abandoning whatever this controller tracked before.
    pub fn start_job(&mut self, model: &str) {
        self.abort_work();
        self.discard_session();
        self.snapshot = ControllerSnapshot {
            state: JobState::Starting,
            model: Some(model.to_string()),
            ..Default::default()
        };
        self.publish();

        let generation = self.generation;
        let transport = self.transport.clone();
        let tx = self.done_tx.clone();
        let model = model.to_string();
        self.spawn(async move {
            let result = transport.start(&model).await;
            let _ = tx.send(Completion::Started {
                generation,
                model,
                result,
            });
        });
    }

    /// Download one of the finished job's files. The result arrives as a `Fetched` completion.
    pub fn download(&mut self, kind: DownloadKind) -> Result<(), ControllerError> {
        if self.snapshot.state != JobState::Done {
            return Err(ControllerError::NotDone);
        }
        let status = self.snapshot.status.as_ref().ok_or(ControllerError::NotDone)?;
        let filename =
            post_process::file_for(kind, status, &self.cfg).ok_or(ControllerError::NoFile(kind))?;

        let generation = self.generation;
        let transport = self.transport.clone();
        let retry = self.cfg.retry.clone();
        let tx = self.done_tx.clone();
        self.spawn(async move {
            let result = fetch(transport.as_ref(), &retry, kind, &filename).await;
            let _ = tx.send(Completion::Fetched {
                generation,
                kind,
                filename,
                result,
                auto: false,
            });
        });
        Ok(())
    }

    pub fn handle(&mut self, completion: Completion) {
        match completion {
            Completion::Poll(id, ev) => self.handle_poll_event(&id, ev),
            Completion::Started {
                generation,
                model,
                result,
            } => {
                if generation != self.generation {
                    if let Ok(handle) = result {
                        tracing::info!(process_id = %handle.id, "ignoring start of an abandoned request");
                    }
                    return;
                }
                self.settle_one();
                self.on_started(&model, result);
            }
            Completion::Fetched {
                generation,
                kind,
                filename,
                result,
                auto,
            } => {
                if generation != self.generation {
                    tracing::debug!(filename, "ignoring download of an abandoned job");
                    return;
                }
                if !auto {
                    self.settle_one();
                }
                self.on_fetched(kind, &filename, result);
            }
            Completion::AutoDownloadsDone { generation } => {
                if generation == self.generation {
                    self.settle_one();
                    self.finish();
                }
            }
        }
    }

    /// Apply one poller event. Events for any job other than the current one are dropped.
    pub fn handle_poll_event(&mut self, job_id: &str, event: PollEvent) {
        let current = self.session.as_ref().map(|s| s.handle.id.as_str());
        if current != Some(job_id) || self.snapshot.state != JobState::Processing {
            tracing::debug!(process_id = job_id, "discarding poll event for inactive job");
            return;
        }

        match event {
            PollEvent::Status(status) => match status.state {
                JobState::Done => {
                    self.stop_polling();
                    tracing::info!(
                        process_id = job_id,
                        rows = status.rows_parsed_count,
                        output = status.output_file.as_deref().unwrap_or("-"),
                        "job done"
                    );
                    self.snapshot.state = JobState::Done;
                    self.snapshot.status = Some(status.clone());
                    self.snapshot.failure = None;
                    self.snapshot.touch();
                    self.publish();
                    if self.cfg.auto_download {
                        self.auto_download(&status);
                    } else {
                        self.finish();
                    }
                }
                JobState::Error => {
                    self.stop_polling();
                    let message = status.error_message.clone().unwrap_or_default();
                    tracing::warn!(process_id = job_id, error = %message, "remote reported job failure");
                    self.snapshot.status = Some(status);
                    self.fail(JobFailure::RemoteReported(message));
                    self.finish();
                }
                _ => {
                    self.snapshot.status = Some(JobStatus {
                        state: JobState::Processing,
                        ..status
                    });
                    self.snapshot.touch();
                    self.publish();
                }
            },
            PollEvent::Failed(err) => {
                self.stop_polling();
                self.fail(JobFailure::from(err));
                self.finish();
            }
        }
    }

    /// Stop following the job and go back to idle. The remote job itself keeps running.
    pub fn cancel(&mut self) {
        self.abort_work();
        if let Some(mut session) = self.session.take() {
            if session.poller.is_active() {
                session.poller.stop();
                self.info(InfoEvent::PollingStopped {
                    id: session.handle.id.clone(),
                });
            }
        }
        self.snapshot = ControllerSnapshot::default();
        self.publish();
    }

    /// Tear down: abandon in-flight requests, stop polling and run any cleanup
    /// that is still waiting for its delay.
    pub async fn shutdown(&mut self) {
        self.abort_work();
        if let Some(mut session) = self.session.take() {
            session.poller.stop();
        }
        for pending in std::mem::take(&mut self.cleanups) {
            if !pending.is_finished() {
                pending.flush(self.transport.as_ref()).await;
            }
        }
    }

    pub fn info(&self, info: InfoEvent) {
        let _ = self.event_tx.send(JobEvent::Info(info));
    }

    fn publish(&self) {
        let _ = self.event_tx.send(JobEvent::Snapshot(self.snapshot.clone()));
    }

    fn finish(&self) {
        let _ = self.event_tx.send(JobEvent::Finished(self.snapshot.clone()));
    }

    fn fail(&mut self, failure: JobFailure) {
        self.snapshot.state = JobState::Error;
        self.snapshot.failure = Some(failure);
        self.snapshot.touch();
        self.publish();
    }

    fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.work.retain(|t| !t.is_finished());
        self.work.push(tokio::spawn(fut));
        self.outstanding += 1;
    }

    fn settle_one(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    fn abort_work(&mut self) {
        for task in self.work.drain(..) {
            task.abort();
        }
        self.outstanding = 0;
        self.generation += 1;
    }

    fn on_started(&mut self, model: &str, result: Result<JobHandle, TransportError>) {
        let handle = match result {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(model, error = %e, "failed to start remote job");
                let failure = match e {
                    // A missing start endpoint is not a vanished status resource.
                    TransportError::NotFound => JobFailure::HttpStatus(404),
                    other => JobFailure::from(other),
                };
                self.fail(failure);
                self.finish();
                return;
            }
        };

        let tx = self.done_tx.clone();
        let id = handle.id.clone();
        let poller = Poller::start(
            self.transport.clone(),
            &handle,
            self.cfg.poll_interval,
            self.cfg.retry.clone(),
            move |ev| {
                let _ = tx.send(Completion::Poll(id.clone(), ev));
            },
        );
        self.session = Some(PollSession {
            handle: handle.clone(),
            poller,
        });
        self.snapshot.state = JobState::Processing;
        self.snapshot.handle = Some(handle.clone());
        self.snapshot.touch();
        self.publish();
        self.info(InfoEvent::PollingStarted {
            id: handle.id,
            interval: self.cfg.poll_interval,
        });
    }

    fn discard_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            let was_active = session.poller.is_active();
            session.poller.stop();
            if was_active {
                tracing::info!(process_id = %session.handle.id, "superseding active job");
                self.info(InfoEvent::Superseded {
                    id: session.handle.id.clone(),
                });
            }
        }
    }

    fn stop_polling(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.poller.stop();
            let id = session.poller.job_id().to_string();
            self.info(InfoEvent::PollingStopped { id });
        }
    }

    /// Fetch the post-completion files in plan order, then report the batch as done.
    fn auto_download(&mut self, status: &JobStatus) {
        if status.rows_parsed_count == 0 {
            if let Some(id) = self.snapshot.job_id() {
                self.info(InfoEvent::NoRowsParsed { id: id.to_string() });
            }
        }
        let plan = post_process::download_plan(status, &self.cfg);
        if plan.is_empty() {
            self.finish();
            return;
        }

        let generation = self.generation;
        let transport = self.transport.clone();
        let retry = self.cfg.retry.clone();
        let tx = self.done_tx.clone();
        self.spawn(async move {
            for (kind, filename) in plan {
                let result = fetch(transport.as_ref(), &retry, kind, &filename).await;
                let _ = tx.send(Completion::Fetched {
                    generation,
                    kind,
                    filename,
                    result,
                    auto: true,
                });
            }
            let _ = tx.send(Completion::AutoDownloadsDone { generation });
        });
    }

    fn on_fetched(
        &mut self,
        kind: DownloadKind,
        filename: &str,
        result: Result<DownloadedFile, TransportError>,
    ) {
        match result {
            Ok(file) => {
                tracing::info!(filename, bytes = file.bytes.len(), kind = kind.label(), "downloaded");
                let _ = self.event_tx.send(JobEvent::Downloaded(file));
                if kind == DownloadKind::Output {
                    self.schedule_cleanup();
                }
            }
            Err(e) => {
                tracing::warn!(filename, error = %e, "download failed");
                let _ = self.event_tx.send(JobEvent::DownloadFailed {
                    kind,
                    filename: filename.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    fn schedule_cleanup(&mut self) {
        if !self.cfg.cleanup {
            return;
        }
        let Some(id) = self.snapshot.job_id().map(str::to_string) else {
            return;
        };
        self.cleanups
            .retain(|c| !c.is_finished() || c.job_id == id);
        if self.cleanups.iter().any(|c| c.job_id == id) {
            return;
        }
        let pending = post_process::spawn_cleanup(self.transport.clone(), id.clone(), self.cfg.cleanup_delay);
        self.cleanups.push(pending);
        self.info(InfoEvent::CleanupScheduled {
            id,
            delay: self.cfg.cleanup_delay,
        });
    }
}

async fn fetch(
    transport: &dyn JobTransport,
    retry: &RetryPolicy,
    kind: DownloadKind,
    filename: &str,
) -> Result<DownloadedFile, TransportError> {
    with_retry(retry, "download", move || transport.download(kind, filename)).await
}

/// Drive a controller from UI commands until quit, then tear it down.
pub(crate) async fn run_controller(
    mut controller: JobController,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()> {
    loop {
        // Handlers never await, so a Quit or Cancel is seen as soon as it is sent.
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UiCommand::Start(model)) => controller.start_job(&model),
                    Some(UiCommand::Download(kind)) => {
                        if let Err(e) = controller.download(kind) {
                            controller.info(InfoEvent::Message(e.to_string()));
                        }
                    }
                    Some(UiCommand::Cancel) => {
                        if controller.has_active_session() || controller.is_busy() {
                            controller.cancel();
                        } else {
                            controller.info(InfoEvent::Message("No running job to stop".into()));
                        }
                    }
                    Some(UiCommand::Quit) | None => break,
                }
            }
            Some(completion) = controller.recv() => controller.handle(completion),
        }
    }
    tracing::debug!(state = controller.snapshot().state.label(), "job controller shutting down");
    controller.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FakeTransport;
    use std::time::Duration;

    fn test_cfg() -> ControllerConfig {
        ControllerConfig {
            poll_interval: Duration::from_secs(1),
            cleanup_delay: Duration::from_secs(5),
            retry: RetryPolicy::none(),
            ..Default::default()
        }
    }

    fn controller(
        fake: &Arc<FakeTransport>,
        cfg: ControllerConfig,
    ) -> (JobController, UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (JobController::new(fake.clone(), cfg, tx), rx)
    }

    /// Feed completions back into the controller until `done` holds.
    async fn pump_until(c: &mut JobController, done: impl Fn(&JobController) -> bool) {
        tokio::time::timeout(Duration::from_secs(600), async {
            while !done(c) {
                let completion = c.recv().await.expect("completion channel open");
                c.handle(completion);
            }
        })
        .await
        .expect("controller never settled");
    }

    async fn start(c: &mut JobController, model: &str) {
        c.start_job(model);
        pump_until(c, |c| c.snapshot().state != JobState::Starting).await;
    }

    async fn drive_to_finish(c: &mut JobController) {
        pump_until(c, |c| c.snapshot().state.is_terminal() && !c.is_busy()).await;
    }

    async fn download(c: &mut JobController, kind: DownloadKind) -> Result<(), ControllerError> {
        c.download(kind)?;
        pump_until(c, |c| !c.is_busy()).await;
        Ok(())
    }

    fn drain(rx: &mut UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn snapshots(events: &[JobEvent]) -> Vec<&ControllerSnapshot> {
        events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Snapshot(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    async fn next_snapshot_in(rx: &mut UnboundedReceiver<JobEvent>, state: JobState) {
        loop {
            match rx.recv().await {
                Some(JobEvent::Snapshot(s)) if s.state == state => return,
                Some(_) => continue,
                None => panic!("controller closed before reaching {}", state.label()),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_poll_done_and_auto_download() {
        let fake = FakeTransport::new();
        fake.push_start(Ok("p1"));
        fake.push_status("p1", Ok(JobStatus::processing(5, 2, 10)));
        fake.push_status("p1", Ok(JobStatus::done("out_p1.csv", 42)));
        let (mut c, mut rx) = controller(&fake, test_cfg());

        start(&mut c, "grok-3").await;
        let handle = c.snapshot().handle.clone().unwrap();
        assert_eq!(handle.id, "p1");
        assert_eq!(handle.selected_model, "grok-3");
        assert_eq!(c.snapshot().state, JobState::Processing);

        pump_until(&mut c, |c| c.snapshot().status.is_some()).await;
        let status = c.snapshot().status.clone().unwrap();
        assert_eq!(c.snapshot().state, JobState::Processing);
        assert_eq!(
            (status.emails_fetched_count, status.emails_processed_count, status.rows_parsed_count),
            (5, 2, 10)
        );

        drive_to_finish(&mut c).await;
        let snap = c.snapshot();
        assert_eq!(snap.state, JobState::Done);
        assert_eq!(snap.output_file(), Some("out_p1.csv"));
        assert_eq!(snap.status.as_ref().unwrap().rows_parsed_count, 42);
        assert!(snap.error_message().is_none());
        assert_eq!(fake.downloads(), vec!["out_p1.csv".to_string()]);
        assert!(!c.has_active_session());

        let events = drain(&mut rx);
        let states: Vec<JobState> = snapshots(&events).iter().map(|s| s.state).collect();
        assert_eq!(
            states,
            vec![
                JobState::Starting,
                JobState::Processing,
                JobState::Processing,
                JobState::Done
            ]
        );
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, JobEvent::Downloaded(f) if f.filename == "out_p1.csv"))
                .count(),
            1
        );
        assert!(matches!(events.last(), Some(JobEvent::Finished(s)) if s.state == JobState::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_error_is_surfaced_verbatim() {
        let fake = FakeTransport::new();
        fake.push_start(Ok("p1"));
        fake.push_status("p1", Ok(JobStatus::processing(3, 1, 0)));
        fake.push_status("p1", Ok(JobStatus::failed("IMAP login failed")));
        let (mut c, _rx) = controller(&fake, test_cfg());

        start(&mut c, "grok-3-mini").await;
        drive_to_finish(&mut c).await;

        let snap = c.snapshot();
        assert_eq!(snap.state, JobState::Error);
        assert!(snap.output_file().is_none());
        assert_eq!(
            snap.failure,
            Some(JobFailure::RemoteReported("IMAP login failed".into()))
        );
        assert!(snap.error_message().unwrap().contains("IMAP login failed"));
        assert!(fake.downloads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_status_stops_polling() {
        let fake = FakeTransport::new();
        fake.push_start(Ok("p1"));
        fake.push_status("p1", Err(TransportError::NotFound));
        let cfg = ControllerConfig {
            retry: RetryPolicy::default(),
            ..test_cfg()
        };
        let (mut c, _rx) = controller(&fake, cfg);

        start(&mut c, "grok-3").await;
        drive_to_finish(&mut c).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(c.snapshot().state, JobState::Error);
        assert_eq!(c.snapshot().failure, Some(JobFailure::StatusGone));
        assert_eq!(fake.status_calls("p1"), 1);
        assert!(!c.has_active_session());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_remote_during_polling() {
        let fake = FakeTransport::new();
        fake.push_start(Ok("p1"));
        fake.push_status("p1", Err(TransportError::Network("connection reset".into())));
        let (mut c, _rx) = controller(&fake, test_cfg());

        start(&mut c, "grok-3").await;
        drive_to_finish(&mut c).await;

        assert_eq!(
            c.snapshot().failure,
            Some(JobFailure::Unreachable("connection reset".into()))
        );
        assert!(c.snapshot().error_message().unwrap().contains("Could not reach"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_ends_in_error_without_session() {
        let fake = FakeTransport::new();
        fake.push_start(Err(TransportError::Network("refused".into())));
        let (mut c, mut rx) = controller(&fake, test_cfg());

        start(&mut c, "grok-3").await;
        assert_eq!(c.snapshot().failure, Some(JobFailure::Unreachable("refused".into())));
        assert_eq!(c.snapshot().state, JobState::Error);
        assert!(!c.has_active_session());
        assert!(!c.is_busy());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, JobEvent::Finished(s) if s.state == JobState::Error)));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_start_endpoint_is_an_http_failure() {
        let fake = FakeTransport::new();
        fake.push_start(Err(TransportError::NotFound));
        let (mut c, _rx) = controller(&fake, test_cfg());

        start(&mut c, "grok-3").await;
        assert_eq!(c.snapshot().failure, Some(JobFailure::HttpStatus(404)));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_supersedes_exactly_one_session() {
        let fake = FakeTransport::new();
        fake.push_start(Ok("p1"));
        fake.push_start(Ok("p2"));
        let (mut c, mut rx) = controller(&fake, test_cfg());

        start(&mut c, "grok-3").await;
        tokio::time::sleep(Duration::from_millis(2500)).await;
        start(&mut c, "grok-3-fast").await;
        assert!(c.has_active_session());
        assert_eq!(c.snapshot().job_id(), Some("p2"));
        assert_eq!(c.snapshot().model.as_deref(), Some("grok-3-fast"));

        let p1_calls = fake.status_calls("p1");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fake.status_calls("p1"), p1_calls);
        assert!(fake.status_calls("p2") > 1);

        let superseded: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, JobEvent::Info(InfoEvent::Superseded { .. })))
            .collect();
        assert_eq!(superseded.len(), 1);
        assert!(matches!(&superseded[0], JobEvent::Info(InfoEvent::Superseded { id }) if id == "p1"));
    }

    #[tokio::test(start_paused = true)]
    async fn late_events_for_superseded_job_are_ignored() {
        let fake = FakeTransport::new();
        fake.push_start(Ok("p1"));
        fake.push_start(Ok("p2"));
        let (mut c, _rx) = controller(&fake, test_cfg());

        start(&mut c, "grok-3").await;
        start(&mut c, "grok-3").await;
        c.handle_poll_event("p1", PollEvent::Status(JobStatus::done("old.csv", 9)));
        c.handle_poll_event("p1", PollEvent::Failed(TransportError::NotFound));

        assert_eq!(c.snapshot().state, JobState::Processing);
        assert_eq!(c.snapshot().job_id(), Some("p2"));
        assert!(fake.downloads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn start_result_of_an_abandoned_request_is_dropped() {
        let fake = FakeTransport::new().with_start_delay(Duration::from_secs(5));
        fake.push_start(Ok("p1"));
        let (mut c, _rx) = controller(&fake, test_cfg());

        c.start_job("grok-3");
        c.cancel();
        assert!(!c.is_busy());
        tokio::time::sleep(Duration::from_secs(10)).await;

        c.handle(Completion::Started {
            generation: 1,
            model: "grok-3".into(),
            result: Ok(JobHandle {
                id: "p1".into(),
                selected_model: "grok-3".into(),
            }),
        });
        assert_eq!(c.snapshot().state, JobState::Idle);
        assert!(!c.has_active_session());
        assert_eq!(fake.status_calls("p1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn downloads_require_done() {
        let fake = FakeTransport::new();
        fake.push_start(Ok("p1"));
        let (mut c, _rx) = controller(&fake, test_cfg());

        assert_eq!(c.download(DownloadKind::Output).unwrap_err(), ControllerError::NotDone);
        start(&mut c, "grok-3").await;
        assert_eq!(c.download(DownloadKind::Output).unwrap_err(), ControllerError::NotDone);
        assert!(!c.is_busy());
        assert!(fake.downloads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_download_and_single_cleanup() {
        let fake = FakeTransport::new();
        fake.push_start(Ok("p1"));
        fake.push_status("p1", Ok(JobStatus::done("out_p1.csv", 42)));
        let cfg = ControllerConfig {
            auto_download: false,
            ..test_cfg()
        };
        let (mut c, mut rx) = controller(&fake, cfg);

        start(&mut c, "grok-3").await;
        drive_to_finish(&mut c).await;
        assert!(fake.downloads().is_empty());

        download(&mut c, DownloadKind::Output).await.unwrap();
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, JobEvent::Downloaded(f) if f.filename == "out_p1.csv")));
        assert_eq!(
            c.download(DownloadKind::Debug).unwrap_err(),
            ControllerError::NoFile(DownloadKind::Debug)
        );
        download(&mut c, DownloadKind::Output).await.unwrap();
        assert_eq!(fake.downloads().len(), 2);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(fake.cleanups().is_empty());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fake.cleanups(), vec!["p1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_failure_leaves_state_alone() {
        let fake = FakeTransport::new();
        fake.fail_cleanup();
        fake.push_start(Ok("p1"));
        fake.push_status("p1", Ok(JobStatus::done("out_p1.csv", 42)));
        let (mut c, _rx) = controller(&fake, test_cfg());

        start(&mut c, "grok-3").await;
        drive_to_finish(&mut c).await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(fake.cleanups(), vec!["p1".to_string()]);
        assert_eq!(c.snapshot().state, JobState::Done);
        assert!(c.snapshot().error_message().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_download_keeps_done_and_skips_cleanup() {
        let fake = FakeTransport::new();
        fake.fail_download("out_p1.csv");
        fake.push_start(Ok("p1"));
        fake.push_status("p1", Ok(JobStatus::done("out_p1.csv", 42)));
        let (mut c, mut rx) = controller(&fake, test_cfg());

        start(&mut c, "grok-3").await;
        drive_to_finish(&mut c).await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(c.snapshot().state, JobState::Done);
        assert!(fake.cleanups().is_empty());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, JobEvent::DownloadFailed { filename, .. } if filename == "out_p1.csv")));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rows_skips_output_download() {
        let fake = FakeTransport::new();
        fake.push_start(Ok("p1"));
        fake.push_status("p1", Ok(JobStatus::done("out_p1.csv", 0)));
        let (mut c, mut rx) = controller(&fake, test_cfg());

        start(&mut c, "grok-3").await;
        drive_to_finish(&mut c).await;

        assert_eq!(c.snapshot().output_file(), Some("out_p1.csv"));
        assert!(fake.downloads().is_empty());
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, JobEvent::Info(InfoEvent::NoRowsParsed { id }) if id == "p1")));
        assert!(matches!(events.last(), Some(JobEvent::Finished(s)) if s.state == JobState::Done));
    }

    #[tokio::test(start_paused = true)]
    async fn debug_and_failed_files_download_before_output() {
        let fake = FakeTransport::new();
        fake.push_start(Ok("p1"));
        fake.push_status(
            "p1",
            Ok(JobStatus {
                debug_file: Some("debug_p1.log".into()),
                ..JobStatus::done("out_p1.csv", 42)
            }),
        );
        let cfg = ControllerConfig {
            enable_debug_download: true,
            derive_failed_file: true,
            ..test_cfg()
        };
        let (mut c, mut rx) = controller(&fake, cfg);

        start(&mut c, "grok-3").await;
        drive_to_finish(&mut c).await;

        assert_eq!(
            fake.downloads(),
            vec![
                "debug_p1.log".to_string(),
                "out_p1_failed.csv".to_string(),
                "out_p1.csv".to_string()
            ]
        );
        let events = drain(&mut rx);
        let finished_at = events
            .iter()
            .position(|e| matches!(e, JobEvent::Finished(_)))
            .unwrap();
        let last_download = events
            .iter()
            .rposition(|e| matches!(e, JobEvent::Downloaded(_)))
            .unwrap();
        assert!(last_download < finished_at);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_pending_cleanup() {
        let fake = FakeTransport::new();
        fake.push_start(Ok("p1"));
        fake.push_status("p1", Ok(JobStatus::done("out_p1.csv", 42)));
        let (mut c, _rx) = controller(&fake, test_cfg());

        start(&mut c, "grok-3").await;
        drive_to_finish(&mut c).await;
        assert!(fake.cleanups().is_empty());

        c.shutdown().await;
        assert_eq!(fake.cleanups(), vec!["p1".to_string()]);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fake.cleanups().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_returns_to_idle() {
        let fake = FakeTransport::new();
        fake.push_start(Ok("p1"));
        let (mut c, _rx) = controller(&fake, test_cfg());

        start(&mut c, "grok-3").await;
        c.cancel();
        c.cancel();
        assert_eq!(c.snapshot().state, JobState::Idle);
        assert!(!c.has_active_session());

        let calls = fake.status_calls("p1");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fake.status_calls("p1"), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn command_loop_runs_job_and_quits() {
        let fake = FakeTransport::new();
        fake.push_start(Ok("p1"));
        fake.push_status("p1", Ok(JobStatus::done("out_p1.csv", 42)));
        let (c, mut rx) = controller(&fake, test_cfg());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_controller(c, cmd_rx));
        cmd_tx.send(UiCommand::Start("grok-3".into())).unwrap();

        let finished = loop {
            match rx.recv().await {
                Some(JobEvent::Finished(s)) => break s,
                Some(_) => continue,
                None => panic!("controller closed before finishing"),
            }
        };
        assert_eq!(finished.output_file(), Some("out_p1.csv"));

        cmd_tx.send(UiCommand::Quit).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(fake.cleanups(), vec!["p1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn quit_is_honoured_while_start_hangs() {
        let fake = FakeTransport::new().with_start_delay(Duration::from_secs(30));
        fake.push_start(Ok("p1"));
        let (c, _rx) = controller(&fake, test_cfg());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_controller(c, cmd_rx));
        cmd_tx.send(UiCommand::Start("grok-3".into())).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let asked = tokio::time::Instant::now();
        cmd_tx.send(UiCommand::Quit).unwrap();
        task.await.unwrap().unwrap();
        assert!(asked.elapsed() < Duration::from_secs(1), "quit took {:?}", asked.elapsed());
        assert_eq!(fake.status_calls("p1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_honoured_while_auto_download_hangs() {
        let fake = FakeTransport::new().with_download_delay(Duration::from_secs(30));
        fake.push_start(Ok("p1"));
        fake.push_status("p1", Ok(JobStatus::done("out_p1.csv", 42)));
        let (c, mut rx) = controller(&fake, test_cfg());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_controller(c, cmd_rx));
        cmd_tx.send(UiCommand::Start("grok-3".into())).unwrap();
        next_snapshot_in(&mut rx, JobState::Done).await;

        let asked = tokio::time::Instant::now();
        cmd_tx.send(UiCommand::Cancel).unwrap();
        next_snapshot_in(&mut rx, JobState::Idle).await;
        assert!(asked.elapsed() < Duration::from_secs(1), "cancel took {:?}", asked.elapsed());

        cmd_tx.send(UiCommand::Quit).unwrap();
        task.await.unwrap().unwrap();
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, JobEvent::Downloaded(_) | JobEvent::Finished(_))));
        assert!(fake.cleanups().is_empty());
    }
}
