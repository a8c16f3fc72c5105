//! Serial task queue in front of the batch pipeline.
//!
//! Requests are recorded in the persisted pending set first, then handed to a single worker
//! thread over a channel. The worker runs one gallery at a time and reports through the
//! notifier; whatever is still pending when the process dies is picked up again by
//! [`TaskCoordinator::dispatch_pending`].

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use panelforge_contracts::{
    GalleryReference, LibraryIndex, ProcessingMode, ProviderConfig, SettingsStore, Stage,
};
use thiserror::Error;

use crate::failure::TransformFailure;
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::pipeline::{
    BatchPipeline, PageOutcome, PipelineError, PipelineObserver, PipelineOptions, RunReport,
};
use crate::providers::{AiTransformClient, PageTransformer};

/// Builds the transformer for one run from the settings current at dispatch time.
pub trait TransformerFactory: Send + Sync {
    fn build(&self, config: &ProviderConfig) -> Result<Box<dyn PageTransformer>>;
}

/// Talks to the configured provider over HTTP.
pub struct AiClientFactory;

impl TransformerFactory for AiClientFactory {
    fn build(&self, config: &ProviderConfig) -> Result<Box<dyn PageTransformer>> {
        let client = AiTransformClient::new(config)?;
        log::debug!("using {} provider ({})", client.provider_name(), config.model);
        Ok(Box::new(client))
    }
}

#[derive(Clone)]
pub struct CoordinatorContext {
    pub settings: SettingsStore,
    pub library: LibraryIndex,
    pub notifier: Arc<dyn Notifier>,
    pub factory: Arc<dyn TransformerFactory>,
    /// Used when settings carry no `output_root`.
    pub default_output_root: PathBuf,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task could not start: {0:#}")]
    Setup(anyhow::Error),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Debug)]
pub struct TaskOutcome {
    pub gallery_id: u64,
    pub mode: ProcessingMode,
    pub result: std::result::Result<RunReport, TaskError>,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

struct QueuedTask {
    gallery: GalleryReference,
    mode: ProcessingMode,
}

/// Galleries handed to the worker whose run has not finished yet.
type InFlight = Arc<Mutex<HashSet<u64>>>;

pub struct TaskCoordinator {
    context: CoordinatorContext,
    sender: Option<mpsc::Sender<QueuedTask>>,
    handle: Option<thread::JoinHandle<()>>,
    outcomes: Arc<Mutex<Vec<TaskOutcome>>>,
    in_flight: InFlight,
}

impl TaskCoordinator {
    /// Spawns the worker thread; it lives until [`TaskCoordinator::finish`] or drop.
    pub fn start(context: CoordinatorContext) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let in_flight = InFlight::default();
        let worker = TaskWorker {
            context: context.clone(),
            outcomes: Arc::clone(&outcomes),
            in_flight: Arc::clone(&in_flight),
        };
        let handle = thread::Builder::new()
            .name("panelforge-worker".to_string())
            .spawn(move || worker.run(rx))
            .context("failed spawning task worker")?;
        Ok(Self {
            context,
            sender: Some(tx),
            handle: Some(handle),
            outcomes,
            in_flight,
        })
    }

    /// Records `(gallery, mode)` as pending; refuses (and notifies) when no API key is set.
    pub fn enqueue(&self, gallery: &GalleryReference, mode: ProcessingMode) -> Result<()> {
        if mode == ProcessingMode::None {
            log::debug!("nothing to do for gallery {} (mode None)", gallery.id);
            return Ok(());
        }
        let config = self.context.settings.load()?.provider_config();
        if !config.has_credential() {
            let failure = TransformFailure::MissingCredential;
            self.context.notifier.notify(&Notification::new(
                config.channel(),
                NotificationKind::Rejected,
                gallery.id,
                task_title(mode, gallery),
                format!("{failure}. {}", failure.suggestion()),
            ));
            bail!("cannot queue gallery {}: {failure}", gallery.id);
        }
        self.context.settings.add_pending(gallery.id, mode)?;
        self.context.notifier.notify(&Notification::new(
            config.channel(),
            NotificationKind::Queued,
            gallery.id,
            task_title(mode, gallery),
            "waiting for the worker",
        ));
        Ok(())
    }

    /// Hands a task to the worker; runs start in dispatch order.
    pub fn dispatch(&self, gallery: GalleryReference, mode: ProcessingMode) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("task worker already stopped"))?;
        let gallery_id = gallery.id;
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.insert(gallery_id);
        }
        sender.send(QueuedTask { gallery, mode }).map_err(|_| {
            anyhow!("task worker is not running; gallery {gallery_id} not dispatched")
        })
    }

    /// Manual request: enqueue and dispatch right away.
    pub fn submit(&self, gallery: GalleryReference, mode: ProcessingMode) -> Result<()> {
        self.enqueue(&gallery, mode)?;
        if mode == ProcessingMode::None {
            return Ok(());
        }
        self.dispatch(gallery, mode)
    }

    /// Re-dispatches persisted pending tasks; ids missing from the library are dropped.
    ///
    /// Galleries this coordinator already handed to the worker are left alone.
    pub fn dispatch_pending(&self) -> Result<usize> {
        let mut dispatched = 0;
        for (id, mode) in self.context.settings.pending()? {
            if self.is_in_flight(id) {
                log::debug!("gallery {id} is already queued");
                continue;
            }
            match self.context.library.get(id)? {
                Some(gallery) => {
                    self.dispatch(gallery, mode)?;
                    dispatched += 1;
                }
                None => {
                    log::warn!("dropping pending task for unknown gallery {id}");
                    self.context.settings.remove_pending(id)?;
                }
            }
        }
        Ok(dispatched)
    }

    fn is_in_flight(&self, gallery_id: u64) -> bool {
        self.in_flight
            .lock()
            .map(|in_flight| in_flight.contains(&gallery_id))
            .unwrap_or(false)
    }

    pub fn pending(&self) -> Result<BTreeMap<u64, ProcessingMode>> {
        self.context.settings.pending()
    }

    /// Closes the queue, waits for the worker to drain it, and returns every outcome.
    pub fn finish(mut self) -> Vec<TaskOutcome> {
        self.shutdown();
        self.outcomes
            .lock()
            .map(|mut outcomes| std::mem::take(&mut *outcomes))
            .unwrap_or_default()
    }

    fn shutdown(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("task worker panicked");
            }
        }
    }
}

impl Drop for TaskCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct TaskWorker {
    context: CoordinatorContext,
    outcomes: Arc<Mutex<Vec<TaskOutcome>>>,
    in_flight: InFlight,
}

impl TaskWorker {
    fn run(self, rx: mpsc::Receiver<QueuedTask>) {
        while let Ok(task) = rx.recv() {
            let outcome = self.process(task);
            if let Ok(mut in_flight) = self.in_flight.lock() {
                in_flight.remove(&outcome.gallery_id);
            }
            if let Ok(mut outcomes) = self.outcomes.lock() {
                outcomes.push(outcome);
            }
        }
        log::debug!("task queue closed");
    }

    fn process(&self, task: QueuedTask) -> TaskOutcome {
        let QueuedTask { gallery, mode } = task;
        if let Err(err) = self.context.settings.remove_pending(gallery.id) {
            log::warn!("failed clearing pending task {}: {err:#}", gallery.id);
        }
        let result = self.execute(&gallery, mode);
        TaskOutcome {
            gallery_id: gallery.id,
            mode,
            result,
        }
    }

    fn execute(
        &self,
        gallery: &GalleryReference,
        mode: ProcessingMode,
    ) -> std::result::Result<RunReport, TaskError> {
        let title = task_title(mode, gallery);
        let settings = match self.context.settings.load() {
            Ok(settings) => settings,
            Err(err) => {
                self.notify_failure("ai", gallery, &title, &format!("{err:#}"));
                return Err(TaskError::Setup(err));
            }
        };
        let config = settings.provider_config();
        let channel = config.channel();

        let transformer = match self.context.factory.build(&config) {
            Ok(transformer) => transformer,
            Err(err) => {
                self.notify_failure(&channel, gallery, &title, &format!("{err:#}"));
                return Err(TaskError::Setup(err));
            }
        };

        self.context.notifier.notify(&Notification::new(
            channel.as_str(),
            NotificationKind::Started,
            gallery.id,
            title.as_str(),
            format!("{} stage(s) with {}", mode.stages().len(), config.model),
        ));
        let options =
            PipelineOptions::from_settings(&settings, &self.context.default_output_root);
        let pipeline = BatchPipeline::new(transformer.as_ref(), &self.context.library, options);
        let observer = NotifyingObserver {
            notifier: self.context.notifier.as_ref(),
            channel: &channel,
            gallery_id: gallery.id,
            title: &title,
        };

        match pipeline.run(gallery, mode, &observer) {
            Ok(report) => {
                let outputs = report
                    .outputs()
                    .map(|output| output.title.clone())
                    .collect::<Vec<_>>()
                    .join(", ");
                self.context.notifier.notify(&Notification::new(
                    channel.as_str(),
                    NotificationKind::Completed,
                    gallery.id,
                    title.as_str(),
                    format!("saved {outputs}"),
                ));
                Ok(report)
            }
            Err(err) => {
                let message = match err.failure() {
                    Some(failure) => format!("{err}. {}", failure.suggestion()),
                    None => err.to_string(),
                };
                self.notify_failure(&channel, gallery, &title, &message);
                Err(TaskError::Pipeline(err))
            }
        }
    }

    fn notify_failure(
        &self,
        channel: &str,
        gallery: &GalleryReference,
        title: &str,
        message: &str,
    ) {
        self.context.notifier.notify(&Notification::new(
            channel,
            NotificationKind::Failed,
            gallery.id,
            title,
            message,
        ));
    }
}

struct NotifyingObserver<'a> {
    notifier: &'a dyn Notifier,
    channel: &'a str,
    gallery_id: u64,
    title: &'a str,
}

impl NotifyingObserver<'_> {
    fn progress(&self, message: String, done: usize, total: usize) {
        self.notifier.notify(
            &Notification::new(
                self.channel,
                NotificationKind::Progress,
                self.gallery_id,
                self.title,
                message,
            )
            .with_progress(done, total),
        );
    }
}

impl PipelineObserver for NotifyingObserver<'_> {
    fn stage_started(
        &self,
        stage: Stage,
        _dir: &std::path::Path,
        resume_from: usize,
        total: usize,
    ) {
        let message = if resume_from > 0 {
            format!("{} resuming at page {} of {total}", stage.label(), resume_from + 1)
        } else {
            format!("{} starting, {total} pages", stage.label())
        };
        self.progress(message, resume_from, total);
    }

    fn page_processed(&self, stage: Stage, page: usize, total: usize, outcome: &PageOutcome) {
        let message = match outcome {
            PageOutcome::Transformed => format!("{} page {} of {total}", stage.label(), page + 1),
            PageOutcome::Filler(failure) => format!(
                "{} page {} of {total} left unchanged: {failure}",
                stage.label(),
                page + 1
            ),
        };
        self.progress(message, page + 1, total);
    }

    fn stage_skipped(&self, stage: Stage, output: &GalleryReference) {
        self.progress(
            format!("{} already done as {}", stage.label(), output.title),
            output.page_count,
            output.page_count,
        );
    }

    fn stage_completed(&self, stage: Stage, output: &GalleryReference) {
        self.progress(
            format!("{} saved as {}", stage.label(), output.title),
            output.page_count,
            output.page_count,
        );
    }
}

fn task_title(mode: ProcessingMode, gallery: &GalleryReference) -> String {
    format!("AI {mode}: {}", gallery.title)
}
