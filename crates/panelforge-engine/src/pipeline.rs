//! Resumable, chained batch transformation of a gallery's pages.
//!
//! Each stage owns a target directory next to the other generated galleries. The directory is
//! first filled with untouched copies of the input pages; pages are then transformed in place
//! in name order and the resume marker records the next page to request. A run that dies or
//! aborts leaves the directory and marker behind, so the next run continues where it stopped.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context};
use image::DynamicImage;
use panelforge_contracts::{
    GalleryReference, LibraryIndex, ProcessingMode, Settings, Stage, StageInput,
};
use thiserror::Error;

use crate::failure::TransformFailure;
use crate::providers::PageTransformer;
use crate::source::open_source;
use crate::storage::{
    list_pages, resolve_target_dir, stage_directory_name, write_page, PageNamer, ResumeMarker,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Pause after each successful transform.
    pub request_delay: Duration,
    /// Consecutive retryable failures tolerated before the run aborts.
    pub max_consecutive_failures: u32,
    /// Parent directory of every stage output directory.
    pub output_root: PathBuf,
}

impl PipelineOptions {
    pub fn from_settings(settings: &Settings, default_output_root: &Path) -> Self {
        Self {
            request_delay: settings.request_delay(),
            max_consecutive_failures: settings.max_consecutive_failures,
            output_root: settings
                .output_root
                .clone()
                .unwrap_or_else(|| default_output_root.to_path_buf()),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} stage could not be prepared: {source:#}")]
    Prepare {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
    #[error("{stage} stage aborted at page {page}: {failure}")]
    Aborted {
        stage: Stage,
        page: usize,
        failure: TransformFailure,
    },
    #[error("{stage} stage gave up at page {page} after {failures} consecutive failures: {last}")]
    RetryBudgetExhausted {
        stage: Stage,
        page: usize,
        failures: u32,
        last: TransformFailure,
    },
    #[error("{stage} stage could not be finalized: {source:#}")]
    Finalize {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Prepare { stage, .. }
            | PipelineError::Aborted { stage, .. }
            | PipelineError::RetryBudgetExhausted { stage, .. }
            | PipelineError::Finalize { stage, .. } => *stage,
        }
    }

    /// The classified page failure behind the abort, if there was one.
    pub fn failure(&self) -> Option<&TransformFailure> {
        match self {
            PipelineError::Aborted { failure, .. } => Some(failure),
            PipelineError::RetryBudgetExhausted { last, .. } => Some(last),
            PipelineError::Prepare { .. } | PipelineError::Finalize { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    Transformed,
    /// The page was left as it was; the failure counted toward the retry budget.
    Filler(TransformFailure),
}

/// Progress hooks; every method defaults to doing nothing.
pub trait PipelineObserver {
    fn stage_started(&self, _stage: Stage, _dir: &Path, _resume_from: usize, _total: usize) {}

    fn page_processed(&self, _stage: Stage, _page: usize, _total: usize, _outcome: &PageOutcome) {}

    fn stage_skipped(&self, _stage: Stage, _output: &GalleryReference) {}

    fn stage_completed(&self, _stage: Stage, _output: &GalleryReference) {}
}

pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Stage,
    pub directory: PathBuf,
    pub output: GalleryReference,
    /// Already complete on entry; nothing was requested.
    pub skipped: bool,
    pub transformed: usize,
    pub fillers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub gallery_id: u64,
    pub mode: ProcessingMode,
    pub stages: Vec<StageReport>,
}

impl RunReport {
    pub fn outputs(&self) -> impl Iterator<Item = &GalleryReference> {
        self.stages.iter().map(|stage| &stage.output)
    }
}

pub struct BatchPipeline<'a> {
    transformer: &'a dyn PageTransformer,
    library: &'a LibraryIndex,
    options: PipelineOptions,
}

impl<'a> BatchPipeline<'a> {
    pub fn new(
        transformer: &'a dyn PageTransformer,
        library: &'a LibraryIndex,
        options: PipelineOptions,
    ) -> Self {
        Self {
            transformer,
            library,
            options,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Runs every stage of `mode` in order, feeding each stage's output into the next.
    pub fn run(
        &self,
        gallery: &GalleryReference,
        mode: ProcessingMode,
        observer: &dyn PipelineObserver,
    ) -> Result<RunReport, PipelineError> {
        let mut stages = Vec::new();
        let mut previous_dir: Option<PathBuf> = None;
        for &stage in mode.stages() {
            let report = self.run_stage(gallery, stage, previous_dir.as_deref(), observer)?;
            previous_dir = Some(report.directory.clone());
            stages.push(report);
        }
        Ok(RunReport {
            gallery_id: gallery.id,
            mode,
            stages,
        })
    }

    fn run_stage(
        &self,
        gallery: &GalleryReference,
        stage: Stage,
        previous_dir: Option<&Path>,
        observer: &dyn PipelineObserver,
    ) -> Result<StageReport, PipelineError> {
        let prepare = |source: anyhow::Error| PipelineError::Prepare { stage, source };

        let dir_name = stage_directory_name(stage.suffix(), &gallery.title);
        let dir = resolve_target_dir(&self.options.output_root, &dir_name)
            .with_context(|| format!("failed resolving directory for {dir_name}"))
            .map_err(prepare)?;
        let marker = ResumeMarker::in_dir(&dir);
        let registered = self
            .library
            .get(stage.derived_id(gallery.id))
            .map_err(prepare)?;
        let existing_pages = list_pages(&dir)
            .with_context(|| format!("failed listing {}", dir.display()))
            .map_err(prepare)?;

        if !marker.exists() {
            if let Some(output) = registered.filter(|_| !existing_pages.is_empty()) {
                log::info!(
                    "{stage} output for gallery {} already complete at {}",
                    gallery.id,
                    dir.display()
                );
                observer.stage_skipped(stage, &output);
                return Ok(StageReport {
                    stage,
                    directory: dir,
                    output,
                    skipped: true,
                    transformed: 0,
                    fillers: 0,
                });
            }
            self.populate(gallery, stage, previous_dir, &dir, &existing_pages)
                .map_err(prepare)?;
            marker
                .write(0)
                .with_context(|| format!("failed writing {}", marker.path().display()))
                .map_err(prepare)?;
        }

        let pages = list_pages(&dir)
            .with_context(|| format!("failed listing {}", dir.display()))
            .map_err(prepare)?;
        if pages.is_empty() {
            return Err(prepare(anyhow!(
                "gallery {} has no pages to process",
                gallery.id
            )));
        }
        let total = pages.len();
        let start = marker.read().unwrap_or(0).min(total);
        log::info!(
            "{stage} stage for gallery {}: pages {start}..{total} in {}",
            gallery.id,
            dir.display()
        );
        observer.stage_started(stage, &dir, start, total);

        let max_failures = self.options.max_consecutive_failures.max(1);
        let mut consecutive_failures = 0u32;
        let mut transformed = 0usize;
        let mut fillers = 0usize;
        for (index, page) in pages.iter().enumerate().skip(start) {
            let result = load_page(page)
                .and_then(|image| self.transformer.transform(&image, stage.instruction()));
            match result {
                Ok(output) => {
                    let committed =
                        write_page(page, &output).and_then(|()| marker.write(index + 1));
                    if let Err(err) = committed {
                        return Err(PipelineError::Aborted {
                            stage,
                            page: index,
                            failure: TransformFailure::storage(&err),
                        });
                    }
                    consecutive_failures = 0;
                    transformed += 1;
                    observer.page_processed(stage, index, total, &PageOutcome::Transformed);
                    if index + 1 < total && !self.options.request_delay.is_zero() {
                        thread::sleep(self.options.request_delay);
                    }
                }
                Err(failure) if !failure.is_retryable() => {
                    log::warn!("{stage} page {index} failed, aborting: {failure}");
                    return Err(PipelineError::Aborted {
                        stage,
                        page: index,
                        failure,
                    });
                }
                Err(failure) => {
                    consecutive_failures += 1;
                    log::warn!(
                        "{stage} page {index} failed ({}/{max_failures}): {failure}",
                        consecutive_failures
                    );
                    if consecutive_failures >= max_failures {
                        return Err(PipelineError::RetryBudgetExhausted {
                            stage,
                            page: index,
                            failures: consecutive_failures,
                            last: failure,
                        });
                    }
                    fillers += 1;
                    observer.page_processed(stage, index, total, &PageOutcome::Filler(failure));
                }
            }
        }

        let finalize = |source: anyhow::Error| PipelineError::Finalize { stage, source };
        let (output, created) = self
            .library
            .register_stage_output(gallery, stage, &dir, total)
            .map_err(finalize)?;
        marker
            .clear()
            .with_context(|| format!("failed removing {}", marker.path().display()))
            .map_err(finalize)?;
        if !created {
            log::debug!("{stage} output {} was already registered", output.id);
        }
        observer.stage_completed(stage, &output);
        Ok(StageReport {
            stage,
            directory: dir,
            output,
            skipped: false,
            transformed,
            fillers,
        })
    }

    /// Fills `dir` with untouched copies of the stage's input pages.
    fn populate(
        &self,
        gallery: &GalleryReference,
        stage: Stage,
        previous_dir: Option<&Path>,
        dir: &Path,
        stale_pages: &[PathBuf],
    ) -> anyhow::Result<()> {
        if !stale_pages.is_empty() {
            log::warn!(
                "{} holds pages from an interrupted copy, starting over",
                dir.display()
            );
            for page in stale_pages {
                fs::remove_file(page)
                    .with_context(|| format!("failed removing {}", page.display()))?;
            }
        }

        match stage.input() {
            StageInput::OriginalSource => copy_from_source(gallery, dir),
            StageInput::PreviousStage => {
                let previous = previous_dir
                    .ok_or_else(|| anyhow!("{stage} needs the output of an earlier stage"))?;
                copy_from_stage(previous, dir)
            }
        }
    }
}

fn copy_from_source(gallery: &GalleryReference, dir: &Path) -> anyhow::Result<()> {
    let mut source = open_source(&gallery.location)?;
    let namer = PageNamer::for_pages(source.len());
    for index in 0..source.len() {
        let raw_name = source.name(index).unwrap_or_default().to_string();
        let target = dir.join(namer.assign(&raw_name, index));
        let file = File::create(&target)
            .with_context(|| format!("failed creating {}", target.display()))?;
        let mut sink = BufWriter::new(file);
        source.copy_raw(index, &mut sink)?;
        sink.into_inner()
            .map_err(|err| anyhow!("failed flushing {}: {}", target.display(), err.error()))?;
    }
    log::debug!("copied {} pages into {}", source.len(), dir.display());
    Ok(())
}

fn copy_from_stage(previous: &Path, dir: &Path) -> anyhow::Result<()> {
    let pages =
        list_pages(previous).with_context(|| format!("failed listing {}", previous.display()))?;
    for page in &pages {
        let Some(name) = page.file_name() else {
            continue;
        };
        let target = dir.join(name);
        fs::copy(page, &target).with_context(|| {
            format!("failed copying {} to {}", page.display(), target.display())
        })?;
    }
    log::debug!("copied {} pages from {}", pages.len(), previous.display());
    Ok(())
}

fn load_page(path: &Path) -> Result<DynamicImage, TransformFailure> {
    let bytes = fs::read(path).map_err(|err| TransformFailure::storage(&err))?;
    image::load_from_memory(&bytes).map_err(|err| {
        TransformFailure::ImageDecodeFailure(format!("{}: {err}", path.display()))
    })
}
