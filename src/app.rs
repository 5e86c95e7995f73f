use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncBufRead;
use tracing::{debug, info, instrument, warn};

use crate::abort::AbortMonitor;
use crate::annotation::{AnnotationClient, CollectSummary, JobPoller};
use crate::chains;
use crate::classify::{self, ClassifiedMd, ClassifiedProject};
use crate::config::ResolvedConfig;
use crate::domain::{
    AnalysisRecord, BlobKind, FileRecord, MdRunSummary, Metadata, ProjectHandle, ProjectRef,
    Scope, TrajectoryInfo, UnitId,
};
use crate::error::IngestError;
use crate::forestall::{ConflictPolicy, ConsolePrompt, DecisionProvider, Forestall};
use crate::fs_util;
use crate::store::RemoteStore;
use crate::sync::{ProjectSynchronizer, Resolution};
use crate::trace::TraceFile;
use crate::trajectory::{self, TrajectoryReader};
use crate::upload::{UploadReceipt, upload};

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub project: Option<ProjectRef>,
    pub mds: Vec<Utf8PathBuf>,
    pub conserve: bool,
    pub overwrite: bool,
    pub skip_chains: bool,
    pub publish: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnitCounts {
    pub loaded: usize,
    pub skipped: usize,
}

impl UnitCounts {
    fn record(&mut self, loaded: bool) {
        if loaded {
            self.loaded += 1;
        } else {
            self.skipped += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MdReport {
    pub name: String,
    pub index: usize,
    pub trajectory: Option<TrajectoryInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub project: String,
    pub accession: Option<String>,
    pub resolution: Resolution,
    pub policy: ConflictPolicy,
    pub started_at: String,
    pub finished_at: String,
    pub metadata: UnitCounts,
    pub references: UnitCounts,
    pub topology: UnitCounts,
    pub files: UnitCounts,
    pub trajectories: UnitCounts,
    pub analyses: UnitCounts,
    pub md_metadata: UnitCounts,
    pub bytes_uploaded: u64,
    pub mds: Vec<MdReport>,
    pub annotation_jobs: usize,
    pub chains: CollectSummary,
    pub published: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AbortResult {
    pub project: String,
    pub abort: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

/// JSON documents read up front so malformed input fails before any remote write.
struct LocalDocuments {
    metadata: Option<Metadata>,
    topology: Option<Value>,
    references: Vec<Value>,
    md_metadata: Vec<Option<Metadata>>,
}

struct Run<'a, S: ?Sized> {
    project: &'a str,
    monitor: AbortMonitor<'a, S>,
    forestall: Forestall<'a>,
    sink: &'a dyn ProgressSink,
    started: Instant,
}

impl<S: RemoteStore + ?Sized> Run<'_, S> {
    fn emit(&self, message: String) {
        self.sink.event(ProgressEvent {
            message,
            elapsed: Some(self.started.elapsed()),
        });
    }

    /// Reports the next step, then refuses to start it if an abort is pending.
    async fn checkpoint(&self, message: String) -> Result<(), IngestError> {
        self.emit(message);
        self.monitor.check().await
    }
}

pub struct App<S: RemoteStore, A: AnnotationClient> {
    store: S,
    annotator: Arc<A>,
    config: ResolvedConfig,
    decisions: Box<dyn DecisionProvider>,
}

impl<S: RemoteStore, A: AnnotationClient> App<S, A> {
    pub fn new(store: S, annotator: A, config: ResolvedConfig) -> Self {
        Self {
            store,
            annotator: Arc::new(annotator),
            config,
            decisions: Box::new(ConsolePrompt),
        }
    }

    pub fn with_decisions(mut self, decisions: Box<dyn DecisionProvider>) -> Self {
        self.decisions = decisions;
        self
    }

    /// Raises (or clears) the abort flag of an existing project.
    pub async fn abort(&self, reference: &ProjectRef, abort: bool) -> Result<AbortResult, IngestError> {
        let handle = self
            .store
            .find_project(reference)
            .await?
            .ok_or_else(|| IngestError::ProjectNotFound(reference.to_string()))?;
        self.store.request_abort(&handle.id, abort).await?;
        info!(project = %handle.id, abort, "abort flag updated");
        Ok(AbortResult {
            project: handle.id,
            abort,
        })
    }

    #[instrument(skip_all, fields(dir = %dir))]
    pub async fn load(
        &self,
        dir: &Utf8Path,
        options: LoadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<LoadReport, IngestError> {
        let policy = ConflictPolicy::from_flags(options.conserve, options.overwrite)?;
        let started = Instant::now();
        let started_at = iso_timestamp();

        sink.event(ProgressEvent {
            message: format!("phase=Validate; classifying {dir}"),
            elapsed: None,
        });
        let classified = classify::classify(dir, &options.mds, &self.config.classify).await?;
        let documents = read_documents(&classified).await?;

        sink.event(ProgressEvent {
            message: "phase=Sync; resolving remote project".to_string(),
            elapsed: Some(started.elapsed()),
        });
        let trace = TraceFile::for_directory(dir);
        let synced = ProjectSynchronizer::new(&self.store, &trace)
            .resolve(options.project.as_ref())
            .await?;
        let ProjectHandle { id, accession } = synced.handle;

        let run = Run {
            project: &id,
            monitor: AbortMonitor::new(&self.store, &id),
            forestall: Forestall::new(policy, self.decisions.as_ref()),
            sink,
            started,
        };
        let mut report = LoadReport {
            project: id.clone(),
            accession,
            resolution: synced.resolution,
            policy,
            started_at,
            finished_at: String::new(),
            metadata: UnitCounts::default(),
            references: UnitCounts::default(),
            topology: UnitCounts::default(),
            files: UnitCounts::default(),
            trajectories: UnitCounts::default(),
            analyses: UnitCounts::default(),
            md_metadata: UnitCounts::default(),
            bytes_uploaded: 0,
            mds: Vec::new(),
            annotation_jobs: 0,
            chains: CollectSummary::default(),
            published: false,
        };

        let poller = if options.skip_chains {
            None
        } else {
            self.submit_chains(&run, &classified, &mut report).await?
        };

        run.checkpoint("phase=Metadata; reconciling project metadata".to_string())
            .await?;
        if let Some(metadata) = &documents.metadata {
            self.load_project_metadata(&run, metadata, &mut report.metadata)
                .await?;
        }

        run.checkpoint(format!(
            "phase=References; {} reference documents",
            documents.references.len()
        ))
        .await?;
        for document in &documents.references {
            report.references.record(self.load_reference(document).await?);
        }

        run.checkpoint("phase=Topology; loading topology".to_string())
            .await?;
        if let Some(topology) = &documents.topology {
            report.topology.record(self.load_topology(&run, topology).await?);
        }

        run.checkpoint(format!(
            "phase=Files; {} project files",
            classified.files.len()
        ))
        .await?;
        for path in &classified.files {
            run.monitor.check().await?;
            let loaded = self
                .load_file(&run, Scope::Project, path, &mut report.bytes_uploaded)
                .await?;
            report.files.record(loaded);
        }

        let remote_runs = self.store.md_runs(&id).await?;
        let resumed = resolve_md_indices(&classified.mds, &remote_runs, options.mds.is_empty())?;
        for (position, (md, resumed)) in classified.mds.iter().zip(resumed).enumerate() {
            run.checkpoint(format!("phase=MD; md={}", md.name)).await?;
            let index = match resumed {
                Some(index) => index,
                None => self.store.add_md_run(&id, &md.name).await?,
            };
            let md_report = self
                .load_md(
                    &run,
                    md,
                    index,
                    documents.md_metadata.get(position).and_then(Option::as_ref),
                    &mut report,
                )
                .await?;
            report.mds.push(md_report);
        }

        if let Some(poller) = poller {
            run.checkpoint(format!(
                "phase=Chains; waiting for {} annotation jobs",
                poller.pending()
            ))
            .await?;
            report.chains = poller
                .collect(
                    &self.store,
                    &run.monitor,
                    self.config.annotation.abort_poll_interval,
                )
                .await?;
            if report.chains.jobs_failed > 0 {
                warn!(
                    failed = report.chains.jobs_failed,
                    "some chain annotations are missing, rerun to retry them"
                );
            }
        }

        if options.publish {
            run.checkpoint("phase=Publish; marking project as published".to_string())
                .await?;
            self.store.set_published(&id, true).await?;
            report.published = true;
        }

        report.finished_at = iso_timestamp();
        run.emit("phase=Done; project loaded".to_string());
        info!(project = %id, bytes = report.bytes_uploaded, "load complete");
        Ok(report)
    }

    async fn submit_chains(
        &self,
        run: &Run<'_, S>,
        classified: &ClassifiedProject,
        report: &mut LoadReport,
    ) -> Result<Option<JobPoller<A>>, IngestError> {
        let Some(structure) = &classified.structure else {
            warn!("no structure file, skipping chain annotations");
            return Ok(None);
        };
        let sequences = chains::read_structure(structure).await?;
        run.checkpoint(format!(
            "phase=Chains; {} distinct chain sequences",
            sequences.len()
        ))
        .await?;
        if sequences.is_empty() {
            return Ok(None);
        }

        let exists = !self.store.chains(run.project).await?.is_empty();
        let proceed = run
            .forestall
            .decide(&UnitId::ChainAnnotations, exists, || {
                self.store.delete_chains(run.project)
            })
            .await?;
        if !proceed {
            return Ok(None);
        }

        let mut poller = JobPoller::new(Arc::clone(&self.annotator));
        for sequence in sequences {
            poller.submit(sequence);
        }
        report.annotation_jobs = poller.pending();
        Ok(Some(poller))
    }

    /// Each local key that differs from the stored value is its own unit.
    async fn load_project_metadata(
        &self,
        run: &Run<'_, S>,
        local: &Metadata,
        counts: &mut UnitCounts,
    ) -> Result<(), IngestError> {
        let remote = self.store.project_metadata(run.project).await?;
        let mut update = Metadata::new();
        for (key, value) in local {
            let existing = remote.get(key);
            if existing == Some(value) {
                counts.skipped += 1;
                continue;
            }
            let unit = UnitId::ProjectMetadata { key: key.clone() };
            let proceed = run
                .forestall
                .decide(&unit, existing.is_some(), || async { Ok(()) })
                .await?;
            if proceed {
                update.insert(key.clone(), value.clone());
            }
            counts.record(proceed);
        }
        if !update.is_empty() {
            self.store
                .update_project_metadata(run.project, &update)
                .await?;
        }
        Ok(())
    }

    async fn load_reference(&self, document: &Value) -> Result<bool, IngestError> {
        let Some(key) = document.get("uniprot").and_then(Value::as_str) else {
            warn!("reference document without a uniprot key, skipping");
            return Ok(false);
        };
        if self.store.has_reference(key).await? {
            debug!(reference = key, "reference already present");
            return Ok(false);
        }
        self.store.load_reference(key, document).await?;
        Ok(true)
    }

    async fn load_topology(&self, run: &Run<'_, S>, topology: &Value) -> Result<bool, IngestError> {
        let exists = self.store.topology(run.project).await?.is_some();
        if exists && run.forestall.policy() != ConflictPolicy::Overwrite {
            debug!("topology already present");
            return Ok(false);
        }
        self.store.put_topology(run.project, topology).await?;
        Ok(true)
    }

    async fn load_md(
        &self,
        run: &Run<'_, S>,
        md: &ClassifiedMd,
        index: usize,
        metadata: Option<&Metadata>,
        report: &mut LoadReport,
    ) -> Result<MdReport, IngestError> {
        let scope = Scope::Md(index);
        let mut md_report = MdReport {
            name: md.name.clone(),
            index,
            trajectory: None,
        };

        if let Some(metadata) = metadata {
            run.monitor.check().await?;
            let exists = self.store.md_metadata(run.project, index).await?.is_some();
            let unit = UnitId::MdMetadata {
                md: md.name.clone(),
            };
            let proceed = run
                .forestall
                .decide(&unit, exists, || {
                    self.store.delete_md_metadata(run.project, index)
                })
                .await?;
            if proceed {
                self.store
                    .put_md_metadata(run.project, index, metadata)
                    .await?;
            }
            report.md_metadata.record(proceed);
        }

        for path in &md.trajectories {
            run.checkpoint(format!("phase=Trajectories; md={}; {path}", md.name))
                .await?;
            let info = self
                .load_trajectory(run, scope, path, &mut report.bytes_uploaded)
                .await?;
            report.trajectories.record(info.is_some());
            if info.is_some() {
                md_report.trajectory = info;
            }
        }

        for path in &md.files {
            run.checkpoint(format!("phase=Files; md={}; {path}", md.name))
                .await?;
            let loaded = self
                .load_file(run, scope, path, &mut report.bytes_uploaded)
                .await?;
            report.files.record(loaded);
        }

        for analysis in &md.analyses {
            run.checkpoint(format!("phase=Analyses; md={}; {}", md.name, analysis.name))
                .await?;
            let unit = UnitId::Analysis {
                name: analysis.name.clone(),
                scope,
            };
            let exists = self
                .store
                .find_analysis(run.project, scope, &analysis.name)
                .await?
                .is_some();
            let proceed = run
                .forestall
                .decide(&unit, exists, || {
                    self.store
                        .delete_analysis(run.project, scope, &analysis.name)
                })
                .await?;
            if proceed {
                let value: Value = fs_util::read_json_document(&analysis.path, "analysis").await?;
                let record = AnalysisRecord {
                    name: analysis.name.clone(),
                    scope,
                    value,
                };
                self.store.put_analysis(run.project, &record).await?;
            }
            report.analyses.record(proceed);
        }

        Ok(md_report)
    }

    async fn load_file(
        &self,
        run: &Run<'_, S>,
        scope: Scope,
        path: &Utf8Path,
        bytes: &mut u64,
    ) -> Result<bool, IngestError> {
        let name = file_name(path)?;
        let unit = UnitId::File {
            name: name.clone(),
            scope,
        };
        let exists = self
            .store
            .find_file(run.project, scope, &name)
            .await?
            .is_some();
        let proceed = run
            .forestall
            .decide(&unit, exists, || {
                self.store.delete_file(run.project, scope, &name)
            })
            .await?;
        if !proceed {
            return Ok(false);
        }

        let mut source = tokio::fs::File::open(path.as_std_path())
            .await
            .map_err(|err| IngestError::Filesystem(format!("open {path}: {err}")))?;
        let mut blob = self
            .store
            .open_blob(run.project, scope, &name, BlobKind::File)
            .await?;
        let receipt = upload(
            &mut source,
            blob.as_mut(),
            self.config.upload.read_chunk_bytes,
        )
        .await?;
        self.store
            .register_file(
                run.project,
                &FileRecord {
                    name,
                    scope,
                    length: receipt.bytes,
                    location: receipt.location,
                },
            )
            .await?;
        *bytes += receipt.bytes;
        Ok(true)
    }

    async fn load_trajectory(
        &self,
        run: &Run<'_, S>,
        scope: Scope,
        path: &Utf8Path,
        bytes: &mut u64,
    ) -> Result<Option<TrajectoryInfo>, IngestError> {
        let Some(md) = scope.md_index() else {
            return Ok(None);
        };
        let name = file_name(path)?;
        let unit = UnitId::Trajectory {
            name: name.clone(),
            scope,
        };
        let exists = self
            .store
            .find_file(run.project, scope, &name)
            .await?
            .is_some();
        let proceed = run
            .forestall
            .decide(&unit, exists, || {
                self.store.delete_file(run.project, scope, &name)
            })
            .await?;
        if !proceed {
            return Ok(None);
        }

        let patterns = self.config.trajectory.patterns.clone();
        let (receipt, info) = if path.extension() == Some("dump") {
            let reader = trajectory::open_text(path, patterns).await?;
            self.encode(run, scope, &name, reader).await?
        } else {
            let reader =
                trajectory::open_dump(&self.config.trajectory.dump_command, path, patterns)?;
            self.encode(run, scope, &name, reader).await?
        };

        self.store
            .register_file(
                run.project,
                &FileRecord {
                    name,
                    scope,
                    length: receipt.bytes,
                    location: receipt.location,
                },
            )
            .await?;
        self.store.set_trajectory_info(run.project, md, info).await?;
        *bytes += receipt.bytes;
        info!(
            trajectory = %path,
            frames = info.frames,
            atoms = info.atoms,
            "trajectory loaded"
        );
        Ok(Some(info))
    }

    async fn encode<R: AsyncBufRead + Unpin + Send>(
        &self,
        run: &Run<'_, S>,
        scope: Scope,
        name: &str,
        mut reader: TrajectoryReader<R>,
    ) -> Result<(UploadReceipt, TrajectoryInfo), IngestError> {
        let mut blob = self
            .store
            .open_blob(run.project, scope, name, BlobKind::Trajectory)
            .await?;
        let receipt = upload(
            &mut reader,
            blob.as_mut(),
            self.config.upload.read_chunk_bytes,
        )
        .await
        .map_err(|err| reader.explain(err))?;
        Ok((receipt, reader.info()?))
    }
}

async fn read_documents(classified: &ClassifiedProject) -> Result<LocalDocuments, IngestError> {
    let metadata = match &classified.metadata {
        Some(path) => Some(fs_util::read_json_document::<Metadata>(path, "metadata").await?),
        None => None,
    };
    let topology = match &classified.topology {
        Some(path) => Some(fs_util::read_json_document::<Value>(path, "topology").await?),
        None => None,
    };
    let references = match &classified.references {
        Some(path) => fs_util::read_json_document::<Vec<Value>>(path, "references").await?,
        None => Vec::new(),
    };
    let mut md_metadata = Vec::with_capacity(classified.mds.len());
    for md in &classified.mds {
        let metadata = match &md.metadata {
            Some(path) => Some(fs_util::read_json_document::<Metadata>(path, "MD metadata").await?),
            None => None,
        };
        md_metadata.push(metadata);
    }
    Ok(LocalDocuments {
        metadata,
        topology,
        references,
        md_metadata,
    })
}

/// Looks up each local run by name; `None` marks a run that still has to be appended.
///
/// With `check_order`, runs that already exist remotely must appear in the same
/// relative order locally as their stored indices. New runs are always appended and
/// never take part in the comparison.
fn resolve_md_indices(
    mds: &[ClassifiedMd],
    remote: &[MdRunSummary],
    check_order: bool,
) -> Result<Vec<Option<usize>>, IngestError> {
    let mut previous: Option<usize> = None;
    let mut resolved = Vec::with_capacity(mds.len());
    for (position, md) in mds.iter().enumerate() {
        let index = remote
            .iter()
            .find(|run| run.name == md.name)
            .map(|run| run.index);
        if let Some(index) = index {
            if check_order && previous.is_some_and(|previous| index < previous) {
                return Err(IngestError::MdIndexMismatch {
                    name: md.name.clone(),
                    local: position,
                    remote: index,
                });
            }
            previous = Some(index);
        }
        resolved.push(index);
    }
    Ok(resolved)
}

fn file_name(path: &Utf8Path) -> Result<String, IngestError> {
    path.file_name()
        .map(str::to_string)
        .ok_or_else(|| IngestError::MissingFile(path.to_path_buf()))
}

fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
