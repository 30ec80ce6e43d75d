//! 作业执行：图纸级并行、单图纸内按阶段顺序处理，图框级工作再并行。

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cadsheet_config::SpecConfig;
use cadsheet_core::document::Document;
use cadsheet_core::index::{GeometryIndex, IndexOptions};
use cadsheet_io::{DocumentLoader, LoadStats};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info, warn};

use crate::derive::DerivationEngine;
use crate::detect::FrameDetector;
use crate::errors::EngineError;
use crate::model::{
    DocumentParams, DrawingResult, Frame, FrameIssue, Job, JobStatus, LedgerEntry, ReasonCode,
    SheetSet, SubDrawing,
};
use crate::multipage::MultipageGrouper;
use crate::split::{sub_drawing_name, Splitter};
use crate::titleblock::{Extraction, TitleblockExtractor};

/// 协作式取消标记，可在线程间共享。取消后不再启动新的图纸。
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 作业中的一张图纸。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawingInput {
    pub name: String,
    pub path: PathBuf,
}

impl DrawingInput {
    /// 以文件名（不含扩展名）作为图纸名。
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self { name, path }
    }
}

enum DrawingOutcome {
    Processed(DrawingResult),
    Unreadable(String),
    Cancelled,
}

pub struct JobRunner {
    spec: SpecConfig,
    pool: ThreadPool,
    cancel: CancellationToken,
    split: bool,
}

impl JobRunner {
    /// 校验配置并创建容量为 `concurrency` 的工作线程池。
    pub fn new(spec: SpecConfig, concurrency: usize) -> Result<Self, EngineError> {
        spec.validate()?;
        for (variant, profile) in spec.dangling_profiles() {
            warn!(variant = %variant, profile = %profile, "图幅引用的 ROI 方案未定义，该图幅的图框将无法抽取标题栏");
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(concurrency.max(1))
            .thread_name(|index| format!("cadsheet-worker-{index}"))
            .build()?;
        Ok(Self {
            spec,
            pool,
            cancel: CancellationToken::new(),
            split: true,
        })
    }

    /// 关闭后不生成子图，只输出识别与抽取结果。
    pub fn with_split(mut self, enabled: bool) -> Self {
        self.split = enabled;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spec(&self) -> &SpecConfig {
        &self.spec
    }

    /// 执行一个作业。单张图纸失败只记入台账，不影响其他图纸。
    pub fn run<L>(
        &self,
        job_id: impl Into<String>,
        inputs: &[DrawingInput],
        loader: &L,
        params: &DocumentParams,
    ) -> Job
    where
        L: DocumentLoader + Sync,
    {
        let job_id = job_id.into();
        info!(job = %job_id, drawings = inputs.len(), "作业开始");
        let outcomes: Vec<DrawingOutcome> = self.pool.install(|| {
            inputs
                .par_iter()
                .map(|input| self.run_drawing(input, loader))
                .collect()
        });

        let mut drawings = Vec::new();
        let mut ledger = Vec::new();
        let mut reported = BTreeSet::new();
        for (input, outcome) in inputs.iter().zip(outcomes) {
            match outcome {
                DrawingOutcome::Processed(result) => {
                    append_ledger(&mut ledger, &result, &mut reported);
                    drawings.push(result);
                }
                DrawingOutcome::Unreadable(detail) => ledger.push(LedgerEntry {
                    drawing: input.name.clone(),
                    frame: None,
                    sheet_set: None,
                    issue: FrameIssue::error(ReasonCode::DrawingUnreadable, detail),
                }),
                DrawingOutcome::Cancelled => ledger.push(LedgerEntry {
                    drawing: input.name.clone(),
                    frame: None,
                    sheet_set: None,
                    issue: FrameIssue::flag(ReasonCode::Cancelled, ""),
                }),
            }
        }

        let derivation = DerivationEngine::new(&self.spec.derivation);
        let units = derivation.derive_units(&drawings);
        let album = derivation.derive_album(&units, params);

        let mut job = Job {
            id: job_id,
            status: JobStatus::Failed,
            drawings,
            ledger,
            units,
            album,
        };
        let processed = job.processed_frames();
        job.status = if processed == 0 {
            JobStatus::Failed
        } else if job.ledger.is_empty() {
            JobStatus::Succeeded
        } else {
            JobStatus::SucceededWithFlags
        };
        info!(
            job = %job.id,
            status = ?job.status,
            processed_frames = processed,
            ledger = job.ledger.len(),
            units = job.units.len(),
            "作业结束"
        );
        job
    }

    fn run_drawing<L>(&self, input: &DrawingInput, loader: &L) -> DrawingOutcome
    where
        L: DocumentLoader + Sync,
    {
        if self.cancel.is_cancelled() {
            debug!(drawing = %input.name, "作业已取消，跳过图纸");
            return DrawingOutcome::Cancelled;
        }
        match loader.load_with_stats(&input.path) {
            Ok((document, stats)) => {
                DrawingOutcome::Processed(self.process_document(&input.name, &input.path, &document, stats))
            }
            Err(source) => {
                let err = EngineError::Load {
                    name: input.name.clone(),
                    source,
                };
                warn!(drawing = %input.name, error = %err, "图纸读取失败");
                DrawingOutcome::Unreadable(err.to_string())
            }
        }
    }

    /// 对已读入的文档依次执行识别、抽取、分组与拆分。
    pub fn process_document(
        &self,
        name: &str,
        source: &Path,
        document: &Document,
        load: LoadStats,
    ) -> DrawingResult {
        let spec = &self.spec;
        let index = GeometryIndex::with_options(
            document,
            IndexOptions {
                max_cells_per_axis: spec.detection.grid_max_cells_per_axis,
                ..IndexOptions::default()
            },
        );
        let mut frames = FrameDetector::new(spec).detect(&index);
        let mut issues = Vec::new();
        if frames.is_empty() {
            issues.push(FrameIssue::flag(ReasonCode::NoFramesDetected, ""));
        }

        let mut unconfigured = BTreeSet::new();
        for frame in &mut frames {
            if !spec.roi_profiles.contains_key(&frame.profile) {
                frame.issues.push(FrameIssue::error(
                    ReasonCode::RoiProfileMissing,
                    frame.profile.clone(),
                ));
                unconfigured.insert((frame.variant.clone(), frame.profile.clone()));
            }
        }
        for (variant, profile) in unconfigured {
            warn!(drawing = %name, variant = %variant, profile = %profile, "ROI 方案缺失");
            issues.push(FrameIssue::error(
                ReasonCode::ConfigurationError,
                format!("图幅 {variant} 引用的 ROI 方案 {profile} 未定义"),
            ));
        }

        // 每个图框的结果写入独立槽位，之后统一合并
        let extractor = TitleblockExtractor::new(&spec.titleblock);
        let extractions: Vec<Option<Extraction>> = self.pool.install(|| {
            frames
                .par_iter()
                .map(|frame| {
                    spec.roi_profiles
                        .get(&frame.profile)
                        .map(|profile| extractor.extract(&index, frame, profile))
                })
                .collect()
        });
        for (frame, extraction) in frames.iter_mut().zip(extractions) {
            if let Some(extraction) = extraction {
                frame.titleblock = Some(extraction.fields);
                frame.issues.extend(extraction.issues);
            }
        }

        let sheet_sets = MultipageGrouper::new(&spec.multipage).group(&mut frames);
        let splits = if self.split {
            self.split_frames(name, &index, &frames, &sheet_sets)
        } else {
            Vec::new()
        };

        info!(
            drawing = %name,
            entities = document.len(),
            frames = frames.len(),
            sheet_sets = sheet_sets.len(),
            splits = splits.len(),
            "图纸处理完成"
        );
        DrawingResult {
            name: name.to_string(),
            source: source.to_path_buf(),
            load,
            frames,
            sheet_sets,
            splits,
            issues,
        }
    }

    fn split_frames(
        &self,
        drawing: &str,
        index: &GeometryIndex<'_>,
        frames: &[Frame],
        sheet_sets: &[SheetSet],
    ) -> Vec<SubDrawing> {
        let splitter = Splitter::new(self.spec.split.margin);
        let mut used: HashMap<String, usize> = HashMap::new();
        let jobs: Vec<(&Frame, Option<usize>, String)> = frames
            .iter()
            .map(|frame| {
                let base = sub_drawing_name(drawing, frame);
                let seen = used.entry(base.clone()).or_default();
                *seen += 1;
                let name = if *seen == 1 {
                    base
                } else {
                    format!("{base}_{}", frame.id)
                };
                let sheet_set = sheet_sets
                    .iter()
                    .find(|set| set.contains(frame.id))
                    .map(|set| set.id);
                (frame, sheet_set, name)
            })
            .collect();
        self.pool.install(|| {
            jobs.into_par_iter()
                .map(|(frame, sheet_set, name)| splitter.split(index, frame, sheet_set, name))
                .collect()
        })
    }
}

/// 把一张图纸的问题并入作业台账。同一配置错误在整个作业中只记一次。
fn append_ledger(
    ledger: &mut Vec<LedgerEntry>,
    drawing: &DrawingResult,
    reported: &mut BTreeSet<String>,
) {
    for issue in &drawing.issues {
        if issue.reason == ReasonCode::ConfigurationError && !reported.insert(issue.detail.clone()) {
            continue;
        }
        ledger.push(LedgerEntry {
            drawing: drawing.name.clone(),
            frame: None,
            sheet_set: None,
            issue: issue.clone(),
        });
    }
    for frame in &drawing.frames {
        let sheet_set = drawing.sheet_set_of(frame.id).map(|set| set.id);
        for issue in &frame.issues {
            ledger.push(LedgerEntry {
                drawing: drawing.name.clone(),
                frame: Some(frame.id),
                sheet_set,
                issue: issue.clone(),
            });
        }
    }
    // 图框级不一致已随成员图框记录，这里只补充组级问题
    for set in &drawing.sheet_sets {
        for issue in set.issues.iter().filter(|issue| issue.frame.is_none()) {
            ledger.push(LedgerEntry {
                drawing: drawing.name.clone(),
                frame: None,
                sheet_set: Some(set.id),
                issue: issue.issue.clone(),
            });
        }
    }
}
