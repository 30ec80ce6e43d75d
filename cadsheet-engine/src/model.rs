use std::fmt;
use std::path::PathBuf;

use cadsheet_core::document::{Document, EntityId};
use cadsheet_core::geometry::{Bounds2D, Point2};
use cadsheet_io::LoadStats;
use serde::{Deserialize, Serialize, Serializer};

/// 图框在所属图纸中的序号，按识别顺序从 0 开始。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FrameId(pub usize);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// 结果可用但需要人工关注。
    Flag,
    /// 该单元无法处理。
    Error,
}

/// 问题原因码，序列化为稳定的 snake_case 字符串。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    AnchorUnverified,
    /// 某个核心字段没有抽到文字，载荷为字段名。
    Missing(&'static str),
    MalformedInternalCode,
    MalformedExternalCode,
    MalformedPageInfo,
    RoiNotConfigured,
    RoiProfileMissing,
    ConfigurationError,
    PageCountMismatch,
    ScaleMismatch,
    MemberCountMismatch,
    DuplicatePageIndex,
    PageIndexGap,
    MasterPageIndex,
    NoFramesDetected,
    DrawingUnreadable,
    Cancelled,
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ReasonCode::Missing(field) => return write!(f, "missing_{field}"),
            ReasonCode::AnchorUnverified => "anchor_unverified",
            ReasonCode::MalformedInternalCode => "malformed_internal_code",
            ReasonCode::MalformedExternalCode => "malformed_external_code",
            ReasonCode::MalformedPageInfo => "malformed_page_info",
            ReasonCode::RoiNotConfigured => "roi_not_configured",
            ReasonCode::RoiProfileMissing => "roi_profile_missing",
            ReasonCode::ConfigurationError => "configuration_error",
            ReasonCode::PageCountMismatch => "page_count_mismatch",
            ReasonCode::ScaleMismatch => "scale_mismatch",
            ReasonCode::MemberCountMismatch => "member_count_mismatch",
            ReasonCode::DuplicatePageIndex => "duplicate_page_index",
            ReasonCode::PageIndexGap => "page_index_gap",
            ReasonCode::MasterPageIndex => "master_page_index",
            ReasonCode::NoFramesDetected => "no_frames_detected",
            ReasonCode::DrawingUnreadable => "drawing_unreadable",
            ReasonCode::Cancelled => "cancelled",
        };
        f.write_str(code)
    }
}

impl Serialize for ReasonCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameIssue {
    pub kind: IssueKind,
    pub reason: ReasonCode,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl FrameIssue {
    pub fn flag(reason: ReasonCode, detail: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Flag,
            reason,
            detail: detail.into(),
        }
    }

    pub fn error(reason: ReasonCode, detail: impl Into<String>) -> Self {
        Self {
            kind: IssueKind::Error,
            reason,
            detail: detail.into(),
        }
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.kind == IssueKind::Error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Polyline,
    Lines,
}

/// 图框识别阶段写入的运行时信息。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameRuntime {
    /// 图框右下角，所有 ROI 都以它为原点。
    pub anchor: Point2,
    pub sx: f64,
    pub sy: f64,
    /// 命中的绘图比例：`detection.allowed_scales` 中的一项，自由比例时为实测的 `sx`。
    pub scale: f64,
    /// 与标准图幅的最大相对偏差。
    pub deviation: f64,
    pub rotated: bool,
    pub anchor_verified: bool,
    pub source: CandidateSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    pub id: FrameId,
    pub variant: String,
    pub profile: String,
    pub bbox: Bounds2D,
    pub runtime: FrameRuntime,
    pub titleblock: Option<TitleblockFields>,
    pub issues: Vec<FrameIssue>,
}

impl Frame {
    #[inline]
    pub fn has_error(&self) -> bool {
        self.issues.iter().any(FrameIssue::is_error)
    }

    pub fn flag_count(&self) -> usize {
        self.issues.iter().filter(|issue| !issue.is_error()).count()
    }

    pub fn error_count(&self) -> usize {
        self.issues.iter().filter(|issue| issue.is_error()).count()
    }

    pub fn page_index(&self) -> Option<u32> {
        self.titleblock.as_ref().and_then(|tb| tb.page_index)
    }

    pub fn page_total(&self) -> Option<u32> {
        self.titleblock.as_ref().and_then(|tb| tb.page_total)
    }

    pub fn internal_code(&self) -> Option<&str> {
        self.titleblock
            .as_ref()
            .and_then(|tb| tb.internal_code.as_deref())
    }
}

/// 标题栏字段。抽取后不可变，重新抽取会生成新值。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TitleblockFields {
    pub internal_code: Option<String>,
    pub external_code: Option<String>,
    /// 内部编码中段的末两位。
    pub album_code: Option<String>,
    /// 内部编码末段的流水号。
    pub seq_no: Option<u32>,
    pub engineering_no: Option<String>,
    pub subitem_no: Option<String>,
    pub paper_size_text: Option<String>,
    pub discipline: Option<String>,
    pub scale_text: Option<String>,
    pub scale_denominator: Option<f64>,
    pub page_index: Option<u32>,
    pub page_total: Option<u32>,
    pub title_primary: Option<String>,
    pub title_secondary: Option<String>,
    pub revision: Option<String>,
    pub status: Option<String>,
    pub date: Option<String>,
}

impl TitleblockFields {
    /// 主图选择用的完整度评分。
    pub fn completeness(&self) -> u32 {
        [
            self.engineering_no.is_some(),
            self.internal_code.is_some(),
            self.external_code.is_some(),
            self.page_total.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SheetSetIssue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<FrameId>,
    #[serde(flatten)]
    pub issue: FrameIssue,
}

/// 一组相邻的小幅面图框，逻辑上是一份多页图纸。只保存成员 ID。
#[derive(Debug, Clone, Serialize)]
pub struct SheetSet {
    pub id: usize,
    pub master: FrameId,
    /// 主图在前，其余按页码、位置排序。
    pub members: Vec<FrameId>,
    pub page_total: Option<u32>,
    pub scale_denominator: Option<f64>,
    pub issues: Vec<SheetSetIssue>,
}

impl SheetSet {
    pub fn contains(&self, frame: FrameId) -> bool {
        self.members.contains(&frame)
    }

    pub fn slaves(&self) -> impl Iterator<Item = FrameId> + '_ {
        self.members
            .iter()
            .copied()
            .filter(move |member| *member != self.master)
    }
}

/// 按图框裁剪出的子图，坐标保持原图坐标系。
#[derive(Debug, Clone, Serialize)]
pub struct SubDrawing {
    pub frame: FrameId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sheet_set: Option<usize>,
    pub name: String,
    pub clip: Bounds2D,
    pub source_ids: Vec<EntityId>,
    #[serde(skip)]
    pub document: Document,
}

/// 单张图纸的处理结果。
#[derive(Debug, Clone, Serialize)]
pub struct DrawingResult {
    pub name: String,
    pub source: PathBuf,
    pub load: LoadStats,
    pub frames: Vec<Frame>,
    pub sheet_sets: Vec<SheetSet>,
    pub splits: Vec<SubDrawing>,
    /// 图纸级问题（未识别到图框、配置错误等）。
    pub issues: Vec<FrameIssue>,
}

impl DrawingResult {
    pub fn frame(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(id.0).filter(|frame| frame.id == id)
    }

    pub fn sheet_set_of(&self, id: FrameId) -> Option<&SheetSet> {
        self.sheet_sets.iter().find(|set| set.contains(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    SucceededWithFlags,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Succeeded => "succeeded",
            JobStatus::SucceededWithFlags => "succeeded_with_flags",
            JobStatus::Failed => "failed",
        }
    }
}

/// 作业台账中的一条记录。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub drawing: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<FrameId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sheet_set: Option<usize>,
    #[serde(flatten)]
    pub issue: FrameIssue,
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub drawings: Vec<DrawingResult>,
    pub ledger: Vec<LedgerEntry>,
    pub units: Vec<DerivedFields>,
    pub album: AlbumFields,
}

impl Job {
    /// 未带错误的图框数；为 0 时作业判定失败。
    pub fn processed_frames(&self) -> usize {
        self.drawings
            .iter()
            .flat_map(|drawing| drawing.frames.iter())
            .filter(|frame| !frame.has_error())
            .count()
    }
}

/// 文档生成所需的人工参数，随作业提交。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentParams {
    pub project_no: Option<String>,
    pub album_title_cn: Option<String>,
    pub album_title_en: Option<String>,
    pub doc_status: Option<String>,
    pub discipline: Option<String>,
    pub upgrade_revision: Option<String>,
    pub cover_revision: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitRef {
    Standalone { frame: FrameId },
    SheetSet { sheet_set: usize },
}

/// 每个逻辑单元（独立图框或多页组）的派生字段。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivedFields {
    pub drawing: String,
    pub unit: UnitRef,
    pub frames: Vec<FrameId>,
    /// 目录中的序号，从 1 开始。
    pub catalog_position: usize,
    pub internal_code: Option<String>,
    pub external_code: Option<String>,
    pub seq_no: Option<u32>,
    pub sheet_count: usize,
    pub page_total: Option<u32>,
    pub title_primary: Option<String>,
    pub title_secondary: Option<String>,
    pub revision: Option<String>,
    pub status: Option<String>,
    pub date: Option<String>,
    pub flag_count: usize,
    pub error_count: usize,
    /// 多页组没有一致性问题；独立图框恒为 true。
    pub consistent: bool,
}

/// 整个图册级别的派生字段（封面、目录）。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlbumFields {
    pub internal_code_001: Option<String>,
    pub external_code_001: Option<String>,
    pub album_internal_code: Option<String>,
    pub album_code: Option<String>,
    pub cover_internal_code: Option<String>,
    pub catalog_internal_code: Option<String>,
    pub cover_external_code: Option<String>,
    pub catalog_external_code: Option<String>,
    pub cover_title_cn: Option<String>,
    pub catalog_title_cn: Option<String>,
    pub cover_title_en: Option<String>,
    pub catalog_title_en: Option<String>,
    pub design_phase: Option<String>,
    pub design_phase_en: Option<String>,
    pub discipline_en: Option<String>,
    pub catalog_revision: String,
    pub cover_paper_size_text: String,
    pub catalog_paper_size_text: String,
    pub cover_page_total: u32,
    pub bilingual: bool,
    pub unit_count: usize,
    pub total_sheets: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_render_as_snake_case() {
        assert_eq!(ReasonCode::MalformedExternalCode.to_string(), "malformed_external_code");
        assert_eq!(ReasonCode::Missing("revision").to_string(), "missing_revision");
        let issue = FrameIssue::flag(ReasonCode::AnchorUnverified, "");
        let json = serde_json::to_value(&issue).expect("serialize issue");
        assert_eq!(
            json,
            serde_json::json!({ "kind": "flag", "reason": "anchor_unverified" })
        );
    }

    #[test]
    fn completeness_counts_present_fields() {
        let fields = TitleblockFields {
            internal_code: Some("1234567-JG001-001".to_string()),
            page_total: Some(3),
            ..TitleblockFields::default()
        };
        assert_eq!(fields.completeness(), 2);
    }
}
