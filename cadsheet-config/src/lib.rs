use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 标题栏抽取用到的字段名，对应 `roi_profiles.*.fields` 的键。
pub mod fields {
    pub const ANCHOR: &str = "anchor";
    pub const INTERNAL_CODE: &str = "internal_code";
    pub const EXTERNAL_CODE: &str = "external_code";
    pub const ENGINEERING_NO: &str = "engineering_no";
    pub const SUBITEM_NO: &str = "subitem_no";
    pub const PAPER_SIZE: &str = "paper_size";
    pub const DISCIPLINE: &str = "discipline";
    pub const SCALE: &str = "scale";
    pub const PAGE_INFO: &str = "page_info";
    pub const TITLE: &str = "title";
    pub const REVISION: &str = "revision";
    pub const STATUS: &str = "status";
    pub const DATE: &str = "date";

    pub const ALL: [&str; 13] = [
        ANCHOR,
        INTERNAL_CODE,
        EXTERNAL_CODE,
        ENGINEERING_NO,
        SUBITEM_NO,
        PAPER_SIZE,
        DISCIPLINE,
        SCALE,
        PAGE_INFO,
        TITLE,
        REVISION,
        STATUS,
        DATE,
    ];
}

/// 应用配置的根结构。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub spec: SpecConfig,
}

impl AppConfig {
    /// 从显式路径加载配置，并立即做结构校验。
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 自动发现配置文件：优先读取环境变量 `CADSHEET_CONFIG`，否则寻找 `./config/default.toml`。
    /// 若文件缺失，则返回默认配置。
    pub fn discover() -> Result<Self, ConfigError> {
        if let Some(path) = env::var_os("CADSHEET_CONFIG") {
            return Self::from_file(PathBuf::from(path));
        }

        let default_path = env::current_dir()
            .map(|dir| dir.join("config").join("default.toml"))
            .map_err(|source| ConfigError::Context {
                message: "获取当前工作目录失败".to_string(),
                source,
            })?;

        if default_path.exists() {
            Self::from_file(default_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.concurrency == 0 {
            return Err(ConfigError::invalid("pipeline.concurrency 必须大于 0"));
        }
        self.spec.validate()
    }
}

/// 日志配置，支持设置默认等级。
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

/// 并发参数。
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// 工作线程上限，同时约束图纸级与图框级并行。
    #[serde(default = "PipelineConfig::default_concurrency")]
    pub concurrency: usize,
}

impl PipelineConfig {
    fn default_concurrency() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: Self::default_concurrency(),
        }
    }
}

/// 识别规范：图幅、ROI、各阶段阈值。加载后只读，显式传入各组件。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpecConfig {
    #[serde(default)]
    pub paper_variants: Vec<PaperVariant>,
    #[serde(default)]
    pub roi_profiles: BTreeMap<String, RoiProfile>,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub anchor: AnchorConfig,
    #[serde(default)]
    pub titleblock: TitleblockConfig,
    #[serde(default)]
    pub multipage: MultipageConfig,
    #[serde(default)]
    pub split: SplitConfig,
    #[serde(default)]
    pub derivation: DerivationConfig,
}

impl SpecConfig {
    /// 结构性错误直接拒绝；缺失的 ROI 方案不在这里报错，运行时按图幅分类处理。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = std::collections::BTreeSet::new();
        for variant in &self.paper_variants {
            if variant.name.trim().is_empty() {
                return Err(ConfigError::invalid("paper_variants 中存在空名称"));
            }
            if !names.insert(variant.name.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "图幅 {} 重复定义",
                    variant.name
                )));
            }
            if !(variant.width > 0.0 && variant.height > 0.0) {
                return Err(ConfigError::invalid(format!(
                    "图幅 {} 的宽高必须为正数",
                    variant.name
                )));
            }
            if !(variant.tolerance > 0.0 && variant.tolerance < 1.0) {
                return Err(ConfigError::invalid(format!(
                    "图幅 {} 的容差必须在 (0, 1) 内",
                    variant.name
                )));
            }
        }

        for (name, profile) in &self.roi_profiles {
            if profile.margin_percent < 0.0 {
                return Err(ConfigError::invalid(format!(
                    "ROI 方案 {name} 的 margin_percent 不能为负"
                )));
            }
            for (field, offset) in &profile.fields {
                if !fields::ALL.contains(&field.as_str()) {
                    return Err(ConfigError::invalid(format!(
                        "ROI 方案 {name} 含未知字段 {field}"
                    )));
                }
                if offset.dx_left < offset.dx_right || offset.dy_top < offset.dy_bottom {
                    return Err(ConfigError::invalid(format!(
                        "ROI 方案 {name} 的字段 {field} 偏移量区间颠倒"
                    )));
                }
            }
        }

        let detection = &self.detection;
        if detection.min_frame_dimension <= 0.0 || detection.coord_tolerance < 0.0 {
            return Err(ConfigError::invalid(
                "detection.min_frame_dimension 必须为正且 coord_tolerance 不能为负",
            ));
        }
        if !(0.0..45.0).contains(&detection.orthogonality_tolerance_deg) {
            return Err(ConfigError::invalid(
                "detection.orthogonality_tolerance_deg 必须在 [0, 45) 内",
            ));
        }
        if detection.allowed_scales.is_empty() || detection.allowed_scales.iter().any(|s| *s <= 0.0)
        {
            return Err(ConfigError::invalid(
                "detection.allowed_scales 不能为空且必须为正数",
            ));
        }

        if self.titleblock.title_line_tolerance < 0.0 {
            return Err(ConfigError::invalid("titleblock.title_line_tolerance 不能为负"));
        }
        if self.anchor.margin_percent < 0.0 {
            return Err(ConfigError::invalid("anchor.margin_percent 不能为负"));
        }

        match self.multipage.threshold {
            DistanceThreshold::Relative { factor } if factor <= 0.0 => {
                return Err(ConfigError::invalid("multipage.threshold.factor 必须为正"));
            }
            DistanceThreshold::Absolute { distance } if distance <= 0.0 => {
                return Err(ConfigError::invalid("multipage.threshold.distance 必须为正"));
            }
            _ => {}
        }
        Ok(())
    }

    /// 引用了未定义 ROI 方案的图幅，返回 (图幅名, 方案名)。
    pub fn dangling_profiles(&self) -> Vec<(String, String)> {
        self.paper_variants
            .iter()
            .filter(|variant| !self.roi_profiles.contains_key(&variant.profile))
            .map(|variant| (variant.name.clone(), variant.profile.clone()))
            .collect()
    }

    /// 按图幅自身方案、再按 `anchor.profile_priority` 顺序查找包含 `field` 的方案。
    pub fn profile_with_field(&self, own: &str, field: &str) -> Option<(&str, &RoiProfile)> {
        std::iter::once(own)
            .chain(self.anchor.profile_priority.iter().map(String::as_str))
            .find_map(|name| {
                self.roi_profiles
                    .get_key_value(name)
                    .filter(|(_, profile)| profile.fields.contains_key(field))
                    .map(|(key, profile)| (key.as_str(), profile))
            })
    }
}

/// 标准图幅。宽高为名义尺寸（横向放置时的宽、高）。
#[derive(Debug, Clone, Deserialize)]
pub struct PaperVariant {
    pub name: String,
    pub width: f64,
    pub height: f64,
    #[serde(default = "PaperVariant::default_tolerance")]
    pub tolerance: f64,
    pub profile: String,
}

impl PaperVariant {
    fn default_tolerance() -> f64 {
        0.02
    }
}

/// 一组以图框右下角为原点的 ROI 定义。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoiProfile {
    #[serde(default)]
    pub description: String,
    /// ROI 解析后按自身宽高的百分比向外扩张。
    #[serde(default)]
    pub margin_percent: f64,
    #[serde(default)]
    pub fields: BTreeMap<String, RoiOffset>,
}

/// `[dx_right, dx_left, dy_bottom, dy_top]`，名义图纸单位。
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "Vec<f64>", into = "[f64; 4]")]
pub struct RoiOffset {
    pub dx_right: f64,
    pub dx_left: f64,
    pub dy_bottom: f64,
    pub dy_top: f64,
}

impl TryFrom<Vec<f64>> for RoiOffset {
    type Error = String;

    fn try_from(value: Vec<f64>) -> Result<Self, Self::Error> {
        match value.as_slice() {
            [dx_right, dx_left, dy_bottom, dy_top] => Ok(Self {
                dx_right: *dx_right,
                dx_left: *dx_left,
                dy_bottom: *dy_bottom,
                dy_top: *dy_top,
            }),
            other => Err(format!("ROI 偏移量需要 4 个数值，实际 {} 个", other.len())),
        }
    }
}

impl From<RoiOffset> for [f64; 4] {
    fn from(value: RoiOffset) -> Self {
        [value.dx_right, value.dx_left, value.dy_bottom, value.dy_top]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineRebuild {
    /// 没有闭合多段线候选时才用直线重建。
    #[default]
    Fallback,
    Always,
    Never,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub min_frame_dimension: f64,
    pub coord_tolerance: f64,
    pub orthogonality_tolerance_deg: f64,
    pub allow_rotation: bool,
    /// 优先尝试的标准比例。
    pub allowed_scales: Vec<f64>,
    /// 标准比例都不符合时，按实测尺寸求统一比例（`sx ≈ sy`）再拟合。
    pub free_scale: bool,
    pub line_rebuild: LineRebuild,
    pub max_candidates: Option<usize>,
    pub grid_max_cells_per_axis: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_frame_dimension: 100.0,
            coord_tolerance: 0.5,
            orthogonality_tolerance_deg: 1.0,
            allow_rotation: true,
            allowed_scales: vec![1.0],
            free_scale: true,
            line_rebuild: LineRebuild::default(),
            max_candidates: None,
            grid_max_cells_per_axis: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    pub search_texts: Vec<String>,
    pub roi_field: String,
    pub profile_priority: Vec<String>,
    pub margin_percent: f64,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            search_texts: vec!["CNPE".to_string(), "中国核电工程有限公司".to_string()],
            roi_field: fields::ANCHOR.to_string(),
            profile_priority: Vec::new(),
            margin_percent: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleSplit {
    /// 按纵向间隙分成上下两段。
    #[default]
    Bands,
    /// 含中日韩文字的行归主标题，其余归副标题。
    Script,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TitleblockConfig {
    /// 标题按 y 聚行的容差，名义单位，运行时乘以图框比例。
    pub title_line_tolerance: f64,
    pub title_split: TitleSplit,
}

impl Default for TitleblockConfig {
    fn default() -> Self {
        Self {
            title_line_tolerance: 2.0,
            title_split: TitleSplit::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjacencyMetric {
    /// x、y 两个方向的边距都小于阈值。
    #[default]
    EdgeGap,
    /// 中心点欧氏距离小于阈值。
    Center,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DistanceThreshold {
    /// 两个图框较短边的倍数。
    Relative { factor: f64 },
    Absolute { distance: f64 },
}

impl DistanceThreshold {
    pub fn resolve(&self, reference_length: f64) -> f64 {
        match *self {
            DistanceThreshold::Relative { factor } => factor * reference_length,
            DistanceThreshold::Absolute { distance } => distance,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MultipageConfig {
    /// 参与分组的图幅名关键字，图幅名包含其中任一即算小幅面。
    pub paper_variants: Vec<String>,
    pub metric: AdjacencyMetric,
    pub threshold: DistanceThreshold,
}

impl Default for MultipageConfig {
    fn default() -> Self {
        Self {
            paper_variants: vec!["A4".to_string()],
            metric: AdjacencyMetric::default(),
            threshold: DistanceThreshold::Relative { factor: 0.5 },
        }
    }
}

impl MultipageConfig {
    pub fn is_small_format(&self, variant: &str) -> bool {
        self.paper_variants
            .iter()
            .any(|needle| variant.contains(needle.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SplitMargin {
    /// 按图框宽、高的比例外扩，负数为内缩。
    Relative { factor: f64 },
    Absolute { distance: f64 },
}

impl SplitMargin {
    /// 返回 (dx, dy)。
    pub fn resolve(&self, width: f64, height: f64) -> (f64, f64) {
        match *self {
            SplitMargin::Relative { factor } => (factor * width, factor * height),
            SplitMargin::Absolute { distance } => (distance, distance),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub margin: SplitMargin,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            margin: SplitMargin::Relative { factor: 0.015 },
        }
    }
}

/// 派生字段用到的映射表与固定文案。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DerivationConfig {
    pub status_to_design_phase: BTreeMap<String, String>,
    pub default_design_phase: String,
    pub design_phase_to_en: BTreeMap<String, String>,
    pub discipline_to_en: BTreeMap<String, String>,
    /// 需要英文封面、目录的项目号。
    pub bilingual_projects: Vec<String>,
    pub cover_suffix_cn: String,
    pub catalog_suffix_cn: String,
    pub cover_suffix_en: String,
    pub catalog_suffix_en: String,
    pub cover_paper_size_text: String,
    pub default_revision: String,
}

impl Default for DerivationConfig {
    fn default() -> Self {
        Self {
            status_to_design_phase: BTreeMap::new(),
            default_design_phase: "施工图设计".to_string(),
            design_phase_to_en: BTreeMap::new(),
            discipline_to_en: BTreeMap::new(),
            bilingual_projects: vec!["1818".to_string()],
            cover_suffix_cn: "封面".to_string(),
            catalog_suffix_cn: "目录".to_string(),
            cover_suffix_en: " Cover".to_string(),
            catalog_suffix_en: " Contents".to_string(),
            cover_paper_size_text: "A4文件".to_string(),
            default_revision: "A".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件 {path:?} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("解析配置文件 {path:?} 失败: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{message}")]
    Context {
        message: String,
        #[source]
        source: std::io::Error,
    },
    #[error("配置无效: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}
