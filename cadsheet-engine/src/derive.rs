//! 派生字段：逻辑单元清单与图册封面、目录字段。纯计算，不做任何 I/O。

use cadsheet_config::DerivationConfig;

use crate::model::{
    AlbumFields, DerivedFields, DocumentParams, DrawingResult, Frame, FrameId, UnitRef,
};

const ALBUM_SUFFIX: &str = "-001";

pub struct DerivationEngine<'c> {
    config: &'c DerivationConfig,
}

impl<'c> DerivationEngine<'c> {
    pub fn new(config: &'c DerivationConfig) -> Self {
        Self { config }
    }

    /// 每个独立图框、每个多页组各生成一条，按流水号排定目录顺序。
    pub fn derive_units(&self, drawings: &[DrawingResult]) -> Vec<DerivedFields> {
        // (流水号, 图纸序号, 首个图框, 字段)
        let mut units: Vec<(Option<u32>, usize, FrameId, DerivedFields)> = Vec::new();
        for (drawing_index, drawing) in drawings.iter().enumerate() {
            for set in &drawing.sheet_sets {
                let Some(master) = drawing.frame(set.master) else {
                    continue;
                };
                let members: Vec<&Frame> = set
                    .members
                    .iter()
                    .filter_map(|id| drawing.frame(*id))
                    .collect();
                let mut unit = unit_from_master(
                    &drawing.name,
                    UnitRef::SheetSet { sheet_set: set.id },
                    master,
                    &members,
                );
                unit.page_total = set.page_total.or(unit.page_total);
                unit.consistent = set.issues.is_empty();
                units.push((unit.seq_no, drawing_index, set.master, unit));
            }
            for frame in &drawing.frames {
                if drawing.sheet_set_of(frame.id).is_some() {
                    continue;
                }
                let unit = unit_from_master(
                    &drawing.name,
                    UnitRef::Standalone { frame: frame.id },
                    frame,
                    &[frame],
                );
                units.push((unit.seq_no, drawing_index, frame.id, unit));
            }
        }

        units.sort_by(|a, b| {
            let seq = |value: Option<u32>| value.map_or((1, 0), |seq| (0, seq));
            seq(a.0)
                .cmp(&seq(b.0))
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });
        units
            .into_iter()
            .enumerate()
            .map(|(position, (_, _, _, mut unit))| {
                unit.catalog_position = position + 1;
                unit
            })
            .collect()
    }

    /// 以内部编码为 `-001` 结尾的单元为来源，生成封面、目录字段。
    pub fn derive_album(&self, units: &[DerivedFields], params: &DocumentParams) -> AlbumFields {
        let config = self.config;
        let source = units.iter().find(|unit| {
            unit.internal_code
                .as_deref()
                .is_some_and(|code| code.ends_with(ALBUM_SUFFIX))
        });
        let internal_001 = source.and_then(|unit| unit.internal_code.clone());
        let external_001 = source.and_then(|unit| unit.external_code.clone());

        let bilingual = params
            .project_no
            .as_deref()
            .is_some_and(|project| config.bilingual_projects.iter().any(|p| p == project));

        let title_cn = non_empty(params.album_title_cn.as_deref())
            .or_else(|| source.and_then(|unit| unit.title_primary.clone()));
        let title_en = non_empty(params.album_title_en.as_deref())
            .or_else(|| source.and_then(|unit| unit.title_secondary.clone()));

        let design_phase = non_empty(params.doc_status.as_deref()).map(|status| {
            config
                .status_to_design_phase
                .get(&status)
                .cloned()
                .unwrap_or_else(|| config.default_design_phase.clone())
        });
        let design_phase_en = design_phase
            .as_ref()
            .filter(|_| bilingual)
            .and_then(|phase| config.design_phase_to_en.get(phase).cloned());
        let discipline_en = non_empty(params.discipline.as_deref())
            .filter(|_| bilingual)
            .and_then(|discipline| config.discipline_to_en.get(&discipline).cloned());

        let catalog_revision = non_empty(params.upgrade_revision.as_deref())
            .or_else(|| non_empty(params.cover_revision.as_deref()))
            .unwrap_or_else(|| config.default_revision.clone());

        AlbumFields {
            album_internal_code: internal_001
                .as_deref()
                .and_then(|code| code.strip_suffix(ALBUM_SUFFIX))
                .map(str::to_string),
            album_code: internal_001.as_deref().and_then(album_code),
            cover_internal_code: internal_001
                .as_deref()
                .map(|code| replace_suffix(code, ALBUM_SUFFIX, "-FM")),
            catalog_internal_code: internal_001
                .as_deref()
                .map(|code| replace_suffix(code, ALBUM_SUFFIX, "-TM")),
            cover_external_code: external_001
                .as_deref()
                .map(|code| replace_positions(code, 8, 11, "F01")),
            catalog_external_code: external_001
                .as_deref()
                .map(|code| replace_positions(code, 8, 11, "T01")),
            cover_title_cn: title_cn
                .as_ref()
                .map(|title| format!("{title}{}", config.cover_suffix_cn)),
            catalog_title_cn: title_cn
                .as_ref()
                .map(|title| format!("{title}{}", config.catalog_suffix_cn)),
            cover_title_en: title_en
                .as_ref()
                .filter(|_| bilingual)
                .map(|title| format!("{title}{}", config.cover_suffix_en)),
            catalog_title_en: title_en
                .as_ref()
                .filter(|_| bilingual)
                .map(|title| format!("{title}{}", config.catalog_suffix_en)),
            internal_code_001: internal_001,
            external_code_001: external_001,
            design_phase,
            design_phase_en,
            discipline_en,
            catalog_revision,
            cover_paper_size_text: config.cover_paper_size_text.clone(),
            catalog_paper_size_text: config.cover_paper_size_text.clone(),
            cover_page_total: 1,
            bilingual,
            unit_count: units.len(),
            total_sheets: units.iter().map(|unit| unit.sheet_count).sum(),
        }
    }
}

fn unit_from_master(drawing: &str, unit: UnitRef, master: &Frame, members: &[&Frame]) -> DerivedFields {
    let fields = master.titleblock.clone().unwrap_or_default();
    DerivedFields {
        drawing: drawing.to_string(),
        unit,
        frames: members.iter().map(|frame| frame.id).collect(),
        catalog_position: 0,
        internal_code: fields.internal_code,
        external_code: fields.external_code,
        seq_no: fields.seq_no,
        sheet_count: members.len(),
        page_total: fields.page_total,
        title_primary: fields.title_primary,
        title_secondary: fields.title_secondary,
        revision: fields.revision,
        status: fields.status,
        date: fields.date,
        flag_count: members.iter().map(|frame| frame.flag_count()).sum(),
        error_count: members.iter().map(|frame| frame.error_count()).sum(),
        consistent: true,
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// 内部编码中段的末两位。
fn album_code(code: &str) -> Option<String> {
    let middle: Vec<char> = code.split('-').nth(1)?.chars().collect();
    (middle.len() >= 2).then(|| middle[middle.len() - 2..].iter().collect())
}

/// 把结尾的 `suffix` 换成 `replacement`；没有该后缀时直接追加。
fn replace_suffix(code: &str, suffix: &str, replacement: &str) -> String {
    match code.strip_suffix(suffix) {
        Some(stem) => format!("{stem}{replacement}"),
        None => format!("{code}{replacement}"),
    }
}

/// 替换第 `start..end` 个字符；长度不足时原样返回。
fn replace_positions(code: &str, start: usize, end: usize, replacement: &str) -> String {
    let chars: Vec<char> = code.chars().collect();
    if chars.len() < end {
        return code.to_string();
    }
    let mut out: String = chars[..start].iter().collect();
    out.push_str(replacement);
    out.extend(&chars[end..]);
    out
}
