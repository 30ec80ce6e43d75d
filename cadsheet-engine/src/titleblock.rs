//! 标题栏字段抽取。
//!
//! 每个字段独立解析：一个字段失败只在图框上记一条问题，不影响其余字段，
//! 也不影响其他图框。

use cadsheet_config::{fields, RoiProfile, TitleSplit, TitleblockConfig};
use cadsheet_core::geometry::Bounds2D;
use cadsheet_core::index::GeometryIndex;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{Frame, FrameIssue, ReasonCode, TitleblockFields};
use crate::roi::resolve_roi;

static INTERNAL_CODE_FULL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Z0-9]{7})-([A-Z0-9]{5})-(\d{3})$").expect("Invalid internal code regex")
});
static INTERNAL_CODE_SHORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Z0-9]{7})-([A-Z0-9]{5})$").expect("Invalid internal code regex")
});
static DOC_NO_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)DOC\.?\s*NO\.?\s*[:：]?").expect("Invalid DOC.NO regex")
});
static PAGE_TOTAL_FIRST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"共\s*(\d+)\s*张.*?第\s*(\d+|[Xx])\s*张").expect("Invalid page info regex")
});
static PAGE_INDEX_FIRST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"第\s*(\d+|[Xx])\s*张.*?共\s*(\d+)\s*张").expect("Invalid page info regex")
});
static PAGE_ENGLISH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)page\s*(\d+|x)\s*of\s*(\d+)").expect("Invalid page info regex")
});
static ENGINEERING_NO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d{4}").expect("Invalid engineering number regex"));
static SCALE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"1\s*[:：]\s*(\d+(?:\.\d+)?)").expect("Invalid scale regex")
});

/// 抽取结果：字段值与本次抽取产生的问题。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub fields: TitleblockFields,
    pub issues: Vec<FrameIssue>,
}

/// ROI 内的一段文字，坐标用于排序与聚行。
#[derive(Debug, Clone)]
struct RoiText {
    x: f64,
    y: f64,
    content: String,
}

pub struct TitleblockExtractor<'c> {
    config: &'c TitleblockConfig,
}

impl<'c> TitleblockExtractor<'c> {
    pub fn new(config: &'c TitleblockConfig) -> Self {
        Self { config }
    }

    /// 按图框自身的锚点与比例解析 ROI 并抽取全部字段。
    pub fn extract(&self, index: &GeometryIndex<'_>, frame: &Frame, profile: &RoiProfile) -> Extraction {
        let mut extraction = Extraction::default();
        let texts = |field: &str| -> Option<Vec<RoiText>> {
            profile
                .fields
                .get(field)
                .map(|offset| {
                    let roi = resolve_roi(
                        frame.runtime.anchor,
                        frame.runtime.sx,
                        frame.runtime.sy,
                        offset,
                        profile.margin_percent,
                    );
                    collect_texts(index, &roi, &frame.bbox)
                })
        };

        let mut unconfigured = Vec::new();

        match texts(fields::INTERNAL_CODE) {
            None => unconfigured.push(fields::INTERNAL_CODE),
            Some(found) if found.is_empty() => extraction.missing(fields::INTERNAL_CODE),
            Some(found) => match parse_internal_code(&found) {
                Some(code) => {
                    extraction.fields.album_code = code.album_code;
                    extraction.fields.seq_no = code.seq_no;
                    extraction.fields.internal_code = Some(code.code);
                }
                None => extraction.issues.push(FrameIssue::flag(
                    ReasonCode::MalformedInternalCode,
                    joined(&found, " "),
                )),
            },
        }

        match texts(fields::EXTERNAL_CODE) {
            None => unconfigured.push(fields::EXTERNAL_CODE),
            Some(found) if found.is_empty() => extraction.missing(fields::EXTERNAL_CODE),
            Some(found) => {
                let cleaned = clean_external_code(&found);
                if cleaned.chars().count() == 19 {
                    extraction.fields.external_code = Some(cleaned);
                } else {
                    extraction.issues.push(FrameIssue::flag(
                        ReasonCode::MalformedExternalCode,
                        format!("{cleaned}（{} 位）", cleaned.chars().count()),
                    ));
                }
            }
        }

        match texts(fields::TITLE) {
            None => unconfigured.push(fields::TITLE),
            Some(found) => {
                let tolerance = self.config.title_line_tolerance * frame.runtime.sy;
                let (primary, secondary) = split_title(&found, tolerance, self.config.title_split);
                if primary.is_none() {
                    extraction.missing(fields::TITLE);
                }
                extraction.fields.title_primary = primary;
                extraction.fields.title_secondary = secondary;
            }
        }

        match texts(fields::PAGE_INFO) {
            None => unconfigured.push(fields::PAGE_INFO),
            Some(found) if found.is_empty() => extraction.missing(fields::PAGE_INFO),
            Some(found) => {
                let text = joined(&found, " ");
                match parse_page_info(&text) {
                    Some((index, total)) => {
                        extraction.fields.page_index = Some(index);
                        extraction.fields.page_total = Some(total);
                    }
                    None => extraction
                        .issues
                        .push(FrameIssue::flag(ReasonCode::MalformedPageInfo, text)),
                }
            }
        }

        let mut topmost = |field: &'static str, extraction: &mut Extraction| -> Option<String> {
            let Some(found) = texts(field) else {
                unconfigured.push(field);
                return None;
            };
            let value = first_content(found);
            if value.is_none() {
                extraction.missing(field);
            }
            value
        };
        let revision = topmost(fields::REVISION, &mut extraction);
        let status = topmost(fields::STATUS, &mut extraction);
        let date = topmost(fields::DATE, &mut extraction);
        extraction.fields.revision = revision;
        extraction.fields.status = status;
        extraction.fields.date = date;

        // 扩展字段缺失时不记问题
        if let Some(found) = texts(fields::ENGINEERING_NO) {
            extraction.fields.engineering_no = found
                .iter()
                .find_map(|text| ENGINEERING_NO.find(&text.content))
                .map(|m| m.as_str().to_string());
        }
        if let Some(found) = texts(fields::SUBITEM_NO) {
            extraction.fields.subitem_no = first_content(found);
        }
        if let Some(found) = texts(fields::PAPER_SIZE) {
            extraction.fields.paper_size_text = first_content(found);
        }
        if let Some(found) = texts(fields::DISCIPLINE) {
            extraction.fields.discipline = first_content(found);
        }
        if let Some(found) = texts(fields::SCALE) {
            if let Some((text, denominator)) = found.iter().find_map(|text| {
                SCALE
                    .captures(&text.content)
                    .and_then(|caps| caps[1].parse::<f64>().ok())
                    .filter(|value| *value > 0.0)
                    .map(|value| (text.content.clone(), value))
            }) {
                extraction.fields.scale_text = Some(text);
                extraction.fields.scale_denominator = Some(denominator);
            }
        }

        if !unconfigured.is_empty() {
            extraction.issues.push(FrameIssue::flag(
                ReasonCode::RoiNotConfigured,
                unconfigured.join(","),
            ));
        }
        extraction
    }
}

impl Extraction {
    fn missing(&mut self, field: &'static str) {
        self.issues
            .push(FrameIssue::flag(ReasonCode::Missing(field), ""));
    }
}

/// 取 ROI 内、且位于图框自身范围内的文字，按 y 降序、x 升序排列。
fn collect_texts(index: &GeometryIndex<'_>, roi: &Bounds2D, frame_box: &Bounds2D) -> Vec<RoiText> {
    let mut texts: Vec<RoiText> = index
        .texts_in(roi)
        .into_iter()
        .filter(|fragment| frame_box.contains_point(fragment.position))
        .filter_map(|fragment| {
            let content = fragment.content.trim();
            (!content.is_empty()).then(|| RoiText {
                x: fragment.position.x(),
                y: fragment.position.y(),
                content: content.to_string(),
            })
        })
        .collect();
    texts.sort_by(|a, b| b.y.total_cmp(&a.y).then(a.x.total_cmp(&b.x)));
    texts
}

fn first_content(texts: Vec<RoiText>) -> Option<String> {
    texts.into_iter().next().map(|text| text.content)
}

fn joined(texts: &[RoiText], separator: &str) -> String {
    texts
        .iter()
        .map(|text| text.content.as_str())
        .collect::<Vec<_>>()
        .join(separator)
}

struct InternalCode {
    code: String,
    album_code: Option<String>,
    seq_no: Option<u32>,
}

/// 逐条文字依次尝试三段式与两段式，第一条成功的为准。
fn parse_internal_code(texts: &[RoiText]) -> Option<InternalCode> {
    texts.iter().find_map(|text| {
        let normalized: String = text
            .content
            .chars()
            .filter(|c| !c.is_whitespace())
            .flat_map(char::to_uppercase)
            .collect();
        // 去掉“内部编码：”之类的前缀
        let candidate = normalized
            .rsplit(|c| c == ':' || c == '：')
            .next()
            .unwrap_or(normalized.as_str());
        let album_code = |middle: &str| {
            let chars: Vec<char> = middle.chars().collect();
            Some(chars[chars.len() - 2..].iter().collect::<String>())
        };
        if let Some(caps) = INTERNAL_CODE_FULL.captures(candidate) {
            return Some(InternalCode {
                code: candidate.to_string(),
                album_code: album_code(&caps[2]),
                seq_no: caps[3].parse().ok(),
            });
        }
        INTERNAL_CODE_SHORT.captures(candidate).map(|caps| InternalCode {
            code: candidate.to_string(),
            album_code: album_code(&caps[2]),
            seq_no: None,
        })
    })
}

fn clean_external_code(texts: &[RoiText]) -> String {
    let raw = joined(texts, "");
    DOC_NO_HEADER
        .replace_all(&raw, "")
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// 解析页码，返回 (第几张, 共几张)；`X` 视为第 1 张。
pub(crate) fn parse_page_info(text: &str) -> Option<(u32, u32)> {
    let index_value = |raw: &str| -> Option<u32> {
        if raw.eq_ignore_ascii_case("x") {
            Some(1)
        } else {
            raw.parse().ok()
        }
    };
    if let Some(caps) = PAGE_TOTAL_FIRST.captures(text) {
        return Some((index_value(&caps[2])?, caps[1].parse().ok()?));
    }
    if let Some(caps) = PAGE_INDEX_FIRST.captures(text) {
        return Some((index_value(&caps[1])?, caps[2].parse().ok()?));
    }
    let caps = PAGE_ENGLISH.captures(text)?;
    Some((index_value(&caps[1])?, caps[2].parse().ok()?))
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32, 0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF)
}

/// 拼接同一行或同一段的文字：两侧都是 ASCII 字母数字时补空格。
fn join_parts<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut out = String::new();
    for part in parts {
        let needs_space = matches!(
            (out.chars().last(), part.chars().next()),
            (Some(a), Some(b)) if a.is_ascii_alphanumeric() && b.is_ascii_alphanumeric()
        );
        if needs_space {
            out.push(' ');
        }
        out.push_str(part);
    }
    out
}

/// 标题：先按 y 聚行，再分为主、副两段。
fn split_title(texts: &[RoiText], tolerance: f64, mode: TitleSplit) -> (Option<String>, Option<String>) {
    // texts 已按 y 降序
    let mut lines: Vec<(f64, Vec<&RoiText>)> = Vec::new();
    for text in texts {
        match lines.last_mut() {
            Some((y, members)) if *y - text.y <= tolerance => members.push(text),
            _ => lines.push((text.y, vec![text])),
        }
    }
    let lines: Vec<(f64, String)> = lines
        .into_iter()
        .map(|(y, mut members)| {
            members.sort_by(|a, b| a.x.total_cmp(&b.x));
            (y, join_parts(members.iter().map(|text| text.content.as_str())))
        })
        .collect();
    if lines.is_empty() {
        return (None, None);
    }

    let non_empty = |value: String| (!value.is_empty()).then_some(value);
    match mode {
        TitleSplit::Bands => {
            if lines.len() == 1 {
                return (non_empty(lines[0].1.clone()), None);
            }
            let split_at = (1..lines.len())
                .max_by(|&a, &b| {
                    let gap_a = lines[a - 1].0 - lines[a].0;
                    let gap_b = lines[b - 1].0 - lines[b].0;
                    // 间隙相同时取靠上的
                    gap_a.total_cmp(&gap_b).then(b.cmp(&a))
                })
                .unwrap_or(1);
            let band = |range: &[(f64, String)]| join_parts(range.iter().map(|(_, line)| line.as_str()));
            (
                non_empty(band(&lines[..split_at])),
                non_empty(band(&lines[split_at..])),
            )
        }
        TitleSplit::Script => {
            let (cjk, other): (Vec<_>, Vec<_>) =
                lines.iter().partition(|(_, line)| line.chars().any(is_cjk));
            let primary = join_parts(cjk.iter().map(|(_, line)| line.as_str()));
            let secondary = other
                .iter()
                .map(|(_, line)| line.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            match non_empty(primary) {
                Some(primary) => (Some(primary), non_empty(secondary)),
                None => (non_empty(secondary), None),
            }
        }
    }
}
