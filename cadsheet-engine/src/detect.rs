//! 图框识别：候选矩形、图幅拟合与锚点校验。

use std::cmp::Ordering;
use std::collections::BTreeSet;

use cadsheet_config::{LineRebuild, PaperVariant, SpecConfig};
use cadsheet_core::document::Entity;
use cadsheet_core::geometry::{Bounds2D, Point2};
use cadsheet_core::index::GeometryIndex;
use tracing::debug;

use crate::model::{CandidateSource, Frame, FrameId, FrameIssue, FrameRuntime, ReasonCode};
use crate::roi::resolve_roi;

/// 候选矩形。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub bbox: Bounds2D,
    pub source: CandidateSource,
}

/// 候选矩形与某个标准图幅的拟合结果。
#[derive(Debug, Clone, Copy)]
pub struct PaperFit<'c> {
    pub variant: &'c PaperVariant,
    pub scale: f64,
    pub sx: f64,
    pub sy: f64,
    pub deviation: f64,
    pub rotated: bool,
}

pub struct FrameDetector<'c> {
    spec: &'c SpecConfig,
}

impl<'c> FrameDetector<'c> {
    pub fn new(spec: &'c SpecConfig) -> Self {
        Self { spec }
    }

    /// 识别图纸中的全部图框，ID 按输出顺序从 0 编号。
    pub fn detect(&self, index: &GeometryIndex<'_>) -> Vec<Frame> {
        let mut frames = Vec::new();
        for candidate in self.candidates(index) {
            let Some(fit) = self.fit(&candidate.bbox) else {
                debug!(
                    width = candidate.bbox.width(),
                    height = candidate.bbox.height(),
                    "候选矩形不符合任何图幅，丢弃"
                );
                continue;
            };
            let anchor = Point2::new(candidate.bbox.max().x(), candidate.bbox.min().y());
            let anchor_verified = self.verify_anchor(index, &fit, anchor);
            let mut issues = Vec::new();
            if !anchor_verified {
                issues.push(FrameIssue::flag(
                    ReasonCode::AnchorUnverified,
                    format!("锚点区域未找到 {:?}", self.spec.anchor.search_texts),
                ));
            }
            let id = FrameId(frames.len());
            debug!(
                frame = %id,
                variant = %fit.variant.name,
                deviation = fit.deviation,
                rotated = fit.rotated,
                anchor_verified,
                "识别到图框"
            );
            frames.push(Frame {
                id,
                variant: fit.variant.name.clone(),
                profile: fit.variant.profile.clone(),
                bbox: candidate.bbox,
                runtime: FrameRuntime {
                    anchor,
                    sx: fit.sx,
                    sy: fit.sy,
                    scale: fit.scale,
                    deviation: fit.deviation,
                    rotated: fit.rotated,
                    anchor_verified,
                    source: candidate.source,
                },
                titleblock: None,
                issues,
            });
        }
        frames
    }

    /// 生成候选矩形：去重、按面积从大到小排列，并应用数量上限。
    pub fn candidates(&self, index: &GeometryIndex<'_>) -> Vec<Candidate> {
        let detection = &self.spec.detection;
        let document = index.document();
        // 以块参照绘制的图框：展开块内直线与多段线，与模型空间实体一同参与识别
        let exploded: Vec<Entity> = document
            .entities()
            .filter_map(|(_, entity)| match entity {
                Entity::BlockReference(reference) => Some(document.explode_linework(reference)),
                _ => None,
            })
            .flatten()
            .collect();
        let linework = || {
            document
                .entities()
                .map(|(_, entity)| entity)
                .chain(exploded.iter())
        };

        let mut candidates = polyline_candidates(linework(), detection.coord_tolerance);
        let rebuild = match detection.line_rebuild {
            LineRebuild::Always => true,
            LineRebuild::Fallback => candidates.is_empty(),
            LineRebuild::Never => false,
        };
        if rebuild {
            candidates.extend(line_candidates(
                linework(),
                detection.coord_tolerance,
                detection.orthogonality_tolerance_deg,
                detection.min_frame_dimension,
            ));
        }

        let min_dim = detection.min_frame_dimension;
        let mut seen = BTreeSet::new();
        candidates.retain(|candidate| {
            candidate.bbox.width() >= min_dim
                && candidate.bbox.height() >= min_dim
                && seen.insert(rounded_key(&candidate.bbox))
        });
        candidates.sort_by(|a, b| b.bbox.area().total_cmp(&a.bbox.area()));
        if let Some(limit) = detection.max_candidates {
            candidates.truncate(limit);
        }
        candidates
    }

    /// 先在标准比例中拟合；都不符合且允许自由比例时，按实测尺寸求统一比例。
    pub fn fit(&self, bbox: &Bounds2D) -> Option<PaperFit<'c>> {
        self.fit_discrete(bbox).or_else(|| {
            if self.spec.detection.free_scale {
                self.fit_free(bbox)
            } else {
                None
            }
        })
    }

    /// 在全部图幅、标准比例和方向中选偏差最小者；偏差相同时保留配置中靠前的。
    fn fit_discrete(&self, bbox: &Bounds2D) -> Option<PaperFit<'c>> {
        let (width, height) = (bbox.width(), bbox.height());
        let mut best: Option<PaperFit<'c>> = None;
        for variant in &self.spec.paper_variants {
            for &scale in &self.spec.detection.allowed_scales {
                for &rotated in self.orientations() {
                    let (nominal_w, nominal_h) = nominal_size(variant, rotated);
                    let (expected_w, expected_h) = (nominal_w * scale, nominal_h * scale);
                    let deviation = ((width - expected_w).abs() / expected_w)
                        .max((height - expected_h).abs() / expected_h);
                    if deviation > variant.tolerance {
                        continue;
                    }
                    if best.is_some_and(|current| deviation >= current.deviation) {
                        continue;
                    }
                    best = Some(PaperFit {
                        variant,
                        scale,
                        sx: width / nominal_w,
                        sy: height / nominal_h,
                        deviation,
                        rotated,
                    });
                }
            }
        }
        best
    }

    /// 自由比例：`sx = W / W0`、`sy = H / H0`，两者相对差不超过容差即视为统一缩放。
    /// 偏差取统一比例 `(sx + sy) / 2` 下宽高的最大相对误差。
    fn fit_free(&self, bbox: &Bounds2D) -> Option<PaperFit<'c>> {
        let (width, height) = (bbox.width(), bbox.height());
        if width <= 0.0 || height <= 0.0 {
            return None;
        }
        let mut best: Option<PaperFit<'c>> = None;
        for variant in &self.spec.paper_variants {
            for &rotated in self.orientations() {
                let (nominal_w, nominal_h) = nominal_size(variant, rotated);
                let (sx, sy) = (width / nominal_w, height / nominal_h);
                if (sx - sy).abs() / sx.max(sy) > variant.tolerance {
                    continue;
                }
                let uniform = (sx + sy) / 2.0;
                let deviation = ((nominal_w * uniform - width).abs() / width)
                    .max((nominal_h * uniform - height).abs() / height);
                if best.is_some_and(|current| deviation >= current.deviation) {
                    continue;
                }
                best = Some(PaperFit {
                    variant,
                    scale: sx,
                    sx,
                    sy,
                    deviation,
                    rotated,
                });
            }
        }
        best
    }

    fn orientations(&self) -> &'static [bool] {
        if self.spec.detection.allow_rotation {
            &[false, true]
        } else {
            &[false]
        }
    }

    fn verify_anchor(&self, index: &GeometryIndex<'_>, fit: &PaperFit<'_>, anchor: Point2) -> bool {
        let config = &self.spec.anchor;
        let Some((_, profile)) = self
            .spec
            .profile_with_field(&fit.variant.profile, &config.roi_field)
        else {
            return false;
        };
        let Some(offset) = profile.fields.get(&config.roi_field) else {
            return false;
        };
        let roi = resolve_roi(anchor, fit.sx, fit.sy, offset, config.margin_percent);
        index.texts_in(&roi).iter().any(|fragment| {
            config
                .search_texts
                .iter()
                .any(|needle| anchor_text_matches(fragment.content, needle))
        })
    }
}

fn nominal_size(variant: &PaperVariant, rotated: bool) -> (f64, f64) {
    if rotated {
        (variant.height, variant.width)
    } else {
        (variant.width, variant.height)
    }
}

/// ASCII 关键字忽略大小写与空白；其他关键字按原文包含匹配。
fn anchor_text_matches(content: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    if needle.is_ascii() {
        let squash = |s: &str| -> String {
            s.chars()
                .filter(|c| !c.is_whitespace())
                .flat_map(char::to_uppercase)
                .collect()
        };
        squash(content).contains(&squash(needle))
    } else {
        content.contains(needle)
    }
}

fn rounded_key(bbox: &Bounds2D) -> [i64; 4] {
    let round = |value: f64| (value * 1000.0).round() as i64;
    [
        round(bbox.min().x()),
        round(bbox.min().y()),
        round(bbox.max().x()),
        round(bbox.max().y()),
    ]
}

fn polyline_candidates<'e>(
    entities: impl Iterator<Item = &'e Entity>,
    tolerance: f64,
) -> Vec<Candidate> {
    entities
        .filter_map(|entity| match entity {
            Entity::Polyline(polyline) => Some(polyline),
            _ => None,
        })
        .filter_map(|polyline| {
            if polyline.vertices.len() < 4 || polyline.vertices.iter().any(|v| v.bulge.abs() > 1e-9) {
                return None;
            }
            let points: Vec<Point2> = polyline.points().collect();
            let first = points[0];
            let last = points[points.len() - 1];
            if !polyline.is_closed && first.distance(last) > tolerance {
                return None;
            }
            let xs = cluster_values(points.iter().map(|p| p.x()).collect(), tolerance);
            let ys = cluster_values(points.iter().map(|p| p.y()).collect(), tolerance);
            if xs.len() != 2 || ys.len() != 2 {
                return None;
            }
            let mut bbox = Bounds2D::empty();
            for point in &points {
                bbox.include_point(*point);
            }
            Some(Candidate {
                bbox,
                source: CandidateSource::Polyline,
            })
        })
        .collect()
}

/// 排序后把相距不超过 `tolerance` 的值并为一组，返回各组均值。
fn cluster_values(mut values: Vec<f64>, tolerance: f64) -> Vec<f64> {
    values.sort_by(f64::total_cmp);
    let mut groups: Vec<(f64, f64, usize)> = Vec::new();
    for value in values {
        match groups.last_mut() {
            Some((start, sum, count)) if value - *start <= tolerance => {
                *sum += value;
                *count += 1;
            }
            _ => groups.push((value, value, 1)),
        }
    }
    groups
        .into_iter()
        .map(|(_, sum, count)| sum / count as f64)
        .collect()
}

/// 同一坐标上的一组共线线段，区间已合并。
#[derive(Debug, Clone)]
struct EdgeGroup {
    coord: f64,
    intervals: Vec<(f64, f64)>,
}

impl EdgeGroup {
    fn covers(&self, from: f64, to: f64, tolerance: f64) -> bool {
        self.intervals
            .iter()
            .any(|(start, end)| *start <= from + tolerance && *end >= to - tolerance)
    }

    fn longest_span(&self) -> f64 {
        self.intervals
            .iter()
            .map(|(start, end)| end - start)
            .fold(0.0, f64::max)
    }
}

fn line_candidates<'e>(
    entities: impl Iterator<Item = &'e Entity>,
    tolerance: f64,
    orthogonality_deg: f64,
    min_dimension: f64,
) -> Vec<Candidate> {
    let slope = orthogonality_deg.to_radians().tan();
    // (恒定坐标, 区间起点, 区间终点)
    let mut horizontal: Vec<(f64, f64, f64)> = Vec::new();
    let mut vertical: Vec<(f64, f64, f64)> = Vec::new();
    for entity in entities {
        let Entity::Line(line) = entity else {
            continue;
        };
        let dx = line.end.x() - line.start.x();
        let dy = line.end.y() - line.start.y();
        if dx == 0.0 && dy == 0.0 {
            continue;
        }
        if dy.abs() <= dx.abs() * slope {
            let y = (line.start.y() + line.end.y()) / 2.0;
            horizontal.push((y, line.start.x().min(line.end.x()), line.start.x().max(line.end.x())));
        } else if dx.abs() <= dy.abs() * slope {
            let x = (line.start.x() + line.end.x()) / 2.0;
            vertical.push((x, line.start.y().min(line.end.y()), line.start.y().max(line.end.y())));
        }
    }

    let horizontal = edge_groups(horizontal, tolerance, min_dimension);
    let vertical = edge_groups(vertical, tolerance, min_dimension);
    let mut candidates = Vec::new();
    for (i, bottom) in horizontal.iter().enumerate() {
        for top in &horizontal[i + 1..] {
            if top.coord - bottom.coord < min_dimension {
                continue;
            }
            for (j, left) in vertical.iter().enumerate() {
                for right in &vertical[j + 1..] {
                    if right.coord - left.coord < min_dimension {
                        continue;
                    }
                    let closed = bottom.covers(left.coord, right.coord, tolerance)
                        && top.covers(left.coord, right.coord, tolerance)
                        && left.covers(bottom.coord, top.coord, tolerance)
                        && right.covers(bottom.coord, top.coord, tolerance);
                    if closed {
                        candidates.push(Candidate {
                            bbox: Bounds2D::from_corners(
                                Point2::new(left.coord, bottom.coord),
                                Point2::new(right.coord, top.coord),
                            ),
                            source: CandidateSource::Lines,
                        });
                    }
                }
            }
        }
    }
    candidates
}

fn edge_groups(mut segments: Vec<(f64, f64, f64)>, tolerance: f64, min_span: f64) -> Vec<EdgeGroup> {
    segments.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut clusters: Vec<Vec<(f64, f64, f64)>> = Vec::new();
    for segment in segments {
        match clusters.last_mut() {
            Some(cluster) if segment.0 - cluster[0].0 <= tolerance => cluster.push(segment),
            _ => clusters.push(vec![segment]),
        }
    }

    clusters
        .into_iter()
        .map(|cluster| {
            let coord = cluster.iter().map(|s| s.0).sum::<f64>() / cluster.len() as f64;
            let mut spans: Vec<(f64, f64)> = cluster.iter().map(|s| (s.1, s.2)).collect();
            spans.sort_by(|a, b| match a.0.total_cmp(&b.0) {
                Ordering::Equal => a.1.total_cmp(&b.1),
                other => other,
            });
            let mut intervals: Vec<(f64, f64)> = Vec::new();
            for (start, end) in spans {
                match intervals.last_mut() {
                    Some(last) if start <= last.1 + tolerance => last.1 = last.1.max(end),
                    _ => intervals.push((start, end)),
                }
            }
            EdgeGroup { coord, intervals }
        })
        .filter(|group| group.longest_span() >= min_span)
        .collect()
}
