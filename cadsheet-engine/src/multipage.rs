//! 小幅面多页图纸分组。

use std::cmp::Ordering;
use std::collections::BTreeMap;

use cadsheet_config::{AdjacencyMetric, MultipageConfig};
use tracing::debug;

use crate::model::{Frame, FrameIssue, ReasonCode, SheetSet, SheetSetIssue};

/// 并查集，路径压缩 + 按秩合并。
struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
            rank: vec![0; size],
        }
    }

    fn find(&mut self, mut node: usize) -> usize {
        while self.parent[node] != node {
            self.parent[node] = self.parent[self.parent[node]];
            node = self.parent[node];
        }
        node
    }

    fn union(&mut self, a: usize, b: usize) {
        let (root_a, root_b) = (self.find(a), self.find(b));
        if root_a == root_b {
            return;
        }
        match self.rank[root_a].cmp(&self.rank[root_b]) {
            Ordering::Less => self.parent[root_a] = root_b,
            Ordering::Greater => self.parent[root_b] = root_a,
            Ordering::Equal => {
                self.parent[root_b] = root_a;
                self.rank[root_a] += 1;
            }
        }
    }
}

pub struct MultipageGrouper<'c> {
    config: &'c MultipageConfig,
}

impl<'c> MultipageGrouper<'c> {
    pub fn new(config: &'c MultipageConfig) -> Self {
        Self { config }
    }

    /// 判断两个图框是否相邻。阈值按两框中最短的边换算。
    pub fn adjacent(&self, a: &Frame, b: &Frame) -> bool {
        let reference = a
            .bbox
            .width()
            .min(a.bbox.height())
            .min(b.bbox.width())
            .min(b.bbox.height());
        let threshold = self.config.threshold.resolve(reference);
        match self.config.metric {
            AdjacencyMetric::EdgeGap => {
                let (dx, dy) = a.bbox.axis_gaps(&b.bbox);
                dx < threshold && dy < threshold
            }
            AdjacencyMetric::Center => a.bbox.center().distance(b.bbox.center()) < threshold,
        }
    }

    /// 对小幅面图框做连通分组，并把一致性问题写回成员图框。
    pub fn group(&self, frames: &mut [Frame]) -> Vec<SheetSet> {
        let eligible: Vec<usize> = frames
            .iter()
            .enumerate()
            .filter(|(_, frame)| self.config.is_small_format(&frame.variant))
            .map(|(position, _)| position)
            .collect();
        if eligible.len() < 2 {
            return Vec::new();
        }

        let mut components = DisjointSet::new(eligible.len());
        for i in 0..eligible.len() {
            for j in i + 1..eligible.len() {
                if self.adjacent(&frames[eligible[i]], &frames[eligible[j]]) {
                    components.union(i, j);
                }
            }
        }

        // 以根节点聚合；BTreeMap 按首个成员排序，即识别顺序
        let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut first_of_root: BTreeMap<usize, usize> = BTreeMap::new();
        for (i, &position) in eligible.iter().enumerate() {
            let root = components.find(i);
            let first = *first_of_root.entry(root).or_insert(position);
            clusters.entry(first).or_default().push(position);
        }

        let mut sets = Vec::new();
        for members in clusters.into_values().filter(|members| members.len() >= 2) {
            let set = self.build_set(sets.len(), members, frames);
            debug!(
                sheet_set = set.id,
                master = %set.master,
                members = set.members.len(),
                issues = set.issues.len(),
                "多页图纸分组"
            );
            sets.push(set);
        }
        sets
    }

    fn build_set(&self, id: usize, mut members: Vec<usize>, frames: &mut [Frame]) -> SheetSet {
        members.sort_by(|&a, &b| member_order(&frames[a], &frames[b]));
        let master = members[0];
        let mut issues = Vec::new();

        let page_total = frames[master]
            .page_total()
            .or_else(|| members.iter().find_map(|&m| frames[m].page_total()));
        let scale_denominator = scale_of(&frames[master])
            .or_else(|| members.iter().find_map(|&m| scale_of(&frames[m])));

        for &member in &members {
            let frame = &mut frames[member];
            if let (Some(expected), Some(actual)) = (page_total, frame.page_total()) {
                if expected != actual {
                    let issue = FrameIssue::flag(
                        ReasonCode::PageCountMismatch,
                        format!("声明共 {actual} 张，主图为 {expected} 张"),
                    );
                    frame.issues.push(issue.clone());
                    issues.push(SheetSetIssue {
                        frame: Some(frame.id),
                        issue,
                    });
                }
            }
            if let (Some(expected), Some(actual)) = (scale_denominator, scale_of(frame)) {
                if (expected - actual).abs() > 1e-9 {
                    let issue = FrameIssue::flag(
                        ReasonCode::ScaleMismatch,
                        format!("比例 1:{actual}，主图为 1:{expected}"),
                    );
                    frame.issues.push(issue.clone());
                    issues.push(SheetSetIssue {
                        frame: Some(frame.id),
                        issue,
                    });
                }
            }
        }

        let mut set_issue = |reason: ReasonCode, detail: String| {
            issues.push(SheetSetIssue {
                frame: None,
                issue: FrameIssue::flag(reason, detail),
            });
        };
        if let Some(total) = page_total {
            if total as usize != members.len() {
                set_issue(
                    ReasonCode::MemberCountMismatch,
                    format!("声明共 {total} 张，实际 {} 张", members.len()),
                );
            }
        }
        let mut indices: Vec<u32> = members.iter().filter_map(|&m| frames[m].page_index()).collect();
        indices.sort_unstable();
        let duplicates: Vec<u32> = indices.windows(2).filter(|w| w[0] == w[1]).map(|w| w[0]).collect();
        if !duplicates.is_empty() {
            set_issue(ReasonCode::DuplicatePageIndex, format!("{duplicates:?}"));
        }
        indices.dedup();
        if indices.windows(2).any(|w| w[1] - w[0] > 1) {
            set_issue(ReasonCode::PageIndexGap, format!("{indices:?}"));
        }
        if let Some(index) = frames[master].page_index().filter(|index| *index != 1) {
            set_issue(ReasonCode::MasterPageIndex, format!("主图页码为 {index}"));
        }

        SheetSet {
            id,
            master: frames[master].id,
            members: members.iter().map(|&m| frames[m].id).collect(),
            page_total,
            scale_denominator,
            issues,
        }
    }
}

fn scale_of(frame: &Frame) -> Option<f64> {
    frame.titleblock.as_ref().and_then(|tb| tb.scale_denominator)
}

/// 页码升序（无页码在后），其次完整度降序，再按从上到下、从左到右。
fn member_order(a: &Frame, b: &Frame) -> Ordering {
    let page_key = |frame: &Frame| match frame.page_index() {
        Some(index) => (0, index),
        None => (1, 0),
    };
    let completeness = |frame: &Frame| {
        frame
            .titleblock
            .as_ref()
            .map_or(0, |tb| tb.completeness())
    };
    page_key(a)
        .cmp(&page_key(b))
        .then_with(|| completeness(b).cmp(&completeness(a)))
        .then_with(|| b.bbox.max().y().total_cmp(&a.bbox.max().y()))
        .then_with(|| a.bbox.min().x().total_cmp(&b.bbox.min().x()))
        .then_with(|| a.id.cmp(&b.id))
}

/// 独立图框：不属于任何多页组的图框。
pub fn standalone_frames<'f>(frames: &'f [Frame], sets: &[SheetSet]) -> Vec<&'f Frame> {
    frames
        .iter()
        .filter(|frame| !sets.iter().any(|set| set.contains(frame.id)))
        .collect()
}
