//! 均匀网格空间索引。
//!
//! 每张图纸只建一次，之后图框识别、标题栏抽取与分图都通过矩形查询取实体。
//! 查询结果始终按文档顺序返回，保证下游输出稳定。

use serde::{Deserialize, Serialize};

use crate::document::{Document, Entity, EntityId, TextFragment};
use crate::geometry::Bounds2D;

/// 网格划分参数。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexOptions {
    /// 单轴最多的格子数。
    pub max_cells_per_axis: usize,
    /// 覆盖格子数超过总数该比例的实体放入溢出表，每次查询都直接扫描。
    pub oversize_fraction: f64,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            max_cells_per_axis: 256,
            oversize_fraction: 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    position: usize,
    bounds: Bounds2D,
}

#[derive(Debug, Clone, Copy)]
struct CellRange {
    col_min: usize,
    col_max: usize,
    row_min: usize,
    row_max: usize,
}

impl CellRange {
    fn count(&self) -> usize {
        (self.col_max - self.col_min + 1) * (self.row_max - self.row_min + 1)
    }
}

/// 对文档实体的只读空间索引，借用文档本身，不复制实体。
#[derive(Debug)]
pub struct GeometryIndex<'a> {
    document: &'a Document,
    slots: Vec<Slot>,
    extent: Bounds2D,
    cell_width: f64,
    cell_height: f64,
    columns: usize,
    rows: usize,
    cells: Vec<Vec<u32>>,
    oversized: Vec<u32>,
}

impl<'a> GeometryIndex<'a> {
    pub fn build(document: &'a Document) -> Self {
        Self::with_options(document, IndexOptions::default())
    }

    pub fn with_options(document: &'a Document, options: IndexOptions) -> Self {
        let mut extent = Bounds2D::empty();
        let slots: Vec<Slot> = document
            .entity_extents()
            .into_iter()
            .enumerate()
            .filter_map(|(position, bounds)| {
                bounds.map(|bounds| {
                    extent.include_bounds(&bounds);
                    Slot { position, bounds }
                })
            })
            .collect();

        let mut index = Self {
            document,
            slots,
            extent,
            cell_width: 1.0,
            cell_height: 1.0,
            columns: 0,
            rows: 0,
            cells: Vec::new(),
            oversized: Vec::new(),
        };
        if index.slots.is_empty() {
            return index;
        }

        let per_axis = (index.slots.len() as f64)
            .sqrt()
            .ceil()
            .clamp(1.0, options.max_cells_per_axis.max(1) as f64) as usize;
        index.columns = if extent.width() > 0.0 { per_axis } else { 1 };
        index.rows = if extent.height() > 0.0 { per_axis } else { 1 };
        index.cell_width = if extent.width() > 0.0 {
            extent.width() / index.columns as f64
        } else {
            1.0
        };
        index.cell_height = if extent.height() > 0.0 {
            extent.height() / index.rows as f64
        } else {
            1.0
        };
        index.cells = vec![Vec::new(); index.columns * index.rows];

        let total = index.columns * index.rows;
        let oversize_limit = ((total as f64 * options.oversize_fraction) as usize).max(1);
        for slot_index in 0..index.slots.len() {
            let range = index.cell_range(&index.slots[slot_index].bounds);
            if total > 1 && range.count() > oversize_limit {
                index.oversized.push(slot_index as u32);
                continue;
            }
            for row in range.row_min..=range.row_max {
                for col in range.col_min..=range.col_max {
                    index.cells[row * index.columns + col].push(slot_index as u32);
                }
            }
        }
        index
    }

    #[inline]
    pub fn document(&self) -> &'a Document {
        self.document
    }

    /// 所有有范围的实体的总包围盒；空文档为空框。
    #[inline]
    pub fn extent(&self) -> Bounds2D {
        self.extent
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 返回包围盒与 `area` 相交（含边界接触）的全部实体，按文档顺序。
    pub fn query(&self, area: &Bounds2D) -> Vec<(EntityId, &'a Entity)> {
        let entities = self.document.entity_slice();
        self.candidates(area)
            .into_iter()
            .filter_map(|slot_index| {
                let slot = &self.slots[slot_index as usize];
                if slot.bounds.intersects(area) {
                    let (id, entity) = &entities[slot.position];
                    Some((*id, entity))
                } else {
                    None
                }
            })
            .collect()
    }

    /// 返回插入点落在 `area` 内的文字片段，按文档顺序。
    pub fn texts_in(&self, area: &Bounds2D) -> Vec<TextFragment<'a>> {
        self.query(area)
            .into_iter()
            .flat_map(|(id, entity)| entity.text_fragments(id))
            .filter(|fragment| area.contains_point(fragment.position))
            .collect()
    }

    fn candidates(&self, area: &Bounds2D) -> Vec<u32> {
        if self.slots.is_empty() || !area.intersects(&self.extent) {
            return Vec::new();
        }
        let range = self.cell_range(area);
        let mut found: Vec<u32> = self.oversized.clone();
        for row in range.row_min..=range.row_max {
            for col in range.col_min..=range.col_max {
                found.extend_from_slice(&self.cells[row * self.columns + col]);
            }
        }
        found.sort_unstable();
        found.dedup();
        found
    }

    fn cell_range(&self, bounds: &Bounds2D) -> CellRange {
        let (col_min, col_max) = axis_range(
            bounds.min().x(),
            bounds.max().x(),
            self.extent.min().x(),
            self.cell_width,
            self.columns,
        );
        let (row_min, row_max) = axis_range(
            bounds.min().y(),
            bounds.max().y(),
            self.extent.min().y(),
            self.cell_height,
            self.rows,
        );
        CellRange {
            col_min,
            col_max,
            row_min,
            row_max,
        }
    }
}

fn axis_range(low: f64, high: f64, origin: f64, cell: f64, count: usize) -> (usize, usize) {
    let last = count.saturating_sub(1);
    let to_cell = |value: f64| -> usize {
        let raw = ((value - origin) / cell).floor();
        if raw <= 0.0 {
            0
        } else {
            (raw as usize).min(last)
        }
    };
    (to_cell(low), to_cell(high))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point2;

    fn brute_force(doc: &Document, area: &Bounds2D) -> Vec<EntityId> {
        doc.entities()
            .filter(|(_, entity)| entity.bounds().is_some_and(|b| b.intersects(area)))
            .map(|(id, _)| *id)
            .collect()
    }

    fn sample_document() -> Document {
        let mut doc = Document::new();
        for i in 0..40 {
            let x = (i % 8) as f64 * 50.0;
            let y = (i / 8) as f64 * 40.0;
            doc.add_line(Point2::new(x, y), Point2::new(x + 30.0, y + 10.0), "0");
            doc.add_text(Point2::new(x + 5.0, y + 5.0), format!("T{i}"), 2.5, 0.0, "TXT");
        }
        // 横跨整张图的外框，应落入溢出表
        doc.add_polyline(
            [
                Point2::new(-10.0, -10.0),
                Point2::new(420.0, -10.0),
                Point2::new(420.0, 200.0),
                Point2::new(-10.0, 200.0),
            ],
            true,
            "FRAME",
        );
        doc
    }

    #[test]
    fn empty_document_yields_queryable_index() {
        let doc = Document::new();
        let index = GeometryIndex::build(&doc);
        assert!(index.is_empty());
        assert!(index.extent().is_empty());
        let area = Bounds2D::from_corners(Point2::new(0.0, 0.0), Point2::new(1.0, 1.0));
        assert!(index.query(&area).is_empty());
        assert!(index.texts_in(&area).is_empty());
    }

    #[test]
    fn query_matches_brute_force_in_document_order() {
        let doc = sample_document();
        let index = GeometryIndex::build(&doc);
        let areas = [
            Bounds2D::from_corners(Point2::new(0.0, 0.0), Point2::new(60.0, 45.0)),
            Bounds2D::from_corners(Point2::new(130.0, 70.0), Point2::new(260.0, 130.0)),
            Bounds2D::from_corners(Point2::new(-100.0, -100.0), Point2::new(-50.0, -50.0)),
            Bounds2D::from_corners(Point2::new(30.0, 10.0), Point2::new(30.0, 10.0)),
        ];
        for area in areas {
            let got: Vec<EntityId> = index.query(&area).into_iter().map(|(id, _)| id).collect();
            assert_eq!(got, brute_force(&doc, &area), "area {area:?}");
        }
    }

    #[test]
    fn texts_in_filters_by_insertion_point() {
        let doc = sample_document();
        let index = GeometryIndex::build(&doc);
        let area = Bounds2D::from_corners(Point2::new(0.0, 0.0), Point2::new(10.0, 10.0));
        let texts: Vec<&str> = index.texts_in(&area).iter().map(|t| t.content).collect();
        assert_eq!(texts, vec!["T0"]);
    }

    #[test]
    fn degenerate_extent_uses_single_column() {
        let mut doc = Document::new();
        doc.add_text(Point2::new(5.0, 0.0), "A", 1.0, 0.0, "0");
        doc.add_text(Point2::new(5.0, 10.0), "B", 1.0, 0.0, "0");
        let index = GeometryIndex::build(&doc);
        let point = Point2::new(5.0, 10.0);
        let ids: Vec<EntityId> = index
            .query(&Bounds2D::new(point, point))
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec![EntityId::new(1)]);
    }
}
