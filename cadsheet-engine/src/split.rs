use cadsheet_config::SplitMargin;
use cadsheet_core::document::Document;
use cadsheet_core::geometry::Bounds2D;
use cadsheet_core::index::GeometryIndex;

use crate::model::{Frame, SubDrawing};

/// 按图框裁剪原图。保留与裁剪框相交的实体，坐标不做任何平移。
/// 块参照按块展开后的范围判断相交，子图带上其引用的块定义。
#[derive(Debug, Clone, Copy)]
pub struct Splitter {
    margin: SplitMargin,
}

impl Splitter {
    pub fn new(margin: SplitMargin) -> Self {
        Self { margin }
    }

    /// 图框外扩（或内缩）后的裁剪框。
    pub fn clip_box(&self, frame_box: &Bounds2D) -> Bounds2D {
        let (dx, dy) = self.margin.resolve(frame_box.width(), frame_box.height());
        frame_box.expanded(dx, dy)
    }

    pub fn split(
        &self,
        index: &GeometryIndex<'_>,
        frame: &Frame,
        sheet_set: Option<usize>,
        name: String,
    ) -> SubDrawing {
        let clip = self.clip_box(&frame.bbox);
        let mut document = Document::new();
        let mut source_ids = Vec::new();
        // query 按文档顺序返回，重复拆分得到相同的实体序列
        for (id, entity) in index.query(&clip) {
            document.add_entity(entity.clone());
            source_ids.push(id);
        }
        document.adopt_blocks_from(index.document());
        SubDrawing {
            frame: frame.id,
            sheet_set,
            name,
            clip,
            source_ids,
            document,
        }
    }
}

/// 子图名称：优先使用内部编码，否则为 `<图纸名>_frame<序号>`。文件系统不允许的字符替换为 `_`。
pub fn sub_drawing_name(drawing: &str, frame: &Frame) -> String {
    let raw = match frame.internal_code() {
        Some(code) => code.to_string(),
        None => format!("{drawing}_frame{}", frame.id),
    };
    raw.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::FrameDetector;
    use crate::testing::{add_frame_block, add_frame_polyline, sample_spec};
    use cadsheet_core::geometry::Point2;
    use cadsheet_io::write_dxf;

    fn sample_document() -> Document {
        let mut doc = Document::new();
        add_frame_polyline(&mut doc, Point2::new(0.0, 0.0), 420.0, 297.0);
        doc.add_line(Point2::new(10.0, 10.0), Point2::new(100.0, 100.0), "GEO");
        // 跨越图框右边界，部分重叠也保留
        doc.add_line(Point2::new(400.0, 50.0), Point2::new(600.0, 50.0), "GEO");
        // 落在外扩边距内
        doc.add_circle(Point2::new(424.0, 150.0), 1.0, "GEO");
        doc.add_text(Point2::new(700.0, 50.0), "外部", 3.0, 0.0, "TXT");
        doc
    }

    #[test]
    fn keeps_exactly_the_intersecting_entities() {
        let doc = sample_document();
        let spec = sample_spec();
        let index = GeometryIndex::build(&doc);
        let frame = FrameDetector::new(&spec).detect(&index).remove(0);
        let splitter = Splitter::new(spec.split.margin);
        let sub = splitter.split(&index, &frame, None, sub_drawing_name("plan", &frame));

        assert_eq!(sub.name, "plan_frame0");
        let expected: Vec<_> = doc
            .entities()
            .filter(|(_, entity)| {
                entity
                    .bounds()
                    .is_some_and(|bounds| bounds.intersects(&sub.clip))
            })
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(sub.source_ids, expected);
        assert_eq!(sub.source_ids.len(), 4);
        // 坐标原样保留
        let line = sub.document.entity_bounds(sub.document.entities().nth(2).expect("line").0);
        assert_eq!(line.map(|b| b.max().x()), Some(600.0));
    }

    #[test]
    fn block_references_are_kept_by_their_block_extent() {
        let mut doc = sample_document();
        // 插入点在裁剪框外，块内图形伸入图框
        let inside = add_frame_block(&mut doc, "STAMP", Point2::new(-30.0, 100.0), 60.0, 40.0, 1.0);
        add_frame_block(&mut doc, "FAR", Point2::new(2000.0, 2000.0), 60.0, 40.0, 1.0);
        let spec = sample_spec();
        let index = GeometryIndex::build(&doc);
        let frame = FrameDetector::new(&spec).detect(&index).remove(0);
        let sub = Splitter::new(spec.split.margin).split(&index, &frame, None, "plan".to_string());

        assert!(sub.source_ids.contains(&inside));
        assert_eq!(sub.source_ids.len(), 5);
        let blocks: Vec<&str> = sub.document.blocks().map(|block| block.name.as_str()).collect();
        assert_eq!(blocks, vec!["STAMP"]);
        assert!(write_dxf(&sub.document).contains("BLOCKS"));
    }

    #[test]
    fn resplitting_is_byte_stable() {
        let doc = sample_document();
        let spec = sample_spec();
        let index = GeometryIndex::build(&doc);
        let frame = FrameDetector::new(&spec).detect(&index).remove(0);
        let splitter = Splitter::new(spec.split.margin);
        let first = splitter.split(&index, &frame, None, "a".to_string());
        let second = splitter.split(&index, &frame, None, "a".to_string());
        assert_eq!(write_dxf(&first.document), write_dxf(&second.document));
    }

    #[test]
    fn negative_margin_contracts_the_clip() {
        let splitter = Splitter::new(SplitMargin::Absolute { distance: -10.0 });
        let frame_box = Bounds2D::from_corners(Point2::new(0.0, 0.0), Point2::new(100.0, 50.0));
        let clip = splitter.clip_box(&frame_box);
        assert_eq!(clip, Bounds2D::from_corners(Point2::new(10.0, 10.0), Point2::new(90.0, 40.0)));
    }
}
