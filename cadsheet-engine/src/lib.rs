pub mod derive;
pub mod detect;
pub mod model;
pub mod multipage;
pub mod pipeline;
pub mod roi;
pub mod split;
pub mod titleblock;

pub mod errors {
    use cadsheet_config::ConfigError;
    use cadsheet_io::IoError;
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum EngineError {
        #[error("drawing {name} could not be loaded: {source}")]
        Load {
            name: String,
            #[source]
            source: IoError,
        },
        #[error("invalid configuration: {0}")]
        Config(#[from] ConfigError),
        #[error("failed to build worker pool: {0}")]
        ThreadPool(#[from] rayon::ThreadPoolBuildError),
    }
}

pub use derive::DerivationEngine;
pub use detect::FrameDetector;
pub use errors::EngineError;
pub use multipage::MultipageGrouper;
pub use pipeline::{CancellationToken, DrawingInput, JobRunner};
pub use split::Splitter;
pub use titleblock::TitleblockExtractor;

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use cadsheet_config::{PaperVariant, RoiOffset, RoiProfile, SpecConfig};
    use cadsheet_core::document::{
        Block, BlockReference, Document, Entity, EntityId, Polyline, PolylineVertex,
    };
    use cadsheet_core::geometry::{Point2, Vector2};

    const FIELDS: [(&str, [f64; 4]); 13] = [
        ("anchor", [120.0, 180.0, 50.0, 60.0]),
        ("title", [0.0, 120.0, 30.0, 60.0]),
        ("internal_code", [0.0, 90.0, 20.0, 30.0]),
        ("external_code", [90.0, 180.0, 20.0, 30.0]),
        ("engineering_no", [150.0, 180.0, 10.0, 20.0]),
        ("subitem_no", [120.0, 150.0, 10.0, 20.0]),
        ("discipline", [90.0, 120.0, 10.0, 20.0]),
        ("paper_size", [60.0, 90.0, 10.0, 20.0]),
        ("scale", [30.0, 60.0, 10.0, 20.0]),
        ("page_info", [0.0, 30.0, 10.0, 20.0]),
        ("revision", [150.0, 180.0, 0.0, 10.0]),
        ("status", [120.0, 150.0, 0.0, 10.0]),
        ("date", [90.0, 120.0, 0.0, 10.0]),
    ];

    pub(crate) fn sample_profile() -> RoiProfile {
        RoiProfile {
            description: "测试标题栏".to_string(),
            margin_percent: 0.0,
            fields: FIELDS
                .iter()
                .map(|(name, values)| {
                    let offset = RoiOffset::try_from(values.to_vec()).expect("four values");
                    (name.to_string(), offset)
                })
                .collect(),
        }
    }

    /// A1、A3 共用 BASE 方案，A4 使用独立方案。
    pub(crate) fn sample_spec() -> SpecConfig {
        let variant = |name: &str, width: f64, height: f64, profile: &str| PaperVariant {
            name: name.to_string(),
            width,
            height,
            tolerance: 0.02,
            profile: profile.to_string(),
        };
        let mut roi_profiles = BTreeMap::new();
        roi_profiles.insert("BASE".to_string(), sample_profile());
        roi_profiles.insert("A4".to_string(), sample_profile());
        SpecConfig {
            paper_variants: vec![
                variant("A1", 841.0, 594.0, "BASE"),
                variant("A3", 420.0, 297.0, "BASE"),
                variant("A4", 210.0, 297.0, "A4"),
            ],
            roi_profiles,
            ..SpecConfig::default()
        }
    }

    /// 字段 ROI 的中心点（比例为 1）。
    pub(crate) fn roi_center(anchor: Point2, field: &str) -> Point2 {
        let (_, [dx_right, dx_left, dy_bottom, dy_top]) = FIELDS
            .iter()
            .find(|(name, _)| *name == field)
            .copied()
            .expect("known field");
        Point2::new(
            anchor.x() - (dx_left + dx_right) / 2.0,
            anchor.y() + (dy_bottom + dy_top) / 2.0,
        )
    }

    pub(crate) fn add_frame_polyline(doc: &mut Document, origin: Point2, width: f64, height: f64) {
        doc.add_polyline(
            [
                origin,
                Point2::new(origin.x() + width, origin.y()),
                Point2::new(origin.x() + width, origin.y() + height),
                Point2::new(origin.x(), origin.y() + height),
            ],
            true,
            "FRAME",
        );
    }

    pub(crate) fn add_frame_lines(doc: &mut Document, origin: Point2, width: f64, height: f64) {
        let corners = [
            origin,
            Point2::new(origin.x() + width, origin.y()),
            Point2::new(origin.x() + width, origin.y() + height),
            Point2::new(origin.x(), origin.y() + height),
        ];
        for i in 0..4 {
            doc.add_line(corners[i], corners[(i + 1) % 4], "FRAME");
        }
    }

    /// 以块定义绘制的图框：块内一条以原点为基点的闭合多段线，再按 `scale` 插入到 `insert`。
    pub(crate) fn add_frame_block(
        doc: &mut Document,
        name: &str,
        insert: Point2,
        width: f64,
        height: f64,
        scale: f64,
    ) -> EntityId {
        if doc.block(name).is_none() {
            let vertices = [(0.0, 0.0), (width, 0.0), (width, height), (0.0, height)]
                .into_iter()
                .map(|(x, y)| PolylineVertex::new(Point2::new(x, y)))
                .collect();
            doc.add_block(Block {
                name: name.to_string(),
                base: Point2::new(0.0, 0.0),
                entities: vec![Entity::Polyline(Polyline {
                    vertices,
                    is_closed: true,
                    layer: "FRAME".to_string(),
                })],
            });
        }
        doc.add_entity(Entity::BlockReference(BlockReference {
            name: name.to_string(),
            insert,
            scale: Vector2::new(scale, scale),
            rotation: 0.0,
            attributes: Vec::new(),
            layer: "0".to_string(),
        }))
    }

    /// A4 竖放图框（210×297），带锚点文字、内部编码与页码。
    pub(crate) fn add_a4_sheet(
        doc: &mut Document,
        origin: Point2,
        internal_code: &str,
        page_info: &str,
    ) {
        add_frame_polyline(doc, origin, 210.0, 297.0);
        let anchor = Point2::new(origin.x() + 210.0, origin.y());
        doc.add_text(roi_center(anchor, "anchor"), "CNPE", 3.0, 0.0, "TB");
        doc.add_text(roi_center(anchor, "internal_code"), internal_code, 3.0, 0.0, "TB");
        doc.add_text(roi_center(anchor, "page_info"), page_info, 2.5, 0.0, "TB");
    }
}
