pub mod index;

pub mod geometry {
    use glam::DVec2;
    use serde::{Deserialize, Serialize};

    /// 二维点，内部以 `glam::DVec2` 表示，坐标始终保持图纸原始坐标系。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Point2(pub DVec2);

    impl Point2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn from_vec(vec: DVec2) -> Self {
            Self(vec)
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }

        #[inline]
        pub fn translate(self, offset: Vector2) -> Self {
            Self(self.0 + offset.0)
        }

        #[inline]
        pub fn distance(self, other: Point2) -> f64 {
            self.0.distance(other.0)
        }

        #[inline]
        pub fn as_vec2(self) -> DVec2 {
            self.0
        }
    }

    impl From<DVec2> for Point2 {
        fn from(value: DVec2) -> Self {
            Self::from_vec(value)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Vector2(pub DVec2);

    impl Vector2 {
        #[inline]
        pub fn new(x: f64, y: f64) -> Self {
            Self(DVec2::new(x, y))
        }

        #[inline]
        pub fn from_points(start: Point2, end: Point2) -> Self {
            Self(end.0 - start.0)
        }

        #[inline]
        pub fn length(self) -> f64 {
            self.0.length()
        }

        #[inline]
        pub fn x(self) -> f64 {
            self.0.x
        }

        #[inline]
        pub fn y(self) -> f64 {
            self.0.y
        }
    }

    /// 轴对齐边界框。图框、ROI、裁剪框与实体范围都使用它表示。
    ///
    /// 所有相交/包含判断都是闭区间语义：边界接触也算相交。
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct Bounds2D {
        min: Point2,
        max: Point2,
    }

    impl Bounds2D {
        #[inline]
        pub fn new(min: Point2, max: Point2) -> Self {
            Self { min, max }
        }

        /// 由任意两个角点构造，自动规范化 min/max。
        pub fn from_corners(a: Point2, b: Point2) -> Self {
            Self {
                min: Point2::from_vec(a.as_vec2().min(b.as_vec2())),
                max: Point2::from_vec(a.as_vec2().max(b.as_vec2())),
            }
        }

        #[inline]
        pub fn empty() -> Self {
            Self {
                min: Point2::new(f64::INFINITY, f64::INFINITY),
                max: Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY),
            }
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.min.x() > self.max.x() || self.min.y() > self.max.y()
        }

        #[inline]
        pub fn min(&self) -> Point2 {
            self.min
        }

        #[inline]
        pub fn max(&self) -> Point2 {
            self.max
        }

        #[inline]
        pub fn width(&self) -> f64 {
            if self.is_empty() {
                0.0
            } else {
                self.max.x() - self.min.x()
            }
        }

        #[inline]
        pub fn height(&self) -> f64 {
            if self.is_empty() {
                0.0
            } else {
                self.max.y() - self.min.y()
            }
        }

        #[inline]
        pub fn area(&self) -> f64 {
            self.width() * self.height()
        }

        pub fn include_point(&mut self, point: Point2) {
            if self.is_empty() {
                self.min = point;
                self.max = point;
                return;
            }
            let min_vec = self.min.as_vec2().min(point.as_vec2());
            let max_vec = self.max.as_vec2().max(point.as_vec2());
            self.min = Point2::from_vec(min_vec);
            self.max = Point2::from_vec(max_vec);
        }

        pub fn include_bounds(&mut self, other: &Bounds2D) {
            if other.is_empty() {
                return;
            }
            self.include_point(other.min);
            self.include_point(other.max);
        }

        #[inline]
        pub fn center(&self) -> Point2 {
            debug_assert!(!self.is_empty());
            let center = (self.min.as_vec2() + self.max.as_vec2()) * 0.5;
            Point2::from_vec(center)
        }

        /// 闭区间相交判断，只有一条边重合也视为相交。
        pub fn intersects(&self, other: &Bounds2D) -> bool {
            if self.is_empty() || other.is_empty() {
                return false;
            }
            self.min.x() <= other.max.x()
                && other.min.x() <= self.max.x()
                && self.min.y() <= other.max.y()
                && other.min.y() <= self.max.y()
        }

        pub fn contains_point(&self, point: Point2) -> bool {
            !self.is_empty()
                && point.x() >= self.min.x()
                && point.x() <= self.max.x()
                && point.y() >= self.min.y()
                && point.y() <= self.max.y()
        }

        /// 向四周扩张（负值为收缩）。收缩过度时返回空框。
        pub fn expanded(&self, dx: f64, dy: f64) -> Bounds2D {
            if self.is_empty() {
                return *self;
            }
            let min = Point2::new(self.min.x() - dx, self.min.y() - dy);
            let max = Point2::new(self.max.x() + dx, self.max.y() + dy);
            if min.x() > max.x() || min.y() > max.y() {
                Bounds2D::empty()
            } else {
                Bounds2D::new(min, max)
            }
        }

        /// 四个角点，逆时针，从左下角开始。
        pub fn corners(&self) -> [Point2; 4] {
            [
                self.min,
                Point2::new(self.max.x(), self.min.y()),
                self.max,
                Point2::new(self.min.x(), self.max.y()),
            ]
        }

        /// 两个框在 x、y 方向上的间隙，重叠时为 0。
        pub fn axis_gaps(&self, other: &Bounds2D) -> (f64, f64) {
            let dx = (self.min.x().max(other.min.x()) - self.max.x().min(other.max.x())).max(0.0);
            let dy = (self.min.y().max(other.min.y()) - self.max.y().min(other.max.y())).max(0.0);
            (dx, dy)
        }
    }
}

pub mod document {
    use std::collections::{BTreeMap, HashMap};
    use std::f64::consts::{FRAC_PI_2, PI, TAU};

    use glam::DVec2;
    use serde::{Deserialize, Serialize};

    use crate::geometry::{Bounds2D, Point2, Vector2};

    /// 块嵌套展开的层数上限，自引用的块在此截断。
    const MAX_BLOCK_DEPTH: usize = 16;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub struct EntityId(u64);

    impl EntityId {
        #[inline]
        pub fn new(raw: u64) -> Self {
            Self(raw)
        }

        /// 提供原始数值，便于序列化或日志输出。
        #[inline]
        pub fn get(self) -> u64 {
            self.0
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Layer {
        pub name: String,
        pub is_visible: bool,
    }

    impl Layer {
        #[inline]
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                is_visible: true,
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub enum Entity {
        Line(Line),
        Circle(Circle),
        Arc(Arc),
        Polyline(Polyline),
        Text(Text),
        MText(MText),
        BlockReference(BlockReference),
    }

    /// 带文字的实体片段：TEXT、MTEXT 以及块参照上的属性。位置取插入点。
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct TextFragment<'a> {
        pub entity: EntityId,
        pub position: Point2,
        pub content: &'a str,
    }

    impl Entity {
        #[inline]
        pub fn layer_name(&self) -> &str {
            match self {
                Entity::Line(line) => &line.layer,
                Entity::Circle(circle) => &circle.layer,
                Entity::Arc(arc) => &arc.layer,
                Entity::Polyline(polyline) => &polyline.layer,
                Entity::Text(text) => &text.layer,
                Entity::MText(mtext) => &mtext.layer,
                Entity::BlockReference(reference) => &reference.layer,
            }
        }

        #[inline]
        pub fn kind(&self) -> &'static str {
            match self {
                Entity::Line(_) => "LINE",
                Entity::Circle(_) => "CIRCLE",
                Entity::Arc(_) => "ARC",
                Entity::Polyline(_) => "LWPOLYLINE",
                Entity::Text(_) => "TEXT",
                Entity::MText(_) => "MTEXT",
                Entity::BlockReference(_) => "INSERT",
            }
        }

        /// 计算实体自身的 2D 轴对齐范围，文本退化为插入点。
        ///
        /// 块参照只计插入点与属性；含块内几何的范围见 [`Document::extent_of`]。
        pub fn bounds(&self) -> Option<Bounds2D> {
            let mut bounds = Bounds2D::empty();
            match self {
                Entity::Line(line) => {
                    bounds.include_point(line.start);
                    bounds.include_point(line.end);
                }
                Entity::Circle(circle) => {
                    let radius = circle.radius.abs();
                    let center = circle.center;
                    bounds.include_point(Point2::new(center.x() - radius, center.y() - radius));
                    bounds.include_point(Point2::new(center.x() + radius, center.y() + radius));
                }
                Entity::Arc(arc) => {
                    arc_bounds(arc, &mut bounds);
                }
                Entity::Polyline(polyline) => {
                    let count = polyline.vertices.len();
                    for (index, vertex) in polyline.vertices.iter().enumerate() {
                        bounds.include_point(vertex.position);
                        let next = if index + 1 < count {
                            Some(&polyline.vertices[index + 1])
                        } else if polyline.is_closed && count > 1 {
                            Some(&polyline.vertices[0])
                        } else {
                            None
                        };
                        if let Some(next) = next {
                            polyline_segment_bounds(
                                vertex.position,
                                next.position,
                                vertex.bulge,
                                &mut bounds,
                            );
                        }
                    }
                }
                Entity::Text(text) => {
                    bounds.include_point(text.insert);
                }
                Entity::MText(mtext) => {
                    bounds.include_point(mtext.insert);
                }
                Entity::BlockReference(reference) => {
                    bounds.include_point(reference.insert);
                    for attr in &reference.attributes {
                        bounds.include_point(attr.insert);
                    }
                }
            }
            if bounds.is_empty() {
                None
            } else {
                Some(bounds)
            }
        }

        /// 展开实体携带的全部文字片段；非文字实体返回空。
        pub fn text_fragments(&self, id: EntityId) -> Vec<TextFragment<'_>> {
            match self {
                Entity::Text(text) => vec![TextFragment {
                    entity: id,
                    position: text.insert,
                    content: &text.content,
                }],
                Entity::MText(mtext) => vec![TextFragment {
                    entity: id,
                    position: mtext.insert,
                    content: &mtext.content,
                }],
                Entity::BlockReference(reference) => reference
                    .attributes
                    .iter()
                    .map(|attr| TextFragment {
                        entity: id,
                        position: attr.insert,
                        content: &attr.text,
                    })
                    .collect(),
                _ => Vec::new(),
            }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Line {
        pub start: Point2,
        pub end: Point2,
        pub layer: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Circle {
        pub center: Point2,
        pub radius: f64,
        pub layer: String,
    }

    /// 圆弧，角度使用弧度、逆时针。
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Arc {
        pub center: Point2,
        pub radius: f64,
        pub start_angle: f64,
        pub end_angle: f64,
        pub layer: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Polyline {
        pub vertices: Vec<PolylineVertex>,
        pub is_closed: bool,
        pub layer: String,
    }

    impl Polyline {
        pub fn points(&self) -> impl Iterator<Item = Point2> + '_ {
            self.vertices.iter().map(|vertex| vertex.position)
        }
    }

    #[derive(Debug, Clone, Copy, Serialize, Deserialize)]
    pub struct PolylineVertex {
        pub position: Point2,
        pub bulge: f64,
    }

    impl PolylineVertex {
        #[inline]
        pub fn new(position: Point2) -> Self {
            Self {
                position,
                bulge: 0.0,
            }
        }

        #[inline]
        pub fn with_bulge(position: Point2, bulge: f64) -> Self {
            Self { position, bulge }
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Text {
        pub insert: Point2,
        pub content: String,
        pub height: f64,
        pub rotation: f64,
        pub layer: String,
    }

    /// 多行文字。`content` 已经去掉格式控制码。
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MText {
        pub insert: Point2,
        pub content: String,
        pub height: f64,
        pub reference_width: Option<f64>,
        pub direction: Vector2,
        pub attachment_point: i16,
        pub style: Option<String>,
        pub layer: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Attribute {
        pub tag: String,
        pub text: String,
        pub insert: Point2,
        pub height: f64,
        pub rotation: f64,
        pub layer: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct BlockReference {
        pub name: String,
        pub insert: Point2,
        pub scale: Vector2,
        pub rotation: f64,
        pub attributes: Vec<Attribute>,
        pub layer: String,
    }

    impl BlockReference {
        /// 块坐标换算到插入坐标：相对基点缩放，再旋转并平移到插入点。
        pub fn to_world(&self, base: Point2, local: Point2) -> Point2 {
            let x = (local.x() - base.x()) * self.scale.x();
            let y = (local.y() - base.y()) * self.scale.y();
            let (sin, cos) = self.rotation.sin_cos();
            Point2::new(
                self.insert.x() + x * cos - y * sin,
                self.insert.y() + x * sin + y * cos,
            )
        }

        fn is_mirrored(&self) -> bool {
            self.scale.x() * self.scale.y() < 0.0
        }
    }

    /// 块定义。`entities` 使用块自身坐标系，由块参照按基点换算。
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Block {
        pub name: String,
        pub base: Point2,
        pub entities: Vec<Entity>,
    }

    /// 一张图纸的实体集合。实体按读入顺序存放，`EntityId` 与位置一一对应。
    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    pub struct Document {
        layers: HashMap<String, Layer>,
        entities: Vec<(EntityId, Entity)>,
        next_entity_id: u64,
        #[serde(default)]
        blocks: BTreeMap<String, Block>,
    }

    impl Document {
        pub fn new() -> Self {
            let mut doc = Self::default();
            doc.ensure_layer("0");
            doc
        }

        pub fn ensure_layer(&mut self, name: impl AsRef<str>) {
            let key = name.as_ref();
            self.layers
                .entry(key.to_string())
                .or_insert_with(|| Layer::new(key));
        }

        pub fn add_line(
            &mut self,
            start: Point2,
            end: Point2,
            layer: impl Into<String>,
        ) -> EntityId {
            let layer = layer.into();
            self.push(Entity::Line(Line { start, end, layer }))
        }

        pub fn add_circle(
            &mut self,
            center: Point2,
            radius: f64,
            layer: impl Into<String>,
        ) -> EntityId {
            let layer = layer.into();
            self.push(Entity::Circle(Circle {
                center,
                radius,
                layer,
            }))
        }

        pub fn add_arc(
            &mut self,
            center: Point2,
            radius: f64,
            start_angle: f64,
            end_angle: f64,
            layer: impl Into<String>,
        ) -> EntityId {
            let layer = layer.into();
            self.push(Entity::Arc(Arc {
                center,
                radius,
                start_angle,
                end_angle,
                layer,
            }))
        }

        pub fn add_polyline<I>(
            &mut self,
            points: I,
            is_closed: bool,
            layer: impl Into<String>,
        ) -> EntityId
        where
            I: IntoIterator<Item = Point2>,
        {
            let vertices = points.into_iter().map(PolylineVertex::new).collect();
            let layer = layer.into();
            self.push(Entity::Polyline(Polyline {
                vertices,
                is_closed,
                layer,
            }))
        }

        pub fn add_text(
            &mut self,
            insert: Point2,
            content: impl Into<String>,
            height: f64,
            rotation: f64,
            layer: impl Into<String>,
        ) -> EntityId {
            let layer = layer.into();
            self.push(Entity::Text(Text {
                insert,
                content: content.into(),
                height,
                rotation,
                layer,
            }))
        }

        pub fn add_mtext(
            &mut self,
            insert: Point2,
            content: impl Into<String>,
            height: f64,
            reference_width: Option<f64>,
            layer: impl Into<String>,
        ) -> EntityId {
            let layer = layer.into();
            self.push(Entity::MText(MText {
                insert,
                content: content.into(),
                height,
                reference_width,
                direction: Vector2::new(1.0, 0.0),
                attachment_point: 1,
                style: None,
                layer,
            }))
        }

        /// 追加任意实体，ID 按插入顺序连续分配。
        pub fn add_entity(&mut self, entity: Entity) -> EntityId {
            self.push(entity)
        }

        fn push(&mut self, entity: Entity) -> EntityId {
            self.ensure_layer(entity.layer_name());
            if let Entity::BlockReference(reference) = &entity {
                for attribute in &reference.attributes {
                    self.ensure_layer(&attribute.layer);
                }
            }
            let id = self.next_id();
            self.entities.push((id, entity));
            id
        }

        /// 登记块定义，同名定义以后者为准。
        pub fn add_block(&mut self, block: Block) {
            for entity in &block.entities {
                self.ensure_layer(entity.layer_name());
            }
            self.blocks.insert(block.name.clone(), block);
        }

        #[inline]
        pub fn block(&self, name: &str) -> Option<&Block> {
            self.blocks.get(name)
        }

        /// 按块名排序。
        #[inline]
        pub fn blocks(&self) -> impl Iterator<Item = &Block> {
            self.blocks.values()
        }

        /// 从 `source` 复制本文档块参照（含嵌套引用）所需的块定义。
        pub fn adopt_blocks_from(&mut self, source: &Document) {
            let mut pending: Vec<String> = self
                .entities
                .iter()
                .filter_map(|(_, entity)| referenced_block(entity))
                .collect();
            while let Some(name) = pending.pop() {
                if self.blocks.contains_key(&name) {
                    continue;
                }
                let Some(block) = source.blocks.get(&name) else {
                    continue;
                };
                pending.extend(block.entities.iter().filter_map(referenced_block));
                self.add_block(block.clone());
            }
        }

        #[inline]
        pub fn layers(&self) -> impl Iterator<Item = &Layer> {
            self.layers.values()
        }

        #[inline]
        pub fn entities(&self) -> impl Iterator<Item = &(EntityId, Entity)> {
            self.entities.iter()
        }

        #[inline]
        pub fn entity_slice(&self) -> &[(EntityId, Entity)] {
            &self.entities
        }

        #[inline]
        pub fn len(&self) -> usize {
            self.entities.len()
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.entities.is_empty()
        }

        #[inline]
        pub fn entity(&self, id: EntityId) -> Option<&Entity> {
            self.entities.iter().find_map(|(entity_id, entity)| {
                if *entity_id == id {
                    Some(entity)
                } else {
                    None
                }
            })
        }

        #[inline]
        pub fn entity_bounds(&self, id: EntityId) -> Option<Bounds2D> {
            self.entity(id).and_then(|entity| self.extent_of(entity))
        }

        pub fn bounds(&self) -> Option<Bounds2D> {
            let mut bounds = Bounds2D::empty();
            let mut has = false;
            for entity_bounds in self.entity_extents().into_iter().flatten() {
                bounds.include_bounds(&entity_bounds);
                has = true;
            }
            if has { Some(bounds) } else { None }
        }

        /// 实体在图纸坐标中的范围。块参照取块内几何换算后的范围并包含属性；
        /// 块未定义或为空时退化为插入点。
        pub fn extent_of(&self, entity: &Entity) -> Option<Bounds2D> {
            self.extent_with(entity, &mut HashMap::new(), 0)
        }

        /// 按文档顺序给出每个实体的范围，同名块只计算一次。
        pub fn entity_extents(&self) -> Vec<Option<Bounds2D>> {
            let mut cache = HashMap::new();
            self.entities
                .iter()
                .map(|(_, entity)| self.extent_with(entity, &mut cache, 0))
                .collect()
        }

        fn extent_with<'s>(
            &'s self,
            entity: &Entity,
            cache: &mut HashMap<&'s str, Option<Bounds2D>>,
            depth: usize,
        ) -> Option<Bounds2D> {
            let Entity::BlockReference(reference) = entity else {
                return entity.bounds();
            };
            let mut bounds = Bounds2D::empty();
            let local = self.block_extent(&reference.name, cache, depth);
            match self.blocks.get(&reference.name).zip(local) {
                Some((block, local)) => {
                    for corner in local.corners() {
                        bounds.include_point(reference.to_world(block.base, corner));
                    }
                }
                None => bounds.include_point(reference.insert),
            }
            for attribute in &reference.attributes {
                bounds.include_point(attribute.insert);
            }
            (!bounds.is_empty()).then_some(bounds)
        }

        fn block_extent<'s>(
            &'s self,
            name: &str,
            cache: &mut HashMap<&'s str, Option<Bounds2D>>,
            depth: usize,
        ) -> Option<Bounds2D> {
            if let Some(cached) = cache.get(name) {
                return *cached;
            }
            if depth >= MAX_BLOCK_DEPTH {
                return None;
            }
            let block = self.blocks.get(name)?;
            let mut bounds = Bounds2D::empty();
            for entity in &block.entities {
                if let Some(child) = self.extent_with(entity, cache, depth + 1) {
                    bounds.include_bounds(&child);
                }
            }
            let extent = (!bounds.is_empty()).then_some(bounds);
            cache.insert(block.name.as_str(), extent);
            extent
        }

        /// 把块参照中的直线与多段线换算到图纸坐标，嵌套块逐层展开。
        /// 其他实体类型不展开。
        pub fn explode_linework(&self, reference: &BlockReference) -> Vec<Entity> {
            let mut out = Vec::new();
            self.explode_into(reference, &|point| point, false, 0, &mut out);
            out
        }

        fn explode_into(
            &self,
            reference: &BlockReference,
            outer: &dyn Fn(Point2) -> Point2,
            mirrored: bool,
            depth: usize,
            out: &mut Vec<Entity>,
        ) {
            if depth >= MAX_BLOCK_DEPTH {
                return;
            }
            let Some(block) = self.blocks.get(&reference.name) else {
                return;
            };
            // 镜像后圆弧方向反转
            let mirrored = mirrored ^ reference.is_mirrored();
            let transform = |point: Point2| outer(reference.to_world(block.base, point));
            for entity in &block.entities {
                match entity {
                    Entity::Line(line) => out.push(Entity::Line(Line {
                        start: transform(line.start),
                        end: transform(line.end),
                        layer: line.layer.clone(),
                    })),
                    Entity::Polyline(polyline) => out.push(Entity::Polyline(Polyline {
                        vertices: polyline
                            .vertices
                            .iter()
                            .map(|vertex| {
                                let bulge = if mirrored { -vertex.bulge } else { vertex.bulge };
                                PolylineVertex::with_bulge(transform(vertex.position), bulge)
                            })
                            .collect(),
                        is_closed: polyline.is_closed,
                        layer: polyline.layer.clone(),
                    })),
                    Entity::BlockReference(inner) => {
                        self.explode_into(inner, &transform, mirrored, depth + 1, out)
                    }
                    _ => {}
                }
            }
        }

        #[inline]
        fn next_id(&mut self) -> EntityId {
            let id = self.next_entity_id;
            self.next_entity_id += 1;
            EntityId(id)
        }
    }

    fn referenced_block(entity: &Entity) -> Option<String> {
        match entity {
            Entity::BlockReference(reference) => Some(reference.name.clone()),
            _ => None,
        }
    }

    fn normalize_angle(angle: f64) -> f64 {
        let mut result = angle % TAU;
        if result < 0.0 {
            result += TAU;
        }
        result
    }

    fn canonical_interval(start: f64, end: f64) -> (f64, f64) {
        let start = normalize_angle(start);
        let mut end = normalize_angle(end);
        if (end - start).abs() < 1e-9 {
            end = start + TAU;
        } else if end < start {
            end += TAU;
        }
        (start, end)
    }

    fn arc_point(center: Point2, radius: f64, angle: f64) -> Point2 {
        let offset = Vector2::new(radius * angle.cos(), radius * angle.sin());
        center.translate(offset)
    }

    fn arc_bounds(arc: &Arc, bounds: &mut Bounds2D) {
        let radius = arc.radius.abs();
        if radius <= f64::EPSILON {
            bounds.include_point(arc.center);
            return;
        }

        let (start, end) = canonical_interval(arc.start_angle, arc.end_angle);
        bounds.include_point(arc_point(arc.center, radius, start));
        bounds.include_point(arc_point(arc.center, radius, end));

        // 落在区间内的象限点决定外扩方向
        const QUADRANTS: [f64; 4] = [0.0, FRAC_PI_2, PI, FRAC_PI_2 * 3.0];
        for base in QUADRANTS {
            let mut candidate = base;
            while candidate < start {
                candidate += TAU;
            }
            if candidate <= end {
                bounds.include_point(arc_point(arc.center, radius, candidate));
            }
        }
    }

    fn polyline_segment_bounds(start: Point2, end: Point2, bulge: f64, bounds: &mut Bounds2D) {
        if bulge.abs() <= 1e-9 {
            return;
        }

        let start_vec = start.as_vec2();
        let end_vec = end.as_vec2();
        let chord = end_vec - start_vec;
        let chord_len = chord.length();
        if chord_len <= f64::EPSILON {
            return;
        }

        let theta = 4.0 * bulge.atan();
        let sin_half = (theta / 2.0).sin();
        if sin_half.abs() <= 1e-9 {
            return;
        }

        let radius = chord_len / (2.0 * sin_half);
        let midpoint = (start_vec + end_vec) * 0.5;
        let perp_dir = DVec2::new(-chord.y, chord.x).normalize();
        let offset = radius * (theta / 2.0).cos();
        let center_vec = midpoint + perp_dir * offset;

        let start_dir = start_vec - center_vec;
        let end_dir = end_vec - center_vec;
        let mut start_angle = start_dir.y.atan2(start_dir.x);
        let mut end_angle = end_dir.y.atan2(end_dir.x);
        if theta < 0.0 {
            std::mem::swap(&mut start_angle, &mut end_angle);
        }

        let arc = Arc {
            center: Point2::from_vec(center_vec),
            radius: radius.abs(),
            start_angle,
            end_angle,
            layer: String::new(),
        };
        arc_bounds(&arc, bounds);
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::f64::consts::FRAC_PI_2;

        #[test]
        fn document_assigns_sequential_ids() {
            let mut doc = Document::new();
            let line = doc.add_line(Point2::new(0.0, 0.0), Point2::new(10.0, 0.0), "0");
            let circle = doc.add_circle(Point2::new(5.0, 5.0), 2.0, "ANNOT");
            let text = doc.add_text(Point2::new(1.0, 1.0), "图号", 2.5, 0.0, "TB");

            assert_eq!(line.get(), 0);
            assert_eq!(circle.get(), 1);
            assert_eq!(text.get(), 2);
            assert_eq!(doc.len(), 3);
            let layers: Vec<_> = doc.layers().map(|l| l.name.clone()).collect();
            assert!(layers.contains(&"ANNOT".to_string()));
            assert!(layers.contains(&"TB".to_string()));

            match doc.entity(text) {
                Some(Entity::Text(text)) => assert_eq!(text.content, "图号"),
                other => panic!("unexpected entity lookup result: {other:?}"),
            }
        }

        #[test]
        fn quarter_arc_bounds_cover_quadrant_point() {
            let mut doc = Document::new();
            let id = doc.add_arc(Point2::new(0.0, 0.0), 2.0, 0.0, FRAC_PI_2, "0");
            let bounds = doc.entity_bounds(id).expect("arc bounds");
            assert!((bounds.min().x() - 0.0).abs() < 1e-9);
            assert!((bounds.min().y() - 0.0).abs() < 1e-9);
            assert!((bounds.max().x() - 2.0).abs() < 1e-9);
            assert!((bounds.max().y() - 2.0).abs() < 1e-9);
        }

        #[test]
        fn bulged_polyline_extends_bounds() {
            let mut doc = Document::new();
            // 半圆：从 (0,0) 到 (2,0)，bulge = 1 为逆时针半圆，向下凸出
            let id = doc.add_entity(Entity::Polyline(Polyline {
                vertices: vec![
                    PolylineVertex::with_bulge(Point2::new(0.0, 0.0), 1.0),
                    PolylineVertex::new(Point2::new(2.0, 0.0)),
                ],
                is_closed: false,
                layer: "0".to_string(),
            }));
            let bounds = doc.entity_bounds(id).expect("polyline bounds");
            assert!((bounds.min().y() + 1.0).abs() < 1e-9);
            assert!(bounds.max().y().abs() < 1e-9);
        }

        #[test]
        fn block_reference_exposes_attribute_fragments() {
            let mut doc = Document::new();
            let id = doc.add_entity(Entity::BlockReference(BlockReference {
                name: "TB".to_string(),
                insert: Point2::new(0.0, 0.0),
                scale: Vector2::new(1.0, 1.0),
                rotation: 0.0,
                attributes: vec![Attribute {
                    tag: "CODE".to_string(),
                    text: "1234567-JG001-001".to_string(),
                    insert: Point2::new(5.0, 6.0),
                    height: 2.5,
                    rotation: 0.0,
                    layer: "ATTR".to_string(),
                }],
                layer: "0".to_string(),
            }));
            let entity = doc.entity(id).expect("block reference");
            let fragments = entity.text_fragments(id);
            assert_eq!(fragments.len(), 1);
            assert_eq!(fragments[0].content, "1234567-JG001-001");
            assert_eq!(fragments[0].position, Point2::new(5.0, 6.0));
            assert!(doc.layers().any(|layer| layer.name == "ATTR"));
        }

        fn frame_block(doc: &mut Document) {
            doc.add_block(Block {
                name: "A3FRAME".to_string(),
                base: Point2::new(10.0, 10.0),
                entities: vec![Entity::Polyline(Polyline {
                    vertices: vec![
                        PolylineVertex::new(Point2::new(10.0, 10.0)),
                        PolylineVertex::new(Point2::new(430.0, 10.0)),
                        PolylineVertex::new(Point2::new(430.0, 307.0)),
                        PolylineVertex::new(Point2::new(10.0, 307.0)),
                    ],
                    is_closed: true,
                    layer: "FRAME".to_string(),
                })],
            });
        }

        fn reference(name: &str, insert: Point2, scale: f64, rotation: f64) -> Entity {
            Entity::BlockReference(BlockReference {
                name: name.to_string(),
                insert,
                scale: Vector2::new(scale, scale),
                rotation,
                attributes: Vec::new(),
                layer: "0".to_string(),
            })
        }

        #[test]
        fn block_reference_extent_covers_transformed_block() {
            let mut doc = Document::new();
            frame_block(&mut doc);
            let scaled = doc.add_entity(reference("A3FRAME", Point2::new(5000.0, 5000.0), 2.0, 0.0));
            let turned = doc.add_entity(reference("A3FRAME", Point2::new(0.0, 0.0), 1.0, FRAC_PI_2));
            let missing = doc.add_entity(reference("NOWHERE", Point2::new(7.0, 8.0), 1.0, 0.0));

            let bounds = doc.entity_bounds(scaled).expect("scaled bounds");
            assert_eq!(bounds.min(), Point2::new(5000.0, 5000.0));
            assert_eq!(bounds.max(), Point2::new(5840.0, 5594.0));

            let bounds = doc.entity_bounds(turned).expect("rotated bounds");
            assert!((bounds.min().x() + 297.0).abs() < 1e-9);
            assert!(bounds.min().y().abs() < 1e-9);
            assert!(bounds.max().x().abs() < 1e-9);
            assert!((bounds.max().y() - 420.0).abs() < 1e-9);

            let bounds = doc.entity_bounds(missing).expect("insert point");
            assert_eq!(bounds.min(), bounds.max());
            assert_eq!(doc.entity_extents().len(), 3);
        }

        #[test]
        fn nested_blocks_explode_into_world_linework() {
            let mut doc = Document::new();
            frame_block(&mut doc);
            doc.add_block(Block {
                name: "SHEET".to_string(),
                base: Point2::new(0.0, 0.0),
                entities: vec![reference("A3FRAME", Point2::new(100.0, 0.0), 1.0, 0.0)],
            });
            let Entity::BlockReference(outer) = reference("SHEET", Point2::new(1000.0, 0.0), 1.0, 0.0)
            else {
                unreachable!()
            };
            let exploded = doc.explode_linework(&outer);
            assert_eq!(exploded.len(), 1);
            let Entity::Polyline(polyline) = &exploded[0] else {
                panic!("unexpected entity {:?}", exploded[0]);
            };
            let points: Vec<Point2> = polyline.points().collect();
            assert_eq!(points[0], Point2::new(1100.0, 0.0));
            assert_eq!(points[2], Point2::new(1520.0, 297.0));
        }

        #[test]
        fn self_referencing_block_terminates() {
            let mut doc = Document::new();
            doc.add_block(Block {
                name: "LOOP".to_string(),
                base: Point2::new(0.0, 0.0),
                entities: vec![
                    Entity::Line(Line {
                        start: Point2::new(0.0, 0.0),
                        end: Point2::new(1.0, 1.0),
                        layer: "0".to_string(),
                    }),
                    reference("LOOP", Point2::new(1.0, 0.0), 1.0, 0.0),
                ],
            });
            let id = doc.add_entity(reference("LOOP", Point2::new(0.0, 0.0), 1.0, 0.0));
            assert!(doc.entity_bounds(id).is_some());
        }

        #[test]
        fn adopted_blocks_follow_nested_references() {
            let mut source = Document::new();
            frame_block(&mut source);
            source.add_block(Block {
                name: "SHEET".to_string(),
                base: Point2::new(0.0, 0.0),
                entities: vec![reference("A3FRAME", Point2::new(0.0, 0.0), 1.0, 0.0)],
            });
            source.add_block(Block {
                name: "UNUSED".to_string(),
                base: Point2::new(0.0, 0.0),
                entities: Vec::new(),
            });

            let mut part = Document::new();
            part.add_entity(reference("SHEET", Point2::new(0.0, 0.0), 1.0, 0.0));
            part.adopt_blocks_from(&source);
            let names: Vec<&str> = part.blocks().map(|block| block.name.as_str()).collect();
            assert_eq!(names, vec!["A3FRAME", "SHEET"]);
            assert!(part.layers().any(|layer| layer.name == "FRAME"));
        }

        #[test]
        fn bounds_intersection_is_inclusive() {
            let a = Bounds2D::from_corners(Point2::new(0.0, 0.0), Point2::new(10.0, 10.0));
            let touching = Bounds2D::from_corners(Point2::new(10.0, 5.0), Point2::new(20.0, 6.0));
            let apart = Bounds2D::from_corners(Point2::new(10.5, 5.0), Point2::new(20.0, 6.0));
            assert!(a.intersects(&touching));
            assert!(!a.intersects(&apart));
            assert_eq!(a.axis_gaps(&apart), (0.5, 0.0));
            assert!(a.expanded(-6.0, 0.0).is_empty());
        }
    }
}
