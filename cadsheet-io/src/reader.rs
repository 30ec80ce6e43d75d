use std::collections::BTreeMap;
use std::convert::TryFrom;

use cadsheet_core::{
    document::{
        Arc, Attribute, Block, BlockReference, Circle, Document, Entity, Line, MText, Polyline,
        PolylineVertex, Text,
    },
    geometry::{Point2, Vector2},
};
use serde::Serialize;
use tracing::debug;

use crate::text::{decode_inline_text, decode_mtext_content};

/// 文字高度缺省值，与常见 CAD 软件的默认字高一致。
const DEFAULT_TEXT_HEIGHT: f64 = 2.5;

/// 一次读取的统计信息。
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    /// 未支持而被跳过的实体类型及其数量。
    pub skipped: BTreeMap<String, usize>,
    /// 组码缺失或数值无法解析而被跳过的实体类型及其数量。
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub malformed: BTreeMap<String, usize>,
}

impl LoadStats {
    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }

    pub fn malformed_total(&self) -> usize {
        self.malformed.values().sum()
    }

    fn skip(&mut self, kind: &str) {
        *self.skipped.entry(kind.to_string()).or_default() += 1;
    }

    fn reject(&mut self, kind: &str) {
        *self.malformed.entry(kind.to_string()).or_default() += 1;
    }
}

#[derive(Debug)]
pub(crate) enum DxfError {
    Unsupported { feature: String },
    /// 文件结构损坏，整张图纸无法继续读取。
    Invalid { message: String },
    /// 单个实体的内容有误，跳过该实体即可继续。
    Malformed { message: String },
}

impl DxfError {
    fn unsupported(feature: impl Into<String>) -> Self {
        Self::Unsupported {
            feature: feature.into(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }
}

pub(crate) fn parse_document(source: &str) -> Result<(Document, LoadStats), DxfError> {
    DxfParser::new(source).parse()
}

struct DxfParser<'a> {
    reader: DxfReader<'a>,
    stats: LoadStats,
}

impl<'a> DxfParser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            reader: DxfReader::new(source),
            stats: LoadStats::default(),
        }
    }

    fn parse(mut self) -> Result<(Document, LoadStats), DxfError> {
        let mut document = Document::new();
        let mut saw_entities = false;
        while let Some((code, value)) = self.reader.next_pair()? {
            if code == 999 {
                continue;
            }
            if code != 0 {
                return Err(DxfError::invalid(format!(
                    "意外的组码 {code}（期望 0 表示 SECTION/EOF）"
                )));
            }
            match value.trim() {
                "SECTION" => {
                    let (name_code, name) = self
                        .reader
                        .next_pair()?
                        .ok_or_else(|| DxfError::invalid("SECTION 缺少名称（组码 2）"))?;
                    if name_code != 2 {
                        return Err(DxfError::invalid(format!(
                            "SECTION 名称使用了组码 {name_code}（期望 2）"
                        )));
                    }
                    match name.trim() {
                        "ENTITIES" => {
                            saw_entities = true;
                            for entity in self.parse_entity_list("ENDSEC")? {
                                document.add_entity(entity);
                            }
                        }
                        "BLOCKS" => self.parse_blocks(&mut document)?,
                        _ => self.skip_section()?,
                    }
                }
                "EOF" => break,
                unexpected => {
                    return Err(DxfError::invalid(format!(
                        "意外的标记 {unexpected}，期望 SECTION 或 EOF"
                    )));
                }
            }
        }
        if !saw_entities {
            return Err(DxfError::invalid("文件中没有 ENTITIES 段"));
        }
        Ok((document, self.stats))
    }

    fn skip_section(&mut self) -> Result<(), DxfError> {
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) if value.trim() == "ENDSEC" => break,
                Some(_) => continue,
                None => {
                    return Err(DxfError::invalid("SECTION 未找到 ENDSEC 终止标记"));
                }
            }
        }
        Ok(())
    }

    /// 读取实体直到 `terminator`（ENDSEC 或 ENDBLK）。终止标记本身被消费。
    fn parse_entity_list(&mut self, terminator: &str) -> Result<Vec<Entity>, DxfError> {
        let mut entities = Vec::new();
        loop {
            let (code, value) = match self.reader.next_pair()? {
                Some(pair) => pair,
                None => {
                    return Err(DxfError::invalid(format!(
                        "缺少 {terminator}，实体列表提前结束"
                    )));
                }
            };
            if code != 0 {
                return Err(DxfError::invalid(format!(
                    "实体列表遇到组码 {code}（期望 0 表示实体起始）"
                )));
            }

            match value.trim() {
                kind if kind == terminator => {
                    self.skip_entity_body()?;
                    break;
                }
                "SEQEND" => {
                    self.skip_entity_body()?;
                }
                "POLYLINE" => match self.parse_polyline_entity() {
                    Ok(Some(polyline)) => entities.push(polyline),
                    Ok(None) => {}
                    Err(DxfError::Malformed { message }) => {
                        self.reject_sequence("POLYLINE", &message)?;
                    }
                    Err(err) => return Err(err),
                },
                kind => match self.parse_entity(kind) {
                    Ok(parsed) => entities.push(parsed),
                    Err(DxfError::Unsupported { feature }) => {
                        debug!(kind, feature = %feature, "跳过未支持的实体");
                        self.stats.skip(kind);
                        self.skip_entity_body()?;
                    }
                    Err(DxfError::Malformed { message }) if kind == "INSERT" => {
                        self.reject_sequence(kind, &message)?;
                    }
                    Err(DxfError::Malformed { message }) => {
                        debug!(kind, message = %message, "跳过格式有误的实体");
                        self.stats.reject(kind);
                        self.skip_entity_body()?;
                    }
                    Err(err) => return Err(err),
                },
            }
        }
        Ok(entities)
    }

    /// 丢弃格式有误的 POLYLINE / INSERT，连同其后的 VERTEX、ATTRIB 与 SEQEND。
    fn reject_sequence(&mut self, kind: &str, message: &str) -> Result<(), DxfError> {
        debug!(kind, message, "跳过格式有误的实体");
        self.stats.reject(kind);
        self.skip_entity_body()?;
        self.skip_sequence()
    }

    fn parse_blocks(&mut self, document: &mut Document) -> Result<(), DxfError> {
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => match value.trim() {
                    "ENDSEC" => break,
                    "BLOCK" => {
                        let header = self.parse_block_header();
                        let entities = self.parse_entity_list("ENDBLK")?;
                        match header {
                            Ok((name, base)) => document.add_block(Block {
                                name,
                                base,
                                entities,
                            }),
                            Err(DxfError::Malformed { message }) => {
                                debug!(message = %message, "跳过格式有误的块定义");
                                self.stats.reject("BLOCK");
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    other => {
                        return Err(DxfError::invalid(format!(
                            "BLOCKS 段遇到意外的标记 {other}（期望 BLOCK 或 ENDSEC）"
                        )));
                    }
                },
                Some((code, _)) => {
                    return Err(DxfError::invalid(format!("BLOCKS 段遇到意外组码 {code}")));
                }
                None => return Err(DxfError::invalid("BLOCKS 段未找到 ENDSEC 终止标记")),
            }
        }
        Ok(())
    }

    /// 块头只取块名与基点。出错时仍读完块头，保证随后的实体列表可以继续解析。
    fn parse_block_header(&mut self) -> Result<(String, Point2), DxfError> {
        let mut name = None;
        let mut base_x = None;
        let mut base_y = None;
        let mut failure = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value))?;
                    break;
                }
                Some((code, value)) => {
                    let parsed = match code {
                        2 => {
                            name = Some(value.trim().to_string());
                            Ok(())
                        }
                        10 => assign_coord(&mut base_x, &value, "BLOCK 基点 X（组码 10）"),
                        20 => assign_coord(&mut base_y, &value, "BLOCK 基点 Y（组码 20）"),
                        _ => Ok(()),
                    };
                    if let Err(err) = parsed {
                        failure.get_or_insert(err);
                    }
                }
                None => return Err(DxfError::invalid("BLOCK 未正确结束")),
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }
        let name = name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| DxfError::malformed("BLOCK 缺少块名（组码 2）"))?;
        Ok((name, Point2::new(base_x.unwrap_or(0.0), base_y.unwrap_or(0.0))))
    }

    fn parse_entity(&mut self, kind: &str) -> Result<Entity, DxfError> {
        match kind {
            "LINE" => self.parse_line(),
            "CIRCLE" => self.parse_circle(),
            "ARC" => self.parse_arc(),
            "LWPOLYLINE" => self.parse_lwpolyline(),
            "TEXT" => self.parse_text(),
            "MTEXT" => self.parse_mtext(),
            "INSERT" => self.parse_insert(),
            other => Err(DxfError::unsupported(format!("暂不支持的实体类型 {other}"))),
        }
    }

    fn parse_line(&mut self) -> Result<Entity, DxfError> {
        let mut layer = None;
        let mut start_x = None;
        let mut start_y = None;
        let mut end_x = None;
        let mut end_y = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value))?;
                    break;
                }
                Some((code, value)) => match code {
                    8 => layer = Some(value.trim().to_string()),
                    10 => assign_coord(&mut start_x, &value, "LINE 起点 X（组码 10）")?,
                    20 => assign_coord(&mut start_y, &value, "LINE 起点 Y（组码 20）")?,
                    11 => assign_coord(&mut end_x, &value, "LINE 终点 X（组码 11）")?,
                    21 => assign_coord(&mut end_y, &value, "LINE 终点 Y（组码 21）")?,
                    _ => {} // Z 坐标、颜色等不参与识别
                },
                None => return Err(DxfError::invalid("LINE 未正确结束")),
            }
        }

        let layer = layer.unwrap_or_else(|| "0".to_string());
        let sx = start_x.ok_or_else(|| DxfError::malformed("LINE 缺少起点 X（组码 10）"))?;
        let sy = start_y.ok_or_else(|| DxfError::malformed("LINE 缺少起点 Y（组码 20）"))?;
        let ex = end_x.ok_or_else(|| DxfError::malformed("LINE 缺少终点 X（组码 11）"))?;
        let ey = end_y.ok_or_else(|| DxfError::malformed("LINE 缺少终点 Y（组码 21）"))?;

        Ok(Entity::Line(Line {
            start: Point2::new(sx, sy),
            end: Point2::new(ex, ey),
            layer,
        }))
    }

    fn parse_circle(&mut self) -> Result<Entity, DxfError> {
        let mut layer = None;
        let mut center_x = None;
        let mut center_y = None;
        let mut radius = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value))?;
                    break;
                }
                Some((code, value)) => match code {
                    8 => layer = Some(value.trim().to_string()),
                    10 => assign_coord(&mut center_x, &value, "CIRCLE 圆心 X（组码 10）")?,
                    20 => assign_coord(&mut center_y, &value, "CIRCLE 圆心 Y（组码 20）")?,
                    40 => assign_coord(&mut radius, &value, "CIRCLE 半径（组码 40）")?,
                    _ => {}
                },
                None => return Err(DxfError::invalid("CIRCLE 未正确结束")),
            }
        }

        let layer = layer.unwrap_or_else(|| "0".to_string());
        let cx = center_x.ok_or_else(|| DxfError::malformed("CIRCLE 缺少圆心 X（组码 10）"))?;
        let cy = center_y.ok_or_else(|| DxfError::malformed("CIRCLE 缺少圆心 Y（组码 20）"))?;
        let radius = radius.ok_or_else(|| DxfError::malformed("CIRCLE 缺少半径（组码 40）"))?;

        Ok(Entity::Circle(Circle {
            center: Point2::new(cx, cy),
            radius,
            layer,
        }))
    }

    fn parse_arc(&mut self) -> Result<Entity, DxfError> {
        let mut layer = None;
        let mut center_x = None;
        let mut center_y = None;
        let mut radius = None;
        let mut start_angle = None;
        let mut end_angle = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value))?;
                    break;
                }
                Some((code, value)) => match code {
                    8 => layer = Some(value.trim().to_string()),
                    10 => assign_coord(&mut center_x, &value, "ARC 圆心 X（组码 10）")?,
                    20 => assign_coord(&mut center_y, &value, "ARC 圆心 Y（组码 20）")?,
                    40 => assign_coord(&mut radius, &value, "ARC 半径（组码 40）")?,
                    50 => assign_coord(&mut start_angle, &value, "ARC 起始角（组码 50）")?,
                    51 => assign_coord(&mut end_angle, &value, "ARC 终止角（组码 51）")?,
                    _ => {}
                },
                None => return Err(DxfError::invalid("ARC 未正确结束")),
            }
        }

        let layer = layer.unwrap_or_else(|| "0".to_string());
        let cx = center_x.ok_or_else(|| DxfError::malformed("ARC 缺少圆心 X（组码 10）"))?;
        let cy = center_y.ok_or_else(|| DxfError::malformed("ARC 缺少圆心 Y（组码 20）"))?;
        let radius = radius.ok_or_else(|| DxfError::malformed("ARC 缺少半径（组码 40）"))?;
        let start_angle =
            start_angle.ok_or_else(|| DxfError::malformed("ARC 缺少起始角（组码 50）"))?;
        let end_angle = end_angle.ok_or_else(|| DxfError::malformed("ARC 缺少终止角（组码 51）"))?;

        Ok(Entity::Arc(Arc {
            center: Point2::new(cx, cy),
            radius,
            start_angle: start_angle.to_radians(),
            end_angle: end_angle.to_radians(),
            layer,
        }))
    }

    fn parse_lwpolyline(&mut self) -> Result<Entity, DxfError> {
        let mut layer = None;
        let mut is_closed = false;
        let mut vertices: Vec<PolylineVertex> = Vec::new();
        let mut pending_x: Option<f64> = None;
        let mut pending_y: Option<f64> = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value))?;
                    break;
                }
                Some((code, value)) => match code {
                    8 => layer = Some(value.trim().to_string()),
                    70 => {
                        let flag = parse_i32(&value, "LWPOLYLINE 标志")?;
                        is_closed = flag & 0x01 == 0x01;
                    }
                    10 => {
                        let x = parse_f64(&value, "LWPOLYLINE 顶点 X")?;
                        if let Some(y) = pending_y.take() {
                            vertices.push(PolylineVertex::new(Point2::new(x, y)));
                        } else if pending_x.replace(x).is_some() {
                            return Err(DxfError::malformed(
                                "LWPOLYLINE 顶点缺少对应的 Y（组码 20）",
                            ));
                        }
                    }
                    20 => {
                        let y = parse_f64(&value, "LWPOLYLINE 顶点 Y")?;
                        if let Some(x) = pending_x.take() {
                            vertices.push(PolylineVertex::new(Point2::new(x, y)));
                        } else if pending_y.replace(y).is_some() {
                            return Err(DxfError::malformed(
                                "LWPOLYLINE 顶点缺少对应的 X（组码 10）",
                            ));
                        }
                    }
                    42 => {
                        let bulge = parse_f64(&value, "LWPOLYLINE 顶点 bulge")?;
                        match vertices.last_mut() {
                            Some(vertex) => vertex.bulge = bulge,
                            None => {
                                return Err(DxfError::malformed(
                                    "LWPOLYLINE 在定义首个顶点前遇到 bulge（组码 42）",
                                ));
                            }
                        }
                    }
                    _ => {}
                },
                None => return Err(DxfError::invalid("LWPOLYLINE 未正确结束")),
            }
        }

        if pending_x.is_some() || pending_y.is_some() {
            return Err(DxfError::malformed(
                "LWPOLYLINE 顶点坐标成对出现（组码 10/20），检测到不完整的顶点",
            ));
        }

        if vertices.is_empty() {
            return Err(DxfError::malformed("LWPOLYLINE 未解析到任何顶点"));
        }

        let layer = layer.unwrap_or_else(|| "0".to_string());
        Ok(Entity::Polyline(Polyline {
            vertices,
            is_closed,
            layer,
        }))
    }

    /// 旧式 POLYLINE：只接收二维折线，网格、多面体与三维折线整体跳过。
    fn parse_polyline_entity(&mut self) -> Result<Option<Entity>, DxfError> {
        let mut layer = None;
        let mut flags: i16 = 0;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value))?;
                    break;
                }
                Some((code, value)) => match code {
                    8 => layer = Some(value.trim().to_string()),
                    70 => flags = parse_i16(&value, "POLYLINE 标志（组码 70）")?,
                    _ => {}
                },
                None => return Err(DxfError::invalid("POLYLINE 未正确结束")),
            }
        }

        if flags & (0x08 | 0x10 | 0x40) != 0 {
            debug!(flags, "跳过三维 POLYLINE / 网格");
            self.stats.skip("POLYLINE");
            self.skip_sequence()?;
            return Ok(None);
        }

        let mut vertices = Vec::new();
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => match value.trim() {
                    "VERTEX" => {
                        if let Some(vertex) = self.parse_vertex()? {
                            vertices.push(vertex);
                        }
                    }
                    "SEQEND" => {
                        self.skip_entity_body()?;
                        break;
                    }
                    _ => {
                        self.reader.put_back((0, value))?;
                        break;
                    }
                },
                Some((code, _)) => {
                    return Err(DxfError::invalid(format!(
                        "POLYLINE 顶点序列出现意外组码 {code}"
                    )));
                }
                None => return Err(DxfError::invalid("POLYLINE 缺少 SEQEND")),
            }
        }

        if vertices.is_empty() {
            return Err(DxfError::malformed("POLYLINE 未解析到任何顶点"));
        }

        Ok(Some(Entity::Polyline(Polyline {
            vertices,
            is_closed: flags & 0x01 != 0,
            layer: layer.unwrap_or_else(|| "0".to_string()),
        })))
    }

    fn parse_vertex(&mut self) -> Result<Option<PolylineVertex>, DxfError> {
        let mut x = None;
        let mut y = None;
        let mut bulge = 0.0;
        let mut flags: i16 = 0;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value))?;
                    break;
                }
                Some((code, value)) => match code {
                    10 => assign_coord(&mut x, &value, "VERTEX X（组码 10）")?,
                    20 => assign_coord(&mut y, &value, "VERTEX Y（组码 20）")?,
                    42 => bulge = parse_f64(&value, "VERTEX bulge")?,
                    70 => flags = parse_i16(&value, "VERTEX 标志（组码 70）")?,
                    _ => {}
                },
                None => return Err(DxfError::invalid("VERTEX 未正确结束")),
            }
        }
        // 样条拟合的控制点不属于折线本身
        if flags & 0x10 != 0 {
            return Ok(None);
        }
        let x = x.ok_or_else(|| DxfError::malformed("VERTEX 缺少 X（组码 10）"))?;
        let y = y.ok_or_else(|| DxfError::malformed("VERTEX 缺少 Y（组码 20）"))?;
        Ok(Some(PolylineVertex::with_bulge(Point2::new(x, y), bulge)))
    }

    /// 跳过 VERTEX / ATTRIB 直到 SEQEND；遇到其他实体时放回。
    fn skip_sequence(&mut self) -> Result<(), DxfError> {
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => match value.trim() {
                    "VERTEX" | "ATTRIB" => self.skip_entity_body()?,
                    "SEQEND" => {
                        self.skip_entity_body()?;
                        break;
                    }
                    _ => {
                        self.reader.put_back((0, value))?;
                        break;
                    }
                },
                Some(_) => continue,
                None => break,
            }
        }
        Ok(())
    }

    fn parse_text(&mut self) -> Result<Entity, DxfError> {
        let mut layer = None;
        let mut insert_x = None;
        let mut insert_y = None;
        let mut height = None;
        let mut rotation_deg = 0.0;
        let mut text: Option<String> = None;
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value))?;
                    break;
                }
                Some((code, value)) => match code {
                    8 => layer = Some(value.trim().to_string()),
                    10 => assign_coord(&mut insert_x, &value, "TEXT 插入点 X（组码 10）")?,
                    20 => assign_coord(&mut insert_y, &value, "TEXT 插入点 Y（组码 20）")?,
                    40 => assign_coord(&mut height, &value, "TEXT 高度（组码 40）")?,
                    50 => rotation_deg = parse_f64(&value, "TEXT 旋转角")?,
                    1 => match text {
                        Some(ref mut existing) => {
                            existing.push('\n');
                            existing.push_str(&value);
                        }
                        None => text = Some(value),
                    },
                    _ => {} // 文字样式、对齐点等不参与抽取
                },
                None => return Err(DxfError::invalid("TEXT 未正确结束")),
            }
        }

        let layer = layer.unwrap_or_else(|| "0".to_string());
        let ix = insert_x.ok_or_else(|| DxfError::malformed("TEXT 缺少插入点 X（组码 10）"))?;
        let iy = insert_y.ok_or_else(|| DxfError::malformed("TEXT 缺少插入点 Y（组码 20）"))?;
        let height = height.unwrap_or(DEFAULT_TEXT_HEIGHT);
        let content = text.ok_or_else(|| DxfError::malformed("TEXT 缺少文本内容（组码 1）"))?;

        Ok(Entity::Text(Text {
            insert: Point2::new(ix, iy),
            content: decode_inline_text(&content),
            height,
            rotation: rotation_deg.to_radians(),
            layer,
        }))
    }

    fn parse_mtext(&mut self) -> Result<Entity, DxfError> {
        let mut layer = None;
        let mut insert_x = None;
        let mut insert_y = None;
        let mut height = None;
        let mut reference_width: Option<f64> = None;
        let mut direction_x: Option<f64> = None;
        let mut direction_y: Option<f64> = None;
        let mut rotation_deg: Option<f64> = None;
        let mut attachment_point: i16 = 1;
        let mut style: Option<String> = None;
        // 组码 3 是前置分块，组码 1 是最后一块
        let mut fragments: Vec<String> = Vec::new();

        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value))?;
                    break;
                }
                Some((code, value)) => match code {
                    8 => layer = Some(value.trim().to_string()),
                    10 => assign_coord(&mut insert_x, &value, "MTEXT 插入点 X（组码 10）")?,
                    20 => assign_coord(&mut insert_y, &value, "MTEXT 插入点 Y（组码 20）")?,
                    40 => assign_coord(&mut height, &value, "MTEXT 高度（组码 40）")?,
                    41 => {
                        let width = parse_f64(&value, "MTEXT 参考宽度")?;
                        reference_width = if width.abs() < f64::EPSILON {
                            None
                        } else {
                            Some(width)
                        };
                    }
                    11 => direction_x = Some(parse_f64(&value, "MTEXT 方向向量 X")?),
                    21 => direction_y = Some(parse_f64(&value, "MTEXT 方向向量 Y")?),
                    50 => rotation_deg = Some(parse_f64(&value, "MTEXT 旋转角")?),
                    71 => attachment_point = parse_i16(&value, "MTEXT 附着点 (组码 71)")?,
                    7 => style = Some(value.trim().to_string()),
                    1 | 3 => fragments.push(value),
                    _ => {}
                },
                None => return Err(DxfError::invalid("MTEXT 未正确结束")),
            }
        }

        let layer = layer.unwrap_or_else(|| "0".to_string());
        let ix = insert_x.ok_or_else(|| DxfError::malformed("MTEXT 缺少插入点 X（组码 10）"))?;
        let iy = insert_y.ok_or_else(|| DxfError::malformed("MTEXT 缺少插入点 Y（组码 20）"))?;
        let height = height.unwrap_or(DEFAULT_TEXT_HEIGHT);
        if fragments.is_empty() {
            return Err(DxfError::malformed("MTEXT 缺少内容（组码 1/3）"));
        }

        // 先拼接再解码，控制码可能跨越分块边界
        let decoded_text = decode_mtext_content(&fragments.concat());

        let direction = match (direction_x, direction_y) {
            (Some(x), Some(y)) if x.abs() >= f64::EPSILON || y.abs() >= f64::EPSILON => {
                Vector2::new(x, y)
            }
            _ => match rotation_deg {
                Some(rot) => {
                    let rad = rot.to_radians();
                    Vector2::new(rad.cos(), rad.sin())
                }
                None => Vector2::new(1.0, 0.0),
            },
        };

        Ok(Entity::MText(MText {
            insert: Point2::new(ix, iy),
            content: decoded_text,
            height,
            reference_width,
            direction,
            attachment_point,
            style,
            layer,
        }))
    }

    fn parse_insert(&mut self) -> Result<Entity, DxfError> {
        let mut layer = None;
        let mut name = None;
        let mut insert_x = None;
        let mut insert_y = None;
        let mut scale_x: Option<f64> = None;
        let mut scale_y: Option<f64> = None;
        let mut rotation_deg: f64 = 0.0;

        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value))?;
                    break;
                }
                Some((code, value)) => match code {
                    8 => layer = Some(value.trim().to_string()),
                    2 => {
                        if name.is_some() {
                            return Err(DxfError::malformed("INSERT 遇到重复的块名（组码 2）"));
                        }
                        name = Some(value.trim().to_string());
                    }
                    10 => assign_coord(&mut insert_x, &value, "INSERT 插入点 X（组码 10）")?,
                    20 => assign_coord(&mut insert_y, &value, "INSERT 插入点 Y（组码 20）")?,
                    41 => scale_x = Some(parse_f64(&value, "INSERT 缩放 X")?),
                    42 => scale_y = Some(parse_f64(&value, "INSERT 缩放 Y")?),
                    50 => rotation_deg = parse_f64(&value, "INSERT 旋转角")?,
                    _ => {}
                },
                None => return Err(DxfError::invalid("INSERT 未正确结束")),
            }
        }

        let layer = layer.unwrap_or_else(|| "0".to_string());
        let name = name.ok_or_else(|| DxfError::malformed("INSERT 缺少块名（组码 2）"))?;
        let ix = insert_x.ok_or_else(|| DxfError::malformed("INSERT 缺少插入点 X（组码 10）"))?;
        let iy = insert_y.ok_or_else(|| DxfError::malformed("INSERT 缺少插入点 Y（组码 20）"))?;
        let sx = scale_x.unwrap_or(1.0);
        let sy = scale_y.unwrap_or(sx);

        let mut attributes: Vec<Attribute> = Vec::new();
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => match value.trim() {
                    "ATTRIB" => attributes.push(self.parse_attrib()?),
                    "SEQEND" => {
                        self.skip_entity_body()?;
                        break;
                    }
                    _ => {
                        self.reader.put_back((0, value))?;
                        break;
                    }
                },
                Some((code, value)) => {
                    return Err(DxfError::invalid(format!(
                        "INSERT 属性段出现意外组码 {code} 值 {value}"
                    )));
                }
                None => break,
            }
        }

        Ok(Entity::BlockReference(BlockReference {
            name,
            insert: Point2::new(ix, iy),
            scale: Vector2::new(sx, sy),
            rotation: rotation_deg.to_radians(),
            attributes,
            layer,
        }))
    }

    fn parse_attrib(&mut self) -> Result<Attribute, DxfError> {
        let mut layer = None;
        let mut insert_x = None;
        let mut insert_y = None;
        let mut height: Option<f64> = None;
        let mut rotation_deg: f64 = 0.0;
        let mut text: Option<String> = None;
        let mut tag: Option<String> = None;

        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value))?;
                    break;
                }
                Some((code, value)) => match code {
                    8 => layer = Some(value.trim().to_string()),
                    10 => assign_coord(&mut insert_x, &value, "ATTRIB 插入点 X（组码 10）")?,
                    20 => assign_coord(&mut insert_y, &value, "ATTRIB 插入点 Y（组码 20）")?,
                    40 => height = Some(parse_f64(&value, "ATTRIB 高度")?),
                    50 => rotation_deg = parse_f64(&value, "ATTRIB 旋转角")?,
                    1 => text = Some(value),
                    2 => tag = Some(value.trim().to_string()),
                    _ => {}
                },
                None => return Err(DxfError::invalid("ATTRIB 未正确结束")),
            }
        }

        let layer = layer.unwrap_or_else(|| "0".to_string());
        let ix = insert_x.ok_or_else(|| DxfError::malformed("ATTRIB 缺少插入点 X（组码 10）"))?;
        let iy = insert_y.ok_or_else(|| DxfError::malformed("ATTRIB 缺少插入点 Y（组码 20）"))?;
        let tag = tag.ok_or_else(|| DxfError::malformed("ATTRIB 缺少标记（组码 2）"))?;

        Ok(Attribute {
            tag,
            text: decode_inline_text(text.as_deref().unwrap_or_default()),
            insert: Point2::new(ix, iy),
            height: height.unwrap_or(0.0),
            rotation: rotation_deg.to_radians(),
            layer,
        })
    }

    fn skip_entity_body(&mut self) -> Result<(), DxfError> {
        loop {
            match self.reader.next_pair()? {
                Some((0, value)) => {
                    self.reader.put_back((0, value))?;
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        Ok(())
    }
}

struct DxfReader<'a> {
    lines: std::str::Lines<'a>,
    buffer: Option<(i32, String)>,
    line_number: usize,
}

impl<'a> DxfReader<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            lines: source.trim_start_matches('\u{feff}').lines(),
            buffer: None,
            line_number: 0,
        }
    }

    fn next_pair(&mut self) -> Result<Option<(i32, String)>, DxfError> {
        if let Some(pair) = self.buffer.take() {
            return Ok(Some(pair));
        }

        // 允许文件末尾多出空行
        let code_line = loop {
            match self.lines.next() {
                Some(line) => {
                    self.line_number += 1;
                    if line.trim().is_empty() {
                        continue;
                    }
                    break line;
                }
                None => return Ok(None),
            }
        };

        let value_line = match self.lines.next() {
            Some(line) => {
                self.line_number += 1;
                line
            }
            None => {
                return Err(DxfError::invalid(format!(
                    "文件在第 {} 行结束，缺少与组码对应的值行",
                    self.line_number
                )));
            }
        };

        let code = code_line.trim().parse::<i32>().map_err(|_| {
            DxfError::invalid(format!(
                "第 {} 行的组码 \"{}\" 无法解析为整数",
                self.line_number - 1,
                code_line.trim()
            ))
        })?;
        let value = value_line.trim_end_matches('\r').to_string();
        Ok(Some((code, value)))
    }

    fn put_back(&mut self, pair: (i32, String)) -> Result<(), DxfError> {
        if self.buffer.is_some() {
            return Err(DxfError::invalid("内部错误：尝试多次回退 DXF pair"));
        }
        self.buffer = Some(pair);
        Ok(())
    }
}

fn assign_coord(slot: &mut Option<f64>, raw: &str, context: &str) -> Result<(), DxfError> {
    if slot.is_some() {
        return Err(DxfError::malformed(format!("{context} 出现重复值")));
    }
    *slot = Some(parse_f64(raw, context)?);
    Ok(())
}

fn parse_f64(raw: &str, context: &str) -> Result<f64, DxfError> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| DxfError::malformed(format!("{context} 解析失败（值：\"{raw}\"）")))
}

fn parse_i32(raw: &str, context: &str) -> Result<i32, DxfError> {
    raw.trim()
        .parse::<i32>()
        .map_err(|_| DxfError::malformed(format!("{context} 解析失败（值：\"{raw}\"）")))
}

fn parse_i16(raw: &str, context: &str) -> Result<i16, DxfError> {
    let value = parse_i32(raw, context)?;
    i16::try_from(value)
        .map_err(|_| DxfError::malformed(format!("{context} 超出 i16 范围（值：{value}）")))
}
