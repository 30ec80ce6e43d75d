use cadsheet_core::document::{Document, Entity};

/// 组码值最长 255 字节，长文字按字符切成多段。
const CHUNK_CHARS: usize = 240;

/// 把文档序列化为 ASCII DXF 文本。
///
/// 输出只依赖实体顺序与数值本身：图层与块按名称排序，浮点数使用最短往返表示，
/// 坐标原样写出。
pub fn write_dxf(document: &Document) -> String {
    let mut out = DxfOutput::default();

    out.pair(0, "SECTION");
    out.pair(2, "HEADER");
    out.pair(9, "$ACADVER");
    out.pair(1, "AC1021");
    out.pair(9, "$INSUNITS");
    out.pair(70, 4);
    out.pair(0, "ENDSEC");

    let mut layers: Vec<&str> = document.layers().map(|layer| layer.name.as_str()).collect();
    layers.sort_unstable();
    out.pair(0, "SECTION");
    out.pair(2, "TABLES");
    out.pair(0, "TABLE");
    out.pair(2, "LAYER");
    out.pair(70, layers.len());
    for layer in layers {
        out.pair(0, "LAYER");
        out.pair(2, layer);
        out.pair(70, 0);
        out.pair(62, 7);
        out.pair(6, "CONTINUOUS");
    }
    out.pair(0, "ENDTAB");
    out.pair(0, "ENDSEC");

    if document.blocks().next().is_some() {
        out.pair(0, "SECTION");
        out.pair(2, "BLOCKS");
        for block in document.blocks() {
            out.pair(0, "BLOCK");
            out.pair(8, "0");
            out.pair(2, &block.name);
            out.pair(70, 0);
            out.point(10, block.base.x(), block.base.y());
            out.pair(3, &block.name);
            for entity in &block.entities {
                write_entity(&mut out, entity);
            }
            out.pair(0, "ENDBLK");
            out.pair(8, "0");
        }
        out.pair(0, "ENDSEC");
    }

    out.pair(0, "SECTION");
    out.pair(2, "ENTITIES");
    for (_, entity) in document.entities() {
        write_entity(&mut out, entity);
    }
    out.pair(0, "ENDSEC");
    out.pair(0, "EOF");
    out.buffer
}

fn write_entity(out: &mut DxfOutput, entity: &Entity) {
    match entity {
        Entity::Line(line) => {
            out.pair(0, "LINE");
            out.pair(8, &line.layer);
            out.point(10, line.start.x(), line.start.y());
            out.point(11, line.end.x(), line.end.y());
        }
        Entity::Circle(circle) => {
            out.pair(0, "CIRCLE");
            out.pair(8, &circle.layer);
            out.point(10, circle.center.x(), circle.center.y());
            out.pair(40, circle.radius);
        }
        Entity::Arc(arc) => {
            out.pair(0, "ARC");
            out.pair(8, &arc.layer);
            out.point(10, arc.center.x(), arc.center.y());
            out.pair(40, arc.radius);
            out.pair(50, arc.start_angle.to_degrees());
            out.pair(51, arc.end_angle.to_degrees());
        }
        Entity::Polyline(polyline) => {
            out.pair(0, "LWPOLYLINE");
            out.pair(8, &polyline.layer);
            out.pair(90, polyline.vertices.len());
            out.pair(70, if polyline.is_closed { 1 } else { 0 });
            for vertex in &polyline.vertices {
                out.point(10, vertex.position.x(), vertex.position.y());
                if vertex.bulge != 0.0 {
                    out.pair(42, vertex.bulge);
                }
            }
        }
        Entity::Text(text) => {
            out.pair(0, "TEXT");
            out.pair(8, &text.layer);
            out.point(10, text.insert.x(), text.insert.y());
            out.pair(40, text.height);
            for line in text.content.split('\n') {
                out.pair(1, line);
            }
            if text.rotation != 0.0 {
                out.pair(50, text.rotation.to_degrees());
            }
        }
        Entity::MText(mtext) => {
            out.pair(0, "MTEXT");
            out.pair(8, &mtext.layer);
            out.point(10, mtext.insert.x(), mtext.insert.y());
            out.pair(40, mtext.height);
            if let Some(width) = mtext.reference_width {
                out.pair(41, width);
            }
            out.pair(71, mtext.attachment_point);
            if let Some(style) = &mtext.style {
                out.pair(7, style);
            }
            out.point(11, mtext.direction.x(), mtext.direction.y());
            let encoded = encode_mtext(&mtext.content);
            let chars: Vec<char> = encoded.chars().collect();
            let chunks: Vec<String> = chars
                .chunks(CHUNK_CHARS)
                .map(|chunk| chunk.iter().collect())
                .collect();
            match chunks.split_last() {
                Some((last, leading)) => {
                    for chunk in leading {
                        out.pair(3, chunk);
                    }
                    out.pair(1, last);
                }
                None => out.pair(1, ""),
            }
        }
        Entity::BlockReference(reference) => {
            out.pair(0, "INSERT");
            out.pair(8, &reference.layer);
            if !reference.attributes.is_empty() {
                out.pair(66, 1);
            }
            out.pair(2, &reference.name);
            out.point(10, reference.insert.x(), reference.insert.y());
            out.pair(41, reference.scale.x());
            out.pair(42, reference.scale.y());
            if reference.rotation != 0.0 {
                out.pair(50, reference.rotation.to_degrees());
            }
            if reference.attributes.is_empty() {
                return;
            }
            for attribute in &reference.attributes {
                out.pair(0, "ATTRIB");
                out.pair(8, &attribute.layer);
                out.point(10, attribute.insert.x(), attribute.insert.y());
                out.pair(40, attribute.height);
                out.pair(1, attribute.text.replace('\n', " "));
                out.pair(2, &attribute.tag);
                if attribute.rotation != 0.0 {
                    out.pair(50, attribute.rotation.to_degrees());
                }
            }
            out.pair(0, "SEQEND");
            out.pair(8, &reference.layer);
        }
    }
}

fn encode_mtext(content: &str) -> String {
    let mut encoded = String::with_capacity(content.len());
    for ch in content.chars() {
        match ch {
            '\n' => encoded.push_str("\\P"),
            '\\' => encoded.push_str("\\\\"),
            '{' => encoded.push_str("\\{"),
            '}' => encoded.push_str("\\}"),
            other => encoded.push(other),
        }
    }
    encoded
}

#[derive(Default)]
struct DxfOutput {
    buffer: String,
}

impl DxfOutput {
    fn pair(&mut self, code: i32, value: impl DxfValue) {
        self.buffer.push_str(&format!("{code:>3}\n"));
        value.append_to(&mut self.buffer);
        self.buffer.push('\n');
    }

    fn point(&mut self, code: i32, x: f64, y: f64) {
        self.pair(code, x);
        self.pair(code + 10, y);
        self.pair(code + 20, 0.0);
    }
}

trait DxfValue {
    fn append_to(&self, buffer: &mut String);
}

impl DxfValue for &str {
    fn append_to(&self, buffer: &mut String) {
        buffer.push_str(self);
    }
}

impl DxfValue for &String {
    fn append_to(&self, buffer: &mut String) {
        buffer.push_str(self);
    }
}

impl DxfValue for String {
    fn append_to(&self, buffer: &mut String) {
        buffer.push_str(self);
    }
}

impl DxfValue for f64 {
    fn append_to(&self, buffer: &mut String) {
        // 最短往返表示，且 -0.0 统一写成 0
        let value = if *self == 0.0 { 0.0 } else { *self };
        let text = format!("{value:?}");
        buffer.push_str(&text);
    }
}

macro_rules! integer_value {
    ($($ty:ty),*) => {
        $(impl DxfValue for $ty {
            fn append_to(&self, buffer: &mut String) {
                buffer.push_str(&self.to_string());
            }
        })*
    };
}

integer_value!(i16, i32, usize);

#[cfg(test)]
mod tests {
    use super::*;
    use cadsheet_core::geometry::Point2;

    #[test]
    fn float_values_round_trip_exactly() {
        let mut out = DxfOutput::default();
        out.pair(10, 0.1_f64 + 0.2_f64);
        out.pair(20, -0.0_f64);
        assert_eq!(out.buffer, " 10\n0.30000000000000004\n 20\n0.0\n");
    }

    #[test]
    fn mtext_newlines_become_paragraph_codes() {
        assert_eq!(encode_mtext("第一行\n{x}"), "第一行\\P\\{x\\}");
    }

    #[test]
    fn identical_documents_serialize_identically() {
        let build = || {
            let mut doc = Document::new();
            doc.add_line(Point2::new(0.0, 0.0), Point2::new(1.5, 2.25), "B");
            doc.add_text(Point2::new(3.0, 4.0), "标题", 2.5, 0.0, "A");
            doc
        };
        assert_eq!(write_dxf(&build()), write_dxf(&build()));
        let text = write_dxf(&build());
        let layer_a = text.find("\n  2\nA\n").expect("layer A");
        let layer_b = text.find("\n  2\nB\n").expect("layer B");
        assert!(layer_a < layer_b);
    }
}
