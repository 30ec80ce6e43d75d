use std::io::Write;
use std::path::PathBuf;

use cadsheet_core::document::Entity;
use cadsheet_io::{DocumentLoader, DocumentSaver, DxfFacade, IoError, write_dxf};

fn fixture(name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests/data");
    path.push(name);
    path
}

#[test]
fn load_mixed_entities_skips_unsupported_kinds() {
    let loader = DxfFacade::new();
    let (doc, stats) = loader
        .load_with_stats(&fixture("mixed_entities.dxf"))
        .expect("读取 DXF 失败");

    let kinds: Vec<&str> = doc.entities().map(|(_, entity)| entity.kind()).collect();
    assert_eq!(
        kinds,
        vec!["LINE", "LWPOLYLINE", "LWPOLYLINE", "TEXT", "MTEXT", "INSERT"]
    );
    assert_eq!(stats.skipped.get("HATCH"), Some(&1));
    assert_eq!(
        serde_json::to_value(&stats).expect("序列化统计失败"),
        serde_json::json!({ "skipped": { "HATCH": 1 } })
    );
}

#[test]
fn load_decodes_text_content() {
    let doc = DxfFacade::new()
        .load(&fixture("mixed_entities.dxf"))
        .expect("读取 DXF 失败");

    let texts: Vec<String> = doc
        .entities()
        .flat_map(|(id, entity)| entity.text_fragments(*id))
        .map(|fragment| fragment.content.to_string())
        .collect();
    assert_eq!(
        texts,
        vec![
            "中国±1".to_string(),
            "中国核电工程\n有限公司".to_string(),
            "1234567-JG001-001".to_string(),
        ]
    );
}

#[test]
fn old_style_polyline_keeps_closed_flag_and_bulge() {
    let doc = DxfFacade::new()
        .load(&fixture("mixed_entities.dxf"))
        .expect("读取 DXF 失败");
    let polyline = doc
        .entities()
        .filter_map(|(_, entity)| match entity {
            Entity::Polyline(polyline) if polyline.layer == "OUTLINE" => Some(polyline),
            _ => None,
        })
        .next()
        .expect("未找到 POLYLINE");
    assert!(polyline.is_closed);
    assert_eq!(polyline.vertices.len(), 2);
    assert!((polyline.vertices[0].bulge - 0.5).abs() < 1e-12);
}

#[test]
fn saved_document_reloads_with_identical_coordinates() {
    let loader = DxfFacade::new();
    let doc = loader
        .load(&fixture("mixed_entities.dxf"))
        .expect("读取 DXF 失败");

    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let path = dir.path().join("nested/out.dxf");
    loader.save(&doc, &path).expect("写出 DXF 失败");
    let reloaded = loader.load(&path).expect("重新读取失败");

    assert_eq!(reloaded.len(), doc.len());
    for ((_, a), (_, b)) in doc.entities().zip(reloaded.entities()) {
        assert_eq!(a.kind(), b.kind());
        assert_eq!(a.bounds(), b.bounds());
    }
    // 再写一次应逐字节一致
    assert_eq!(write_dxf(&doc), write_dxf(&reloaded));
}

#[test]
fn binary_dxf_is_reported_as_unsupported() {
    let mut file = tempfile::NamedTempFile::new().expect("创建临时文件失败");
    file.write_all(b"AutoCAD Binary DXF\r\n\x1a\x00")
        .expect("写入失败");
    match DxfFacade::new().load(file.path()) {
        Err(IoError::UnsupportedFeature(message)) => assert!(message.contains("二进制")),
        other => panic!("unexpected load result: {other:?}"),
    }
}

#[test]
fn truncated_file_is_invalid() {
    let source = "  0\nSECTION\n  2\nENTITIES\n  0\nLINE\n 10\n";
    match DxfFacade::new().parse_str(source) {
        Err(IoError::InvalidDocument(_)) => {}
        other => panic!("unexpected parse result: {other:?}"),
    }
}

/// 由组码/值对拼出 DXF 文本。
fn dxf(sections: &[(&str, &[(i32, &str)])]) -> String {
    let mut out = String::new();
    for (name, pairs) in sections {
        out.push_str(&format!("  0\nSECTION\n  2\n{name}\n"));
        for (code, value) in *pairs {
            out.push_str(&format!("{code:>3}\n{value}\n"));
        }
        out.push_str("  0\nENDSEC\n");
    }
    out.push_str("  0\nEOF\n");
    out
}

const FRAME: &[(i32, &str)] = &[
    (0, "LWPOLYLINE"),
    (8, "FRAME"),
    (90, "4"),
    (70, "1"),
    (10, "0.0"),
    (20, "0.0"),
    (10, "420.0"),
    (20, "0.0"),
    (10, "420.0"),
    (20, "297.0"),
    (10, "0.0"),
    (20, "297.0"),
];

#[test]
fn malformed_entities_are_skipped_without_losing_the_drawing() {
    let mut entities = FRAME.to_vec();
    entities.extend_from_slice(&[
        // 缺少字高：按默认字高读入
        (0, "TEXT"),
        (8, "TB"),
        (10, "400.0"),
        (20, "10.0"),
        (1, "CNPE"),
        // X 坐标无法解析：整条跳过
        (0, "TEXT"),
        (8, "TB"),
        (10, "abc"),
        (20, "10.0"),
        (40, "3.0"),
        (1, "坏数据"),
        // 起点 X 重复：整条跳过
        (0, "LINE"),
        (10, "1.0"),
        (10, "2.0"),
        (20, "0.0"),
        (11, "5.0"),
        (21, "0.0"),
        // 缺块名的 INSERT 连同属性一起跳过
        (0, "INSERT"),
        (66, "1"),
        (10, "0.0"),
        (20, "0.0"),
        (0, "ATTRIB"),
        (10, "1.0"),
        (20, "1.0"),
        (2, "TAG"),
        (1, "值"),
        (0, "SEQEND"),
        (0, "CIRCLE"),
        (10, "50.0"),
        (20, "50.0"),
        (40, "5.0"),
    ]);
    let source = dxf(&[("ENTITIES", entities.as_slice())]);
    let (doc, stats) = DxfFacade::new()
        .parse_str(&source)
        .expect("单个实体出错不应导致整图失败");

    let kinds: Vec<&str> = doc.entities().map(|(_, entity)| entity.kind()).collect();
    assert_eq!(kinds, vec!["LWPOLYLINE", "TEXT", "CIRCLE"]);
    match doc.entities().nth(1).map(|(_, entity)| entity) {
        Some(Entity::Text(text)) => {
            assert_eq!(text.content, "CNPE");
            assert_eq!(text.height, 2.5);
        }
        other => panic!("unexpected entity: {other:?}"),
    }
    assert_eq!(stats.malformed.get("TEXT"), Some(&1));
    assert_eq!(stats.malformed.get("LINE"), Some(&1));
    assert_eq!(stats.malformed.get("INSERT"), Some(&1));
    assert_eq!(stats.malformed_total(), 3);
    assert!(stats.skipped.is_empty());
}

#[test]
fn block_definitions_give_inserts_their_full_extent() {
    let mut block = vec![
        (0, "BLOCK"),
        (8, "0"),
        (2, "BIG"),
        (70, "0"),
        (10, "0.0"),
        (20, "0.0"),
        (3, "BIG"),
    ];
    block.extend_from_slice(FRAME);
    block.extend_from_slice(&[(0, "ENDBLK"), (8, "0")]);
    let entities = [
        (0, "INSERT"),
        (8, "0"),
        (2, "BIG"),
        (10, "5000.0"),
        (20, "5000.0"),
        (41, "2.0"),
        (42, "2.0"),
    ];
    let source = dxf(&[("BLOCKS", block.as_slice()), ("ENTITIES", &entities[..])]);
    let loader = DxfFacade::new();
    let (doc, _) = loader.parse_str(&source).expect("读取 DXF 失败");

    let big = doc.block("BIG").expect("块定义");
    assert_eq!(big.entities.len(), 1);
    let (id, _) = doc.entities().next().expect("INSERT");
    let bounds = doc.entity_bounds(*id).expect("INSERT 范围");
    assert_eq!(bounds.min().x(), 5000.0);
    assert_eq!(bounds.max().x(), 5840.0);
    assert_eq!(bounds.max().y(), 5594.0);

    let reloaded = loader.parse_str(&write_dxf(&doc)).expect("重新读取失败").0;
    assert_eq!(reloaded.block("BIG").map(|b| b.entities.len()), Some(1));
    assert_eq!(reloaded.entity_bounds(*id), Some(bounds));
}
