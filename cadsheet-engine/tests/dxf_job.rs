use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use cadsheet_config::AppConfig;
use cadsheet_engine::model::{DocumentParams, JobStatus};
use cadsheet_engine::{DrawingInput, JobRunner};
use cadsheet_io::{write_dxf, DocumentLoader, DocumentSaver, DxfFacade};

fn default_config() -> AppConfig {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../config/default.toml");
    AppConfig::from_file(path).expect("default config loads")
}

/// 一张 A3 图纸：标题栏齐全，图框外另有一条直线。
fn a3_drawing() -> String {
    let mut out = String::new();
    let mut pair = |code: i32, value: &str| {
        writeln!(out, "{code}\n{value}").expect("write to string");
    };
    pair(0, "SECTION");
    pair(2, "ENTITIES");

    pair(0, "LWPOLYLINE");
    pair(8, "FRAME");
    pair(90, "4");
    pair(70, "1");
    for (x, y) in [(0.0, 0.0), (420.0, 0.0), (420.0, 297.0), (0.0, 297.0)] {
        pair(10, &x.to_string());
        pair(20, &y.to_string());
    }

    for (x1, x2) in [(20.0, 200.0), (1000.0, 1100.0)] {
        pair(0, "LINE");
        pair(8, "GEO");
        pair(10, &x1.to_string());
        pair(20, "150");
        pair(11, &x2.to_string());
        pair(21, "150");
    }

    let texts = [
        (270.0, 55.0, "CNPE"),
        (375.0, 25.0, "1234567-JG001-001"),
        (285.0, 25.0, "DOC.NO GFAB1234XY567890ABC"),
        (360.0, 45.0, "总平面布置图"),
        (405.0, 15.0, "共1张 第1张"),
        (255.0, 5.0, "A"),
        (285.0, 5.0, "CFC"),
        (315.0, 5.0, "2024.01"),
    ];
    for (x, y, content) in texts {
        pair(0, "TEXT");
        pair(8, "TB");
        pair(10, &x.to_string());
        pair(20, &y.to_string());
        pair(40, "2.5");
        pair(1, content);
    }

    pair(0, "ENDSEC");
    pair(0, "EOF");
    out
}

fn write_input(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, a3_drawing()).expect("write drawing");
    path
}

#[test]
fn a3_drawing_is_extracted_and_split() {
    let config = default_config();
    let dir = tempfile::tempdir().expect("temp dir");
    let input = DrawingInput::from_path(write_input(dir.path(), "site-plan.dxf"));

    let runner = JobRunner::new(config.spec.clone(), 2).expect("runner");
    let job = runner.run("job", &[input], &DxfFacade::new(), &DocumentParams::default());

    assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.ledger);
    let drawing = &job.drawings[0];
    assert_eq!(drawing.name, "site-plan");
    let frame = &drawing.frames[0];
    assert_eq!(frame.variant, "CNPE_A3");
    let fields = frame.titleblock.as_ref().expect("titleblock");
    assert_eq!(fields.internal_code.as_deref(), Some("1234567-JG001-001"));
    assert_eq!(fields.external_code.as_deref(), Some("GFAB1234XY567890ABC"));
    assert_eq!(fields.title_primary.as_deref(), Some("总平面布置图"));
    assert_eq!((fields.page_index, fields.page_total), (Some(1), Some(1)));
    assert_eq!(fields.status.as_deref(), Some("CFC"));

    let split = &drawing.splits[0];
    assert_eq!(split.name, "1234567-JG001-001");
    assert_eq!(split.document.len(), 10);

    let out = dir.path().join("out").join(format!("{}.dxf", split.name));
    DxfFacade::new().save(&split.document, &out).expect("save split");
    let reloaded = DxfFacade::new().load(&out).expect("reload split");
    assert_eq!(reloaded.len(), split.document.len());
    assert_eq!(reloaded.bounds(), split.document.bounds());

    assert_eq!(job.album.cover_internal_code.as_deref(), Some("1234567-JG001-FM"));
}

#[test]
fn running_twice_yields_identical_split_output() {
    let config = default_config();
    let dir = tempfile::tempdir().expect("temp dir");
    let input = DrawingInput::from_path(write_input(dir.path(), "plan.dxf"));
    let runner = JobRunner::new(config.spec, 3).expect("runner");

    let render = || {
        let job = runner.run("job", std::slice::from_ref(&input), &DxfFacade::new(), &DocumentParams::default());
        job.drawings[0]
            .splits
            .iter()
            .map(|split| write_dxf(&split.document))
            .collect::<Vec<_>>()
    };
    assert_eq!(render(), render());
}
