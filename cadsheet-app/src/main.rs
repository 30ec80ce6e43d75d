use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use cadsheet_config::AppConfig;
use cadsheet_engine::model::{DocumentParams, FrameId, Job, JobStatus};
use cadsheet_engine::{DrawingInput, JobRunner};
use cadsheet_io::{DocumentSaver, DxfFacade};
use clap::Parser;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use walkdir::WalkDir;

/// 识别 DXF 图纸中的图框与标题栏，按图框拆分并输出 JSON 报告。
#[derive(Debug, Parser)]
#[command(name = "cadsheet", version, about)]
struct Cli {
    /// DXF 文件或包含 DXF 的目录
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// 配置文件；缺省时依次尝试 CADSHEET_CONFIG 与 ./config/default.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// 输出目录
    #[arg(long, short, default_value = "out")]
    out: PathBuf,

    /// 作业 ID；缺省时由输入文件内容计算
    #[arg(long)]
    job_id: Option<String>,

    /// 覆盖 pipeline.concurrency
    #[arg(long)]
    concurrency: Option<usize>,

    /// 只识别与抽取，不写出子图
    #[arg(long)]
    no_split: bool,

    /// 报告路径，默认 `<out>/report.json`
    #[arg(long)]
    report: Option<PathBuf>,

    /// 文档参数（JSON），用于封面、目录字段
    #[arg(long)]
    params: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct OutputFile {
    drawing: String,
    frame: FrameId,
    #[serde(skip_serializing_if = "Option::is_none")]
    sheet_set: Option<usize>,
    path: PathBuf,
    entities: usize,
    sha256: String,
}

#[derive(Debug, Serialize)]
struct Report<'a> {
    job: &'a Job,
    outputs: Vec<OutputFile>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(JobStatus::Failed) => ExitCode::from(2),
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "作业执行失败");
            eprintln!("错误：{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<JobStatus> {
    let config = load_configuration(cli.config.as_deref())?;
    init_logging(&config);

    let files = collect_inputs(&cli.inputs)?;
    let inputs = drawing_inputs(&files);
    let job_id = match cli.job_id {
        Some(id) => id,
        None => derive_job_id(&files)?,
    };
    let params = match &cli.params {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("读取文档参数失败：{}", path.display()))?;
            serde_json::from_str::<DocumentParams>(&raw)
                .with_context(|| format!("解析文档参数失败：{}", path.display()))?
        }
        None => DocumentParams::default(),
    };

    let concurrency = cli.concurrency.unwrap_or(config.pipeline.concurrency);
    let runner = JobRunner::new(config.spec, concurrency)
        .context("初始化作业执行器失败")?
        .with_split(!cli.no_split);
    info!(job = %job_id, drawings = inputs.len(), concurrency, "启动 cadsheet 作业");

    let job = runner.run(job_id, &inputs, &DxfFacade::new(), &params);
    let outputs = write_splits(&job, &cli.out)?;

    let report_path = cli.report.unwrap_or_else(|| cli.out.join("report.json"));
    if let Some(parent) = report_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("创建报告目录失败：{}", parent.display()))?;
    }
    let report = Report {
        job: &job,
        outputs,
    };
    let json = serde_json::to_string_pretty(&report).context("序列化报告失败")?;
    fs::write(&report_path, json)
        .with_context(|| format!("写出报告失败：{}", report_path.display()))?;

    println!(
        "job {}: {} ({} 个子图，{} 条记录) -> {}",
        job.id,
        job.status.as_str(),
        report.outputs.len(),
        job.ledger.len(),
        report_path.display()
    );
    Ok(job.status)
}

fn load_configuration(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("加载配置失败：{}", path.display())),
        None => AppConfig::discover().context("加载默认配置失败"),
    }
}

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_new(config.logging.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    // 已初始化时忽略
    let _ = subscriber.try_init();
}

/// 展开目录，收集扩展名为 `.dxf`（不区分大小写）的文件，排序去重。
fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            for entry in WalkDir::new(input).sort_by_file_name() {
                let entry = entry.with_context(|| format!("遍历目录失败：{}", input.display()))?;
                let is_dxf = entry
                    .path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dxf"));
                if entry.file_type().is_file() && is_dxf {
                    files.push(entry.into_path());
                }
            }
        } else if input.is_file() {
            files.push(input.clone());
        } else {
            bail!("输入不存在：{}", input.display());
        }
    }
    files.sort();
    files.dedup();
    if files.is_empty() {
        bail!("没有找到 DXF 文件");
    }
    Ok(files)
}

/// 同名图纸追加序号，避免输出目录冲突。
fn drawing_inputs(files: &[PathBuf]) -> Vec<DrawingInput> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    files
        .iter()
        .map(|path| {
            let mut input = DrawingInput::from_path(path.clone());
            let count = seen.entry(input.name.clone()).or_default();
            *count += 1;
            if *count > 1 {
                input.name = format!("{}-{}", input.name, count);
            }
            input
        })
        .collect()
}

fn derive_job_id(files: &[PathBuf]) -> Result<String> {
    let mut hasher = Sha256::new();
    for file in files {
        let bytes = fs::read(file).with_context(|| format!("读取输入失败：{}", file.display()))?;
        hasher.update(file.to_string_lossy().as_bytes());
        hasher.update(Sha256::digest(&bytes));
    }
    let digest = format!("{:x}", hasher.finalize());
    Ok(format!("job-{}", &digest[..12]))
}

fn write_splits(job: &Job, out: &Path) -> Result<Vec<OutputFile>> {
    let saver = DxfFacade::new();
    let mut outputs = Vec::new();
    for drawing in &job.drawings {
        for split in &drawing.splits {
            let path = out.join(&drawing.name).join(format!("{}.dxf", split.name));
            saver
                .save(&split.document, &path)
                .with_context(|| format!("写出子图失败：{}", path.display()))?;
            let bytes = fs::read(&path).with_context(|| format!("读取子图失败：{}", path.display()))?;
            outputs.push(OutputFile {
                drawing: drawing.name.clone(),
                frame: split.frame,
                sheet_set: split.sheet_set,
                path,
                entities: split.document.len(),
                sha256: format!("{:x}", Sha256::digest(&bytes)),
            });
        }
    }
    Ok(outputs)
}
