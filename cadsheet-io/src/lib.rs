use std::fs;
use std::path::{Path, PathBuf};

use cadsheet_core::document::Document;
use thiserror::Error;
use tracing::debug;

mod reader;
mod text;
mod writer;

pub use reader::LoadStats;
pub use writer::write_dxf;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),
    #[error("failed to read file {path:?}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write file {path:?}: {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid document structure: {0}")]
    InvalidDocument(String),
}

pub trait DocumentLoader {
    fn load(&self, path: &Path) -> Result<Document, IoError>;

    /// 读取并附带统计信息；不产生统计的实现返回空统计。
    fn load_with_stats(&self, path: &Path) -> Result<(Document, LoadStats), IoError> {
        self.load(path).map(|document| (document, LoadStats::default()))
    }
}

pub trait DocumentSaver {
    fn save(&self, document: &Document, path: &Path) -> Result<(), IoError>;
}

/// ASCII DXF 的读写入口。
///
/// 读取时对未支持或格式有误的实体只计数并跳过；写出时按实体顺序生成确定性的文本，
/// 相同输入重复写出得到逐字节相同的文件。
#[derive(Debug, Default, Clone, Copy)]
pub struct DxfFacade;

impl DxfFacade {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_str(&self, source: &str) -> Result<(Document, LoadStats), IoError> {
        reader::parse_document(source).map_err(|err| match err {
            reader::DxfError::Unsupported { feature } => IoError::UnsupportedFeature(feature),
            reader::DxfError::Invalid { message } | reader::DxfError::Malformed { message } => {
                IoError::InvalidDocument(message)
            }
        })
    }
}

impl DocumentLoader for DxfFacade {
    fn load(&self, path: &Path) -> Result<Document, IoError> {
        self.load_with_stats(path).map(|(document, _)| document)
    }

    fn load_with_stats(&self, path: &Path) -> Result<(Document, LoadStats), IoError> {
        let bytes = fs::read(path).map_err(|source| IoError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        if bytes.starts_with(b"AutoCAD Binary DXF") {
            return Err(IoError::UnsupportedFeature(format!(
                "二进制 DXF 需先转换为 ASCII：{}",
                path.display()
            )));
        }
        let data = String::from_utf8_lossy(&bytes);
        let (document, stats) = self.parse_str(&data)?;
        debug!(
            path = %path.display(),
            entities = document.len(),
            skipped = stats.skipped_total(),
            malformed = stats.malformed_total(),
            "DXF 读取完成"
        );
        Ok((document, stats))
    }
}

impl DocumentSaver for DxfFacade {
    fn save(&self, document: &Document, path: &Path) -> Result<(), IoError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| IoError::WriteError {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, write_dxf(document)).map_err(|source| IoError::WriteError {
            path: path.to_path_buf(),
            source,
        })
    }
}
