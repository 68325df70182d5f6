use std::fs;
use std::path::{Path, PathBuf};

use cadclean_core::document::{Document, Entity};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum IoError {
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
    #[error("failed to decode {path:?}: {source}")]
    DecodeError {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode document: {0}")]
    EncodeError(#[source] serde_json::Error),
    #[error("invalid document structure: {0}")]
    InvalidDocument(String),
}

pub trait DocumentLoader {
    fn load(&self, path: &Path) -> Result<Document, IoError>;
}

pub trait DocumentSaver {
    fn save(&self, document: &Document, path: &Path) -> Result<(), IoError>;
}

/// 以 JSON 快照读写文档，供命令行批处理使用。
#[derive(Debug, Clone, Copy)]
pub struct JsonFacade {
    pretty: bool,
}

impl JsonFacade {
    pub fn new() -> Self {
        Self { pretty: true }
    }

    pub fn compact() -> Self {
        Self { pretty: false }
    }

    pub fn decode(&self, data: &str, path: &Path) -> Result<Document, IoError> {
        let document: Document =
            serde_json::from_str(data).map_err(|source| IoError::DecodeError {
                path: path.to_path_buf(),
                source,
            })?;
        validate(&document)?;
        Ok(document)
    }

    pub fn encode(&self, document: &Document) -> Result<String, IoError> {
        let encoded = if self.pretty {
            serde_json::to_string_pretty(document)
        } else {
            serde_json::to_string(document)
        };
        encoded.map_err(IoError::EncodeError)
    }
}

impl Default for JsonFacade {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentLoader for JsonFacade {
    fn load(&self, path: &Path) -> Result<Document, IoError> {
        let data = fs::read_to_string(path).map_err(|source| IoError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let document = self.decode(&data, path)?;
        info!(
            path = %path.display(),
            entities = document.entities().count(),
            definitions = document.definitions().count(),
            resources = document.resources().count(),
            "加载文档快照"
        );
        Ok(document)
    }
}

impl DocumentSaver for JsonFacade {
    fn save(&self, document: &Document, path: &Path) -> Result<(), IoError> {
        let data = self.encode(document)?;
        fs::write(path, data).map_err(|source| IoError::WriteError {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "写出文档快照");
        Ok(())
    }
}

/// 校验反序列化得到的文档：实体归属与交叉引用必须指向存在的定义和资源。
pub fn validate(document: &Document) -> Result<(), IoError> {
    for definition in document.definitions() {
        for id in &definition.entities {
            let record = document.record(*id).ok_or_else(|| {
                IoError::InvalidDocument(format!(
                    "definition {:?} lists unknown entity {}",
                    definition.name,
                    id.get()
                ))
            })?;
            if record.owner != definition.id {
                return Err(IoError::InvalidDocument(format!(
                    "entity {} is owned by definition {} but listed in {:?}",
                    id.get(),
                    record.owner.get(),
                    definition.name
                )));
            }
        }
    }

    let live = document
        .definitions()
        .flat_map(|definition| document.entities_in(definition.id));
    for (id, entity) in live {
        if let Entity::BlockReference(reference) = entity {
            if document.definition_by_id(reference.definition).is_none() {
                return Err(IoError::InvalidDocument(format!(
                    "block reference {} targets missing definition {}",
                    id.get(),
                    reference.definition.get()
                )));
            }
        }
        if let Some(resource) = entity.resource() {
            if !document.resources().any(|candidate| candidate.id == resource) {
                return Err(IoError::InvalidDocument(format!(
                    "entity {} references missing resource {}",
                    id.get(),
                    resource.get()
                )));
            }
        }
    }
    Ok(())
}
