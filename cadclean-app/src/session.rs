use std::path::{Path, PathBuf};

use cadclean_engine::errors::EngineError;
use cadclean_engine::scene::Scene;
use cadclean_io::{DocumentLoader, IoError, JsonFacade};
use thiserror::Error;
use tracing::{info, warn};

/// 文档来源，便于在报告中呈现加载信息。
#[derive(Debug, Clone)]
pub enum DocumentSource {
    Json(PathBuf),
    Demo,
}

#[derive(Debug)]
pub struct LoadedScene {
    pub scene: Scene,
    pub source: DocumentSource,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Load(#[from] IoError),
    #[error("failed to build demo sheet: {0}")]
    Demo(#[from] EngineError),
}

/// 加载 `--input` 指定的 JSON 快照。
///
/// 只有要求演示或未指定输入时才使用内置示例图纸；指定的输入加载失败直接返回错误，
/// 以免把示例图纸的清理结果写到输出文件。
pub fn load_scene(input: Option<&Path>, demo: bool) -> Result<LoadedScene, SessionError> {
    let mut scene = Scene::new();
    match input {
        Some(path) if demo => {
            warn!(path = %path.display(), "同时指定了 --demo，忽略输入文档");
        }
        Some(path) => {
            let document = JsonFacade::new().load(path)?;
            info!(path = %path.display(), "从 JSON 加载文档成功");
            scene.load_document(document);
            return Ok(LoadedScene {
                scene,
                source: DocumentSource::Json(path.to_path_buf()),
            });
        }
        None => {}
    }

    scene.populate_demo_sheet()?;
    Ok(LoadedScene {
        scene,
        source: DocumentSource::Demo,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadclean_core::document::Document;
    use cadclean_core::geometry::Point2;
    use cadclean_io::DocumentSaver;

    #[test]
    fn missing_input_is_an_error_not_a_demo() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("does-not-exist.json");
        let err = load_scene(Some(&path), false).unwrap_err();
        assert!(matches!(err, SessionError::Load(IoError::ReadError { .. })));
    }

    #[test]
    fn malformed_input_is_an_error() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_scene(Some(&path), false).unwrap_err();
        assert!(matches!(err, SessionError::Load(IoError::DecodeError { .. })));
    }

    #[test]
    fn demo_is_used_without_input_or_on_request() {
        let loaded = load_scene(None, false).unwrap();
        assert!(matches!(loaded.source, DocumentSource::Demo));
        assert!(loaded.scene.document().resources().count() > 0);

        let loaded = load_scene(Some(Path::new("ignored.json")), true).unwrap();
        assert!(matches!(loaded.source, DocumentSource::Demo));
    }

    #[test]
    fn snapshot_is_loaded_when_present() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("scene.json");
        let mut document = Document::new();
        document.add_line(Point2::new(0.0, 0.0), Point2::new(3.0, 4.0), "A-WALL");
        JsonFacade::new().save(&document, &path).unwrap();

        let loaded = load_scene(Some(&path), false).unwrap();
        assert!(matches!(&loaded.source, DocumentSource::Json(found) if *found == path));
        assert_eq!(loaded.scene.document().entities().count(), 1);
    }
}
