use cadclean_engine::command::{CommandRequest, CommandResponse};
use cadclean_engine::scene::Scene;
use tracing::{info, warn};

use crate::session::DocumentSource;

pub fn print_source(source: &DocumentSource) {
    println!("CAD 图纸清理");
    match source {
        DocumentSource::Json(path) => println!("已从 JSON 加载文档：{}", path.display()),
        DocumentSource::Demo => println!("未提供输入文档，使用内置示例图纸"),
    }
}

/// 打印命令执行记录，返回是否有命令失败。
pub fn print_command_log(log: &[(CommandRequest, CommandResponse)]) -> bool {
    let mut failed = false;
    for (request, response) in log {
        let message = response.message.as_deref().unwrap_or("");
        if response.success {
            println!("[命令] {} {message}", request.name);
        } else {
            warn!(command = %request.name, "{message}");
            println!("[失败] {} {message}", request.name);
            failed = true;
        }
    }
    failed
}

pub fn print_summary(scene: &Scene) {
    let document = scene.document();
    let entity_count = document.entities().count();
    let definition_count = document.definitions().count();
    let resource_count = document.resources().count();
    info!(entity_count, definition_count, resource_count, "处理后文档统计");

    println!("处理后文档：");
    println!("  - 图元 {entity_count} 个");
    println!("  - 块定义 {definition_count} 个");
    println!("  - 外部资源 {resource_count} 个");

    if let Some(bounds) = scene.selection_bounds() {
        println!(
            "选中范围=({:.2}, {:.2}) - ({:.2}, {:.2})，共 {} 个图元",
            bounds.min().x(),
            bounds.min().y(),
            bounds.max().x(),
            bounds.max().y(),
            scene.selection_len()
        );
    }

    println!("剩余块定义：");
    for definition in document.definitions() {
        let kind = if definition.is_external {
            "外部参照"
        } else if definition.is_layout {
            "布局"
        } else {
            "块"
        };
        let count = document.entities_in(definition.id).count();
        println!("  - {} ({kind}, {count} 个图元)", definition.name);
    }

    println!("剩余外部资源：");
    for resource in document.resources() {
        println!("  - {} ({:?}, {})", resource.name, resource.kind, resource.source_path);
    }
}
