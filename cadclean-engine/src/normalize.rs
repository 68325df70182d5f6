//! 块参照扁平化：把嵌套的块参照逐层炸开为基本图元，供几何分析使用。

use std::collections::HashSet;

use cadclean_core::document::{DefinitionId, Entity, EntityId};
use cadclean_core::graph::SceneGraph;
use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::sweep;

/// 最多执行的炸开轮数，防止自引用块无限展开。
pub const MAX_EXPLODE_PASSES: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    pub passes: usize,
    pub exploded: usize,
    pub skipped: usize,
    /// 达到轮数上限时仍有可炸开的参照。
    pub capped: bool,
}

/// 反复炸开容器中的块参照，直到某一轮没有可炸开的参照或达到轮数上限。
///
/// 外部参照、布局以及无法表达的参照（`can_explode` 为假）静默跳过，且不会再次尝试。
/// 炸开后的图元继承原参照的图层，原参照随后被删除；锁定图层临时解锁后恢复锁定。
pub fn normalize<G>(graph: &mut G, container: DefinitionId) -> Result<NormalizeReport, EngineError>
where
    G: SceneGraph + ?Sized,
{
    if graph.definition(container).is_none() {
        return Err(EngineError::ContainerNotFound(container.get()));
    }

    let mut report = NormalizeReport::default();
    let mut processed: HashSet<EntityId> = HashSet::new();

    for pass in 1..=MAX_EXPLODE_PASSES {
        report.passes = pass;
        let pending = pending_references(graph, container, &processed);
        let mut exploded_this_pass = 0;

        for id in pending {
            processed.insert(id);
            let Some(layer) = graph.entity(id).map(|entity| entity.layer_name().to_string()) else {
                continue;
            };
            if !graph.can_explode(id) {
                debug!(entity = id.get(), "块参照不可炸开，跳过");
                report.skipped += 1;
                continue;
            }
            let pieces = match graph.explode(id) {
                Ok(pieces) => pieces,
                Err(err) => {
                    warn!(entity = id.get(), error = %err, "炸开块参照失败");
                    report.skipped += 1;
                    continue;
                }
            };
            if let Err(err) = sweep::erase_unlocked(graph, id) {
                warn!(entity = id.get(), error = %err, "删除原块参照失败，保留参照");
                report.skipped += 1;
                continue;
            }
            for mut piece in pieces {
                piece.set_layer(layer.as_str());
                graph.append_entity(container, piece)?;
            }
            exploded_this_pass += 1;
        }

        report.exploded += exploded_this_pass;
        if exploded_this_pass == 0 {
            break;
        }
    }

    report.capped = pending_references(graph, container, &processed)
        .into_iter()
        .any(|id| graph.can_explode(id));
    if report.capped {
        warn!(
            container = container.get(),
            passes = report.passes,
            "达到炸开轮数上限，仍有嵌套块参照"
        );
    }
    info!(
        container = container.get(),
        passes = report.passes,
        exploded = report.exploded,
        skipped = report.skipped,
        "块参照扁平化完成"
    );
    Ok(report)
}

fn pending_references<G>(
    graph: &G,
    container: DefinitionId,
    processed: &HashSet<EntityId>,
) -> Vec<EntityId>
where
    G: SceneGraph + ?Sized,
{
    graph
        .entity_ids(container)
        .into_iter()
        .filter(|id| !processed.contains(id))
        .filter(|id| matches!(graph.entity(*id), Some(Entity::BlockReference(_))))
        .collect()
}
