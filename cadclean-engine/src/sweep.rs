//! 保留集清理：删除容器中保留集以外的全部实体，裁剪、专业隔离与最终清理都建立在它之上。

use std::collections::{BTreeMap, BTreeSet};

use cadclean_core::document::{DefinitionId, EntityId};
use cadclean_core::errors::DocumentError;
use cadclean_core::geometry::Bounds2D;
use cadclean_core::graph::SceneGraph;
use tracing::{debug, info, warn};

use crate::detect::{self, Candidate, DetectorSettings};
use crate::errors::EngineError;
use crate::normalize::{self, NormalizeReport};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub erased: usize,
    pub failed: usize,
    /// 临时解锁后重新锁定的图层数。
    pub relocked_layers: usize,
}

/// 删除 `container` 中不在 `retain` 内的实体。
///
/// 锁定图层只在删除其上实体期间解锁，随后无论成败都恢复锁定。
/// 单个实体删除失败记为 `failed` 并继续。
pub fn keep_only<G>(
    graph: &mut G,
    container: DefinitionId,
    retain: &BTreeSet<EntityId>,
) -> Result<SweepReport, EngineError>
where
    G: SceneGraph + ?Sized,
{
    if graph.definition(container).is_none() {
        return Err(EngineError::ContainerNotFound(container.get()));
    }

    let mut doomed: BTreeMap<String, Vec<EntityId>> = BTreeMap::new();
    for id in graph.entity_ids(container) {
        if retain.contains(&id) {
            continue;
        }
        if let Some(entity) = graph.entity(id) {
            doomed
                .entry(entity.layer_name().to_string())
                .or_default()
                .push(id);
        }
    }

    let mut report = SweepReport::default();
    for (layer, ids) in doomed {
        let locked = graph.layer(&layer).is_some_and(|layer| layer.is_locked);
        if locked {
            if let Err(err) = graph.set_layer_locked(&layer, false) {
                warn!(layer = %layer, error = %err, "无法解锁图层，跳过其上的实体");
                report.failed += ids.len();
                continue;
            }
        }
        for id in ids {
            if graph.is_erased(id) {
                continue;
            }
            match graph.erase(id) {
                Ok(()) => report.erased += 1,
                Err(err) => {
                    warn!(entity = id.get(), layer = %layer, error = %err, "删除实体失败");
                    report.failed += 1;
                }
            }
        }
        if locked {
            graph.set_layer_locked(&layer, true)?;
            report.relocked_layers += 1;
        }
    }

    debug!(
        container = container.get(),
        retained = retain.len(),
        erased = report.erased,
        failed = report.failed,
        "保留集清理完成"
    );
    Ok(report)
}

/// 删除单个实体；所在图层锁定时临时解锁。
pub fn erase_unlocked<G>(graph: &mut G, id: EntityId) -> Result<(), DocumentError>
where
    G: SceneGraph + ?Sized,
{
    let layer = graph
        .entity(id)
        .map(|entity| entity.layer_name().to_string())
        .ok_or(DocumentError::EntityNotFound(id.get()))?;
    let locked = graph.layer(&layer).is_some_and(|layer| layer.is_locked);
    if !locked {
        return graph.erase(id);
    }
    graph.set_layer_locked(&layer, false)?;
    let result = graph.erase(id);
    graph.set_layer_locked(&layer, true)?;
    result
}

/// 只保留与区域相交的实体。
pub fn crop_to_region<G>(
    graph: &mut G,
    container: DefinitionId,
    region: &Bounds2D,
) -> Result<SweepReport, EngineError>
where
    G: SceneGraph + ?Sized,
{
    let retain = detect::region_members(graph, container, region);
    keep_only(graph, container, &retain)
}

/// 只保留图层名以任一专业前缀开头（不区分大小写）的实体。
pub fn isolate_layers<G>(
    graph: &mut G,
    container: DefinitionId,
    prefixes: &[String],
) -> Result<SweepReport, EngineError>
where
    G: SceneGraph + ?Sized,
{
    let prefixes: Vec<String> = prefixes
        .iter()
        .map(|prefix| prefix.trim().to_uppercase())
        .filter(|prefix| !prefix.is_empty())
        .collect();
    if prefixes.is_empty() {
        return Err(EngineError::EmptyDisciplineFilter);
    }
    let retain: BTreeSet<EntityId> = graph
        .entity_ids(container)
        .into_iter()
        .filter(|id| {
            graph.entity(*id).is_some_and(|entity| {
                let layer = entity.layer_name().to_uppercase();
                prefixes.iter().any(|prefix| layer.starts_with(prefix.as_str()))
            })
        })
        .collect();
    info!(prefixes = ?prefixes, retained = retain.len(), "按专业隔离图层");
    keep_only(graph, container, &retain)
}

/// 图框保留集：构成候选的实体加上与候选框相交的实体。
pub fn title_block_keep_set<G>(
    graph: &G,
    container: DefinitionId,
    candidate: &Candidate,
) -> BTreeSet<EntityId>
where
    G: SceneGraph + ?Sized,
{
    let mut retain = detect::region_members(graph, container, &candidate.bounds());
    retain.extend(candidate.boundary.iter().copied());
    retain
}

#[derive(Debug, Clone)]
pub struct CropOutcome {
    pub normalize: NormalizeReport,
    pub candidate: Candidate,
    pub sweep: SweepReport,
}

/// 扁平化、识别图框并删除图框以外的实体。未识别到图框时不做删除，返回 `None`。
pub fn crop_to_title_block<G>(
    graph: &mut G,
    container: DefinitionId,
    settings: &DetectorSettings,
) -> Result<Option<CropOutcome>, EngineError>
where
    G: SceneGraph + ?Sized,
{
    let flattened = normalize::normalize(graph, container)?;
    let Some(candidate) = detect::detect_title_block(graph, container, settings) else {
        warn!(container = container.get(), "未识别到图框，保留全部实体");
        return Ok(None);
    };
    let retain = title_block_keep_set(graph, container, &candidate);
    let sweep = keep_only(graph, container, &retain)?;
    info!(
        strategy = %candidate.strategy,
        score = candidate.score,
        erased = sweep.erased,
        "已裁剪到图框"
    );
    Ok(Some(CropOutcome {
        normalize: flattened,
        candidate,
        sweep,
    }))
}
