//! 外部资源生命周期流水线：预清理、绑定拆离、清除定义三个阶段。
//!
//! 每个阶段是一次完整事务，失败即回滚；阶段之间由调用方调度，流水线只返回下一阶段。

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cadclean_core::document::{Definition, DefinitionId, Entity, ResourceId};
use cadclean_core::graph::SceneGraph;
use tracing::{debug, error, info, warn};

use crate::detect::{self, Candidate, DetectorSettings};
use crate::errors::{EngineError, PipelineError};
use crate::normalize;
use crate::sweep;

pub const DEFAULT_DENY_LIST: &[&str] = &[
    "KEYPLAN",
    "LOGO",
    "NORTH_ARROW",
    "STAMP",
    "QR_CODE",
    "CONSULTANT_LOGO",
];
pub const DEFAULT_PROTECTED_PATTERNS: &[&str] = &["TITLE", "TBLK", "TTLB", "BORDER"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    #[default]
    Idle,
    PreClean,
    BindAndDetach,
    PurgeDefs,
}

impl PipelineStage {
    /// 当前阶段完成后应调度的阶段。
    pub fn next(self) -> Option<PipelineStage> {
        match self {
            PipelineStage::Idle => Some(PipelineStage::PreClean),
            PipelineStage::PreClean => Some(PipelineStage::BindAndDetach),
            PipelineStage::BindAndDetach => Some(PipelineStage::PurgeDefs),
            PipelineStage::PurgeDefs => None,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Idle => "idle",
            PipelineStage::PreClean => "pre-clean",
            PipelineStage::BindAndDetach => "bind-and-detach",
            PipelineStage::PurgeDefs => "purge-defs",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContinuationFlags {
    pub awaiting_bind: bool,
    pub awaiting_purge: bool,
}

/// 跨阶段共享的唯一状态。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineState {
    /// 绑定前的块定义快照，用于找出绑定新建的定义。
    pub snapshot: BTreeSet<DefinitionId>,
    pub purge_list: BTreeSet<ResourceId>,
    pub flags: ContinuationFlags,
}

impl PipelineState {
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty() && self.purge_list.is_empty() && self.flags == ContinuationFlags::default()
    }

    /// 取出当前状态，原处留下空状态。
    pub fn take(&mut self) -> PipelineState {
        std::mem::take(self)
    }

    pub fn clear(&mut self) {
        *self = PipelineState::default();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// 预清理阶段按名称（不区分大小写）删除的块定义与资源。
    pub deny_list: Vec<String>,
    /// 名称或路径包含这些片段的外部参照视为图框，不拆离。
    pub protected_patterns: Vec<String>,
    pub detector: DetectorSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            deny_list: DEFAULT_DENY_LIST.iter().map(|s| s.to_string()).collect(),
            protected_patterns: DEFAULT_PROTECTED_PATTERNS.iter().map(|s| s.to_string()).collect(),
            detector: DetectorSettings::default(),
        }
    }
}

impl PipelineSettings {
    pub fn is_protected(&self, definition: &Definition) -> bool {
        let name = definition.name.to_uppercase();
        let path = definition
            .source_path
            .as_deref()
            .map(str::to_uppercase)
            .unwrap_or_default();
        self.protected_patterns.iter().any(|pattern| {
            let pattern = pattern.to_uppercase();
            !pattern.is_empty() && (name.contains(&pattern) || path.contains(&pattern))
        })
    }
}

/// 单个阶段的统计。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSummary {
    pub erased: usize,
    pub detached: usize,
    pub purged: usize,
    pub failures: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage: PipelineStage,
    pub next: Option<PipelineStage>,
    pub summary: StageSummary,
    /// 预清理阶段识别到的图框。
    pub candidate: Option<Candidate>,
}

enum StageFailure {
    Cancelled,
    Engine(EngineError),
}

impl From<EngineError> for StageFailure {
    fn from(err: EngineError) -> Self {
        StageFailure::Engine(err)
    }
}

/// 流水线控制器，持有唯一的 [`PipelineState`]。
#[derive(Debug, Default)]
pub struct ResourcePipeline {
    settings: PipelineSettings,
    state: PipelineState,
    stage: PipelineStage,
    cancel: Arc<AtomicBool>,
}

impl ResourcePipeline {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    #[inline]
    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    #[inline]
    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    #[inline]
    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// 取消句柄；置位后当前阶段在下一个资源操作前中止并回滚。
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// 开始新一轮流水线。残留的状态会被强制清空。
    pub fn begin(&mut self) {
        if !self.state.is_empty() || self.stage != PipelineStage::Idle {
            warn!(stage = %self.stage, "上一轮流水线状态未清空，强制重置");
            self.reset();
        }
        self.cancel.store(false, Ordering::SeqCst);
        self.stage = PipelineStage::PreClean;
        debug!("流水线已开始");
    }

    /// 清空状态并回到空闲。
    pub fn reset(&mut self) {
        let _ = self.state.take();
        self.stage = PipelineStage::Idle;
    }

    pub fn run_stage1<G>(&mut self, graph: &mut G) -> Result<StageOutcome, PipelineError>
    where
        G: SceneGraph + ?Sized,
    {
        self.run_stage(graph, PipelineStage::PreClean, Self::pre_clean)
    }

    pub fn run_stage2<G>(&mut self, graph: &mut G) -> Result<StageOutcome, PipelineError>
    where
        G: SceneGraph + ?Sized,
    {
        self.run_stage(graph, PipelineStage::BindAndDetach, Self::bind_and_detach)
    }

    pub fn run_stage3<G>(&mut self, graph: &mut G) -> Result<StageOutcome, PipelineError>
    where
        G: SceneGraph + ?Sized,
    {
        self.run_stage(graph, PipelineStage::PurgeDefs, Self::purge_definitions)
    }

    /// 依次执行三个阶段，并在第一、二阶段之间调用协作方的绑定操作。
    pub fn run_to_completion<G>(&mut self, graph: &mut G) -> Result<Vec<StageOutcome>, PipelineError>
    where
        G: SceneGraph + ?Sized,
    {
        self.begin();
        let mut outcomes = vec![self.run_stage1(graph)?];
        self.bind_external(graph)?;
        outcomes.push(self.run_stage2(graph)?);
        outcomes.push(self.run_stage3(graph)?);
        Ok(outcomes)
    }

    /// 协作方绑定外部参照。只能在第一阶段之后调用，失败时回滚并清空状态。
    pub fn bind_external<G>(&mut self, graph: &mut G) -> Result<Vec<DefinitionId>, PipelineError>
    where
        G: SceneGraph + ?Sized,
    {
        self.expect_stage(PipelineStage::BindAndDetach)?;
        let checkpoint = graph.checkpoint();
        match graph.bind_external_definitions() {
            Ok(created) => {
                info!(created = created.len(), "外部参照绑定完成");
                Ok(created)
            }
            Err(err) => {
                graph.rollback(checkpoint);
                error!(error = %err, "外部参照绑定失败，流水线已重置");
                self.reset();
                Err(PipelineError::Fatal {
                    stage: PipelineStage::BindAndDetach,
                    source: err.into(),
                })
            }
        }
    }

    fn expect_stage(&mut self, requested: PipelineStage) -> Result<(), PipelineError> {
        if self.stage == requested {
            return Ok(());
        }
        let expected = self.stage;
        warn!(expected = %expected, found = %requested, "阶段调用顺序错误，流水线已重置");
        self.reset();
        Err(PipelineError::OutOfOrder {
            expected,
            found: requested,
        })
    }

    fn run_stage<G>(
        &mut self,
        graph: &mut G,
        stage: PipelineStage,
        body: fn(&mut Self, &mut G) -> Result<StageOutcome, StageFailure>,
    ) -> Result<StageOutcome, PipelineError>
    where
        G: SceneGraph + ?Sized,
    {
        self.expect_stage(stage)?;
        let checkpoint = graph.checkpoint();
        match body(self, graph) {
            Ok(outcome) => {
                self.stage = outcome.next.unwrap_or(PipelineStage::Idle);
                let summary = &outcome.summary;
                info!(
                    stage = %stage,
                    erased = summary.erased,
                    detached = summary.detached,
                    purged = summary.purged,
                    failures = summary.failures,
                    skipped = summary.skipped,
                    "阶段完成"
                );
                Ok(outcome)
            }
            Err(StageFailure::Cancelled) => {
                graph.rollback(checkpoint);
                warn!(stage = %stage, "阶段已取消，修改已回滚");
                self.reset();
                Err(PipelineError::Cancelled(stage))
            }
            Err(StageFailure::Engine(source)) => {
                graph.rollback(checkpoint);
                error!(stage = %stage, error = %source, "阶段失败，修改已回滚");
                self.reset();
                Err(PipelineError::Fatal { stage, source })
            }
        }
    }

    fn check_cancelled(&self) -> Result<(), StageFailure> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(StageFailure::Cancelled)
        } else {
            Ok(())
        }
    }

    fn pre_clean<G>(&mut self, graph: &mut G) -> Result<StageOutcome, StageFailure>
    where
        G: SceneGraph + ?Sized,
    {
        let mut summary = StageSummary::default();
        let deny_list = self.settings.deny_list.clone();
        for name in &deny_list {
            self.check_cancelled()?;
            let definitions: Vec<DefinitionId> = graph
                .find_definitions(name)
                .into_iter()
                .filter(|id| graph.definition(*id).is_some_and(|d| !d.is_layout))
                .collect();
            let resources: Vec<ResourceId> = graph
                .resource_ids()
                .into_iter()
                .filter(|id| {
                    graph
                        .resource(*id)
                        .is_some_and(|resource| resource.name.eq_ignore_ascii_case(name))
                })
                .collect();
            match (definitions.as_slice(), resources.as_slice()) {
                ([], []) => continue,
                ([definition], []) => {
                    retire_definition(graph, *definition, &mut summary);
                }
                ([], [resource]) => {
                    if release_resource(graph, *resource, &mut summary) {
                        self.state.purge_list.insert(*resource);
                    }
                }
                _ => {
                    warn!(
                        name = %name,
                        definitions = definitions.len(),
                        resources = resources.len(),
                        "名称对应多个对象，跳过"
                    );
                    summary.skipped += 1;
                }
            }
        }

        let model = graph.model_space();
        normalize::normalize(graph, model)?;
        self.check_cancelled()?;
        let candidate = detect::detect_title_block(graph, model, &self.settings.detector);
        match &candidate {
            Some(candidate) => {
                let retain = sweep::title_block_keep_set(graph, model, candidate);
                let report = sweep::keep_only(graph, model, &retain)?;
                summary.erased += report.erased;
                summary.failures += report.failed;
            }
            None => warn!("未识别到图框，保留全部图元"),
        }

        self.state.snapshot = graph.definition_ids().into_iter().collect();
        self.state.flags.awaiting_bind = true;
        Ok(StageOutcome {
            stage: PipelineStage::PreClean,
            next: PipelineStage::PreClean.next(),
            summary,
            candidate,
        })
    }

    fn bind_and_detach<G>(&mut self, graph: &mut G) -> Result<StageOutcome, StageFailure>
    where
        G: SceneGraph + ?Sized,
    {
        let mut summary = StageSummary::default();
        self.state.flags.awaiting_bind = false;

        let created: Vec<DefinitionId> = graph
            .definition_ids()
            .into_iter()
            .filter(|id| !self.state.snapshot.contains(id))
            .collect();
        debug!(created = created.len(), "绑定新建的块定义");
        for definition in created {
            for id in graph.entity_ids(definition) {
                self.check_cancelled()?;
                let Some(Entity::RasterImage(image)) = graph.entity(id) else {
                    continue;
                };
                let resource = image.resource;
                self.state.purge_list.insert(resource);
                match sweep::erase_unlocked(graph, id) {
                    Ok(()) => summary.erased += 1,
                    Err(err) => {
                        warn!(entity = id.get(), error = %err, "删除嵌入图像失败");
                        summary.failures += 1;
                    }
                }
            }
        }

        self.state.purge_list.retain(|resource| {
            let references = graph.resource_references(*resource).len();
            if references > 0 {
                warn!(resource = resource.get(), references, "资源仍被引用，移出清除列表");
            }
            references == 0
        });

        for definition in graph.definition_ids() {
            self.check_cancelled()?;
            let Some(target) = graph.definition(definition) else {
                continue;
            };
            if !target.is_external {
                continue;
            }
            if self.settings.is_protected(target) {
                debug!(definition = %target.name, "图框外部参照受保护，不拆离");
                summary.skipped += 1;
                continue;
            }
            retire_definition(graph, definition, &mut summary);
        }

        self.state.flags.awaiting_purge = true;
        Ok(StageOutcome {
            stage: PipelineStage::BindAndDetach,
            next: PipelineStage::BindAndDetach.next(),
            summary,
            candidate: None,
        })
    }

    fn purge_definitions<G>(&mut self, graph: &mut G) -> Result<StageOutcome, StageFailure>
    where
        G: SceneGraph + ?Sized,
    {
        let mut summary = StageSummary::default();
        let purge_list = std::mem::take(&mut self.state.purge_list);
        for resource in purge_list {
            self.check_cancelled()?;
            if graph.resource(resource).is_none() {
                debug!(resource = resource.get(), "资源已删除，跳过");
                summary.skipped += 1;
                continue;
            }
            let references = graph.resource_references(resource).len();
            if references > 0 {
                warn!(resource = resource.get(), references, "资源仍被引用，不予删除");
                summary.skipped += 1;
                continue;
            }
            for key in graph.dictionary_entries(resource) {
                if let Err(err) = graph.remove_dictionary_entry(&key) {
                    warn!(dictionary = %key.dictionary, entry = %key.entry, error = %err, "移除字典项失败");
                    summary.failures += 1;
                }
            }
            match graph.erase_resource(resource) {
                Ok(()) => summary.purged += 1,
                Err(err) => {
                    warn!(resource = resource.get(), error = %err, "删除资源定义失败");
                    summary.failures += 1;
                }
            }
        }
        self.state.clear();
        Ok(StageOutcome {
            stage: PipelineStage::PurgeDefs,
            next: PipelineStage::PurgeDefs.next(),
            summary,
            candidate: None,
        })
    }
}

/// 先删除全部参照，再拆离（外部）或删除（本地）定义。仍有参照未删除时不动定义。
fn retire_definition<G>(graph: &mut G, definition: DefinitionId, summary: &mut StageSummary) -> bool
where
    G: SceneGraph + ?Sized,
{
    let mut clean = true;
    for reference in graph.references_to(definition) {
        match sweep::erase_unlocked(graph, reference) {
            Ok(()) => summary.erased += 1,
            Err(err) => {
                warn!(entity = reference.get(), error = %err, "删除块参照失败");
                summary.failures += 1;
                clean = false;
            }
        }
    }
    if !clean {
        return false;
    }
    let is_external = graph
        .definition(definition)
        .is_some_and(|target| target.is_external);
    let result = if is_external {
        graph.detach_definition(definition)
    } else {
        graph.erase_definition(definition)
    };
    match result {
        Ok(()) => {
            summary.detached += 1;
            true
        }
        Err(err) => {
            warn!(definition = definition.get(), error = %err, "移除块定义失败");
            summary.failures += 1;
            false
        }
    }
}

/// 删除引用资源的全部实体，全部成功时返回真。
fn release_resource<G>(graph: &mut G, resource: ResourceId, summary: &mut StageSummary) -> bool
where
    G: SceneGraph + ?Sized,
{
    let mut clean = true;
    for reference in graph.resource_references(resource) {
        match sweep::erase_unlocked(graph, reference) {
            Ok(()) => summary.erased += 1,
            Err(err) => {
                warn!(entity = reference.get(), error = %err, "删除资源引用失败");
                summary.failures += 1;
                clean = false;
            }
        }
    }
    clean
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Scene;
    use cadclean_core::document::Document;
    use cadclean_core::geometry::Point2;

    #[test]
    fn state_take_leaves_empty_state() {
        let mut state = PipelineState::default();
        assert!(state.is_empty());
        state.snapshot.insert(DefinitionId::new(3));
        state.flags.awaiting_bind = true;
        assert!(!state.is_empty());
        let taken = state.take();
        assert!(state.is_empty());
        assert_eq!(taken.snapshot.len(), 1);
    }

    #[test]
    fn protected_patterns_match_name_or_path() {
        let settings = PipelineSettings::default();
        let mut doc = Document::new();
        let by_name = doc.add_external_definition("A-TTLB", "sheet.dwg", false, false);
        let by_path = doc.add_external_definition("X1", "C:/std/Border-E1.dwg", false, false);
        let plain = doc.add_external_definition("SITE", "site.dwg", false, false);
        assert!(settings.is_protected(doc.definition_by_id(by_name).unwrap()));
        assert!(settings.is_protected(doc.definition_by_id(by_path).unwrap()));
        assert!(!settings.is_protected(doc.definition_by_id(plain).unwrap()));
    }

    #[test]
    fn stage_called_out_of_order_resets() {
        let mut doc = Document::new();
        let mut pipeline = ResourcePipeline::default();
        let err = pipeline.run_stage2(&mut doc).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::OutOfOrder {
                expected: PipelineStage::Idle,
                found: PipelineStage::BindAndDetach
            }
        ));

        pipeline.begin();
        pipeline.run_stage1(&mut doc).unwrap();
        assert!(pipeline.state().flags.awaiting_bind);
        let err = pipeline.run_stage3(&mut doc).unwrap_err();
        assert!(matches!(err, PipelineError::OutOfOrder { .. }));
        assert!(pipeline.state().is_empty());
        assert_eq!(pipeline.stage(), PipelineStage::Idle);
    }

    #[test]
    fn begin_discards_leftover_state() {
        let mut doc = Document::new();
        doc.add_line(Point2::new(0.0, 0.0), Point2::new(1.0, 0.0), "0");
        let mut pipeline = ResourcePipeline::default();
        pipeline.begin();
        pipeline.run_stage1(&mut doc).unwrap();
        assert!(!pipeline.state().is_empty());

        pipeline.begin();
        assert!(pipeline.state().is_empty());
        assert_eq!(pipeline.stage(), PipelineStage::PreClean);
    }

    #[test]
    fn empty_document_runs_every_stage() {
        let mut doc = Document::new();
        let mut pipeline = ResourcePipeline::default();
        let outcomes = pipeline.run_to_completion(&mut doc).unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].candidate.is_none());
        assert_eq!(outcomes[2].summary, StageSummary::default());
        assert!(pipeline.state().is_empty());
        assert_eq!(pipeline.stage(), PipelineStage::Idle);
    }

    #[test]
    fn demo_sheet_is_cleaned_end_to_end() {
        let mut scene = Scene::new();
        let sheet = scene.populate_demo_sheet().unwrap();
        let doc = scene.document_mut();
        let mut pipeline = ResourcePipeline::default();

        let outcomes = pipeline.run_to_completion(doc).unwrap();
        let candidate = outcomes[0].candidate.as_ref().unwrap();
        let bounds = candidate.bounds();
        assert!((bounds.width() - 42.0).abs() < 1e-9);
        assert!((bounds.height() - 30.0).abs() < 1e-9);

        for id in &sheet.outside {
            assert!(SceneGraph::is_erased(doc, *id));
        }
        // 黑名单中的 KEYPLAN 与 LOGO 已移除，已加载的 ARCH-BASE 被绑定为本地块。
        assert!(doc.definition(sheet.keyplan_xref).is_none());
        assert!(doc.definition(sheet.arch_xref).is_none());
        assert!(doc.find_definitions("MEP-CONSULT").is_empty());
        assert_eq!(doc.find_definitions("TBLK-BORDER"), vec![sheet.border_xref]);
        assert!(doc.resource(sheet.logo).is_none());
        assert!(doc.resource(sheet.scan).is_none());
        assert!(doc.dictionary_entries(sheet.logo).is_empty());
        assert_eq!(outcomes[2].summary.purged, 2);
        assert!(pipeline.state().is_empty());
    }

    #[test]
    fn cancellation_rolls_back_stage() {
        let mut scene = Scene::new();
        let sheet = scene.populate_demo_sheet().unwrap();
        let doc = scene.document_mut();
        let mut pipeline = ResourcePipeline::default();
        pipeline.begin();
        pipeline.cancel_handle().store(true, Ordering::SeqCst);

        let err = pipeline.run_stage1(doc).unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(PipelineStage::PreClean)));
        assert!(!SceneGraph::is_erased(doc, sheet.outside[0]));
        assert!(doc.definition(sheet.keyplan_xref).is_some());
        assert!(pipeline.state().is_empty());
        assert_eq!(pipeline.stage(), PipelineStage::Idle);
    }
}
