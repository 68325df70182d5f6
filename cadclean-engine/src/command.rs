use std::collections::{HashMap, VecDeque};

use cadclean_core::graph::SceneGraph;
use tracing::{debug, warn};

use crate::detect;
use crate::normalize;
use crate::pipeline::{PipelineStage, ResourcePipeline, StageOutcome};
use crate::scene::Scene;
use crate::sweep;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub name: String,
    pub args: Vec<String>,
}

impl CommandRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub success: bool,
    pub message: Option<String>,
    /// 由宿主稍后调度的后续命令。
    pub continuation: Option<CommandRequest>,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            continuation: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            continuation: None,
        }
    }

    pub fn then(mut self, next: CommandRequest) -> Self {
        self.continuation = Some(next);
        self
    }
}

pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn execute(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse;
}

pub struct CommandContext<'a> {
    pub scene: &'a mut Scene,
    pub pipeline: &'a mut ResourcePipeline,
}

pub struct CommandBus {
    handlers: HashMap<&'static str, Box<dyn CommandHandler>>,
}

impl CommandBus {
    pub fn new() -> Self {
        let mut bus = Self {
            handlers: HashMap::new(),
        };
        bus.register(NormalizeCommand);
        bus.register(DetectTitleBlockCommand);
        bus.register(CropTitleBlockCommand);
        bus.register(KeepSelectionCommand);
        bus.register(IsolateDisciplineCommand);
        bus.register(CleanDrawingCommand);
        bus.register(CleanStageCommand {
            name: "clean_stage1",
            stage: PipelineStage::PreClean,
        });
        bus.register(BindExternalCommand);
        bus.register(CleanStageCommand {
            name: "clean_stage2",
            stage: PipelineStage::BindAndDetach,
        });
        bus.register(CleanStageCommand {
            name: "clean_stage3",
            stage: PipelineStage::PurgeDefs,
        });
        bus.register(ClearSelectionCommand);
        bus
    }

    pub fn register<H: CommandHandler + 'static>(&mut self, handler: H) {
        self.handlers.insert(handler.name(), Box::new(handler));
    }

    pub fn dispatch(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        if let Some(handler) = self.handlers.get(request.name.as_str()) {
            handler.execute(request, context)
        } else {
            CommandResponse::err(format!("未知命令: {}", request.name))
        }
    }

    /// 执行命令及其全部后续命令，按先进先出顺序调度。命令失败时停止后续调度。
    pub fn run(
        &self,
        request: CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> Vec<(CommandRequest, CommandResponse)> {
        let mut queue = VecDeque::from([request]);
        let mut log = Vec::new();
        while let Some(request) = queue.pop_front() {
            debug!(command = %request.name, "执行命令");
            let mut response = self.dispatch(&request, context);
            if let Some(next) = response.continuation.clone() {
                if response.success {
                    queue.push_back(next);
                } else {
                    warn!(command = %request.name, "命令失败，放弃后续命令");
                    response.continuation = None;
                }
            }
            log.push((request, response));
        }
        log
    }

    pub fn available_commands(&self) -> impl Iterator<Item = &&'static str> {
        self.handlers.keys()
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

struct NormalizeCommand;

impl CommandHandler for NormalizeCommand {
    fn name(&self) -> &'static str {
        "normalize"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        let document = context.scene.document_mut();
        let model = document.model_space();
        let result = normalize::normalize(document, model);
        context.scene.prune_selection();
        match result {
            Ok(report) => CommandResponse::ok(format!(
                "已炸开 {} 个块参照（{} 轮，跳过 {}）",
                report.exploded, report.passes, report.skipped
            )),
            Err(err) => CommandResponse::err(err.to_string()),
        }
    }
}

struct DetectTitleBlockCommand;

impl CommandHandler for DetectTitleBlockCommand {
    fn name(&self) -> &'static str {
        "detect_title_block"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        let document = context.scene.document();
        let model = document.model_space();
        let settings = &context.pipeline.settings().detector;
        match detect::detect_title_block(document, model, settings) {
            Some(candidate) => {
                let message = format!(
                    "识别到图框：策略 {}，得分 {:.2}",
                    candidate.strategy, candidate.score
                );
                context.scene.replace_selection(candidate.boundary);
                CommandResponse::ok(message)
            }
            None => {
                context.scene.clear_selection();
                CommandResponse::err("未识别到图框")
            }
        }
    }
}

struct CropTitleBlockCommand;

impl CommandHandler for CropTitleBlockCommand {
    fn name(&self) -> &'static str {
        "crop_title_block"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        let settings = context.pipeline.settings().detector.clone();
        let document = context.scene.document_mut();
        let model = document.model_space();
        let result = sweep::crop_to_title_block(document, model, &settings);
        context.scene.prune_selection();
        match result {
            Ok(Some(outcome)) => CommandResponse::ok(format!(
                "已裁剪到图框，删除 {} 个图元",
                outcome.sweep.erased
            )),
            Ok(None) => CommandResponse::err("未识别到图框，图纸保持不变"),
            Err(err) => CommandResponse::err(err.to_string()),
        }
    }
}

struct KeepSelectionCommand;

impl CommandHandler for KeepSelectionCommand {
    fn name(&self) -> &'static str {
        "keep_selection"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        if context.scene.selection_len() == 0 {
            return CommandResponse::err("选中集为空，拒绝删除全部图元");
        }
        let retain = context.scene.selection_set();
        let document = context.scene.document_mut();
        let model = document.model_space();
        match sweep::keep_only(document, model, &retain) {
            Ok(report) => {
                context.scene.prune_selection();
                CommandResponse::ok(format!("已删除选中集以外的 {} 个图元", report.erased))
            }
            Err(err) => CommandResponse::err(err.to_string()),
        }
    }
}

struct IsolateDisciplineCommand;

impl CommandHandler for IsolateDisciplineCommand {
    fn name(&self) -> &'static str {
        "isolate_discipline"
    }

    fn execute(
        &self,
        request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        let document = context.scene.document_mut();
        let model = document.model_space();
        let result = sweep::isolate_layers(document, model, &request.args);
        context.scene.prune_selection();
        match result {
            Ok(report) => CommandResponse::ok(format!(
                "已保留专业 {}，删除 {} 个图元",
                request.args.join(","),
                report.erased
            )),
            Err(err) => CommandResponse::err(err.to_string()),
        }
    }
}

struct CleanDrawingCommand;

impl CommandHandler for CleanDrawingCommand {
    fn name(&self) -> &'static str {
        "clean_drawing"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        context.pipeline.begin();
        CommandResponse::ok("开始清理图纸").then(CommandRequest::new("clean_stage1"))
    }
}

struct CleanStageCommand {
    name: &'static str,
    stage: PipelineStage,
}

impl CleanStageCommand {
    fn run(&self, context: &mut CommandContext<'_>) -> Result<StageOutcome, String> {
        let document = context.scene.document_mut();
        let result = match self.stage {
            PipelineStage::PreClean => context.pipeline.run_stage1(document),
            PipelineStage::BindAndDetach => context.pipeline.run_stage2(document),
            PipelineStage::PurgeDefs => context.pipeline.run_stage3(document),
            PipelineStage::Idle => return Err("空闲阶段不可执行".to_string()),
        };
        context.scene.prune_selection();
        result.map_err(|err| err.to_string())
    }
}

impl CommandHandler for CleanStageCommand {
    fn name(&self) -> &'static str {
        self.name
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        let outcome = match self.run(context) {
            Ok(outcome) => outcome,
            Err(message) => return CommandResponse::err(message),
        };
        let summary = &outcome.summary;
        let response = CommandResponse::ok(format!(
            "阶段 {} 完成：删除 {}，拆离 {}，清除 {}，失败 {}，跳过 {}",
            outcome.stage,
            summary.erased,
            summary.detached,
            summary.purged,
            summary.failures,
            summary.skipped
        ));
        match outcome.stage {
            // 第一阶段之后先由协作方绑定外部参照。
            PipelineStage::PreClean => response.then(CommandRequest::new("bind_external")),
            PipelineStage::BindAndDetach => response.then(CommandRequest::new("clean_stage3")),
            _ => response,
        }
    }
}

struct BindExternalCommand;

impl CommandHandler for BindExternalCommand {
    fn name(&self) -> &'static str {
        "bind_external"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        let document = context.scene.document_mut();
        match context.pipeline.bind_external(document) {
            Ok(created) => CommandResponse::ok(format!("已绑定 {} 个块定义", created.len()))
                .then(CommandRequest::new("clean_stage2")),
            Err(err) => CommandResponse::err(err.to_string()),
        }
    }
}

struct ClearSelectionCommand;

impl CommandHandler for ClearSelectionCommand {
    fn name(&self) -> &'static str {
        "clear_selection"
    }

    fn execute(
        &self,
        _request: &CommandRequest,
        context: &mut CommandContext<'_>,
    ) -> CommandResponse {
        context.scene.clear_selection();
        CommandResponse::ok("选中集已清空")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Scene;

    #[test]
    fn detect_selects_boundary_and_clear_empties_it() {
        let mut scene = Scene::new();
        scene.populate_demo_sheet().unwrap();
        let mut pipeline = ResourcePipeline::default();
        let bus = CommandBus::new();
        let mut context = CommandContext {
            scene: &mut scene,
            pipeline: &mut pipeline,
        };

        let response = bus.dispatch(&CommandRequest::new("normalize"), &mut context);
        assert!(response.success);
        let response = bus.dispatch(&CommandRequest::new("detect_title_block"), &mut context);
        assert!(response.success, "{:?}", response.message);
        assert_eq!(context.scene.selection_len(), 1);

        let response = bus.dispatch(&CommandRequest::new("clear_selection"), &mut context);
        assert!(response.success);
        assert_eq!(context.scene.selection_len(), 0);
    }

    #[test]
    fn clean_drawing_chains_every_stage() {
        let mut scene = Scene::new();
        let sheet = scene.populate_demo_sheet().unwrap();
        let mut pipeline = ResourcePipeline::default();
        let bus = CommandBus::new();
        let mut context = CommandContext {
            scene: &mut scene,
            pipeline: &mut pipeline,
        };

        let log = bus.run(CommandRequest::new("clean_drawing"), &mut context);
        let names: Vec<&str> = log.iter().map(|(request, _)| request.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "clean_drawing",
                "clean_stage1",
                "bind_external",
                "clean_stage2",
                "clean_stage3"
            ]
        );
        assert!(log.iter().all(|(_, response)| response.success));
        assert!(context.pipeline.state().is_empty());
        assert_eq!(context.pipeline.stage(), PipelineStage::Idle);
        assert!(context.scene.document().entity(sheet.outside[0]).is_none());
    }

    #[test]
    fn failed_stage_stops_the_chain() {
        let mut scene = Scene::new();
        let mut pipeline = ResourcePipeline::default();
        let bus = CommandBus::new();
        let mut context = CommandContext {
            scene: &mut scene,
            pipeline: &mut pipeline,
        };

        let log = bus.run(CommandRequest::new("clean_stage2"), &mut context);
        assert_eq!(log.len(), 1);
        assert!(!log[0].1.success);
        assert!(log[0].1.continuation.is_none());
    }

    #[test]
    fn keep_selection_and_isolation_guard_against_empty_input() {
        let mut scene = Scene::new();
        let sheet = scene.populate_demo_sheet().unwrap();
        let mut pipeline = ResourcePipeline::default();
        let bus = CommandBus::new();
        let mut context = CommandContext {
            scene: &mut scene,
            pipeline: &mut pipeline,
        };

        let response = bus.dispatch(&CommandRequest::new("keep_selection"), &mut context);
        assert!(!response.success);
        let response = bus.dispatch(&CommandRequest::new("isolate_discipline"), &mut context);
        assert!(!response.success);

        context.scene.replace_selection([sheet.outside[0]]);
        let response = bus.dispatch(&CommandRequest::new("keep_selection"), &mut context);
        assert!(response.success);
        assert_eq!(context.scene.document().entities().count(), 1);
    }

    #[test]
    fn isolate_discipline_keeps_prefixed_layers() {
        let mut scene = Scene::new();
        scene.populate_demo_sheet().unwrap();
        let mut pipeline = ResourcePipeline::default();
        let bus = CommandBus::new();
        let mut context = CommandContext {
            scene: &mut scene,
            pipeline: &mut pipeline,
        };

        let request = CommandRequest::with_args("isolate_discipline", ["a-"]);
        let response = bus.dispatch(&request, &mut context);
        assert!(response.success);
        assert!(
            context
                .scene
                .document()
                .entities()
                .all(|(_, entity)| entity.layer_name().starts_with("A-"))
        );
    }

    #[test]
    fn unknown_command_is_rejected() {
        let mut scene = Scene::new();
        let mut pipeline = ResourcePipeline::default();
        let bus = CommandBus::new();
        let mut context = CommandContext {
            scene: &mut scene,
            pipeline: &mut pipeline,
        };
        let response = bus.dispatch(&CommandRequest::new("plot_sheet"), &mut context);
        assert!(!response.success);
        assert!(bus.available_commands().any(|name| *name == "clean_drawing"));
    }
}
