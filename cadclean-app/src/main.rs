use std::path::PathBuf;

use cadclean_config::{AppConfig, ConfigError};
use cadclean_engine::command::{CommandBus, CommandContext, CommandRequest};
use cadclean_engine::detect::DetectorSettings;
use cadclean_engine::pipeline::{PipelineSettings, ResourcePipeline};
use cadclean_io::{DocumentSaver, JsonFacade};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

mod report;
mod session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum RunMode {
    Detect,
    #[default]
    Clean,
}

#[derive(Debug, Default, PartialEq)]
struct CliOptions {
    mode: RunMode,
    config: Option<PathBuf>,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    demo: bool,
    isolate: bool,
}

fn main() {
    let options = match parse_args(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(1);
        }
    };

    let config = load_configuration(options.config.clone());
    init_logging(&config);
    info!("启动 CAD 图纸清理工具");

    let mut loaded = match session::load_scene(options.input.as_deref(), options.demo) {
        Ok(loaded) => loaded,
        Err(err) => {
            error!(error = %err, "加载文档失败");
            std::process::exit(1);
        }
    };
    let mut pipeline = ResourcePipeline::new(build_settings(&config));
    let bus = CommandBus::new();
    let mut context = CommandContext {
        scene: &mut loaded.scene,
        pipeline: &mut pipeline,
    };

    report::print_source(&loaded.source);
    let mut requests = Vec::new();
    if options.isolate {
        if config.pipeline.discipline_prefixes.is_empty() {
            warn!("未配置 pipeline.discipline_prefixes，跳过专业隔离");
        } else {
            requests.push(CommandRequest::with_args(
                "isolate_discipline",
                config.pipeline.discipline_prefixes.iter().cloned(),
            ));
        }
    }
    match options.mode {
        RunMode::Detect => {
            requests.push(CommandRequest::new("normalize"));
            requests.push(CommandRequest::new("detect_title_block"));
        }
        RunMode::Clean => requests.push(CommandRequest::new("clean_drawing")),
    }

    let mut failed = false;
    for request in requests {
        let log = bus.run(request, &mut context);
        failed |= report::print_command_log(&log);
        if failed {
            break;
        }
    }
    report::print_summary(context.scene);

    if let Some(path) = &options.output {
        let saver = JsonFacade::new();
        if let Err(err) = saver.save(context.scene.document(), path) {
            error!(path = %path.display(), error = %err, "保存结果失败");
            std::process::exit(1);
        }
        println!("结果已写入：{}", path.display());
    }

    if failed {
        std::process::exit(1);
    }
}

fn parse_args<I>(args: I) -> Result<CliOptions, String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut options = CliOptions::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--detect" => options.mode = RunMode::Detect,
            "--clean" => options.mode = RunMode::Clean,
            "--demo" => options.demo = true,
            "--isolate" => options.isolate = true,
            "--config" | "--input" | "--output" => {
                let Some(value) = args.next() else {
                    return Err(format!("`{arg}` 需要提供文件路径"));
                };
                let path = Some(PathBuf::from(value));
                match arg.as_str() {
                    "--config" => options.config = path,
                    "--input" => options.input = path,
                    _ => options.output = path,
                }
            }
            other => return Err(format!("未知参数：{other}")),
        }
    }
    Ok(options)
}

/// 将配置中的词表合并进引擎默认值；未设置的项保持内建默认。
fn build_settings(config: &AppConfig) -> PipelineSettings {
    let mut settings = PipelineSettings::default();
    let mut detector = DetectorSettings::default();
    if let Some(keywords) = &config.detection.layer_keywords {
        detector.layer_keywords = keywords.clone();
    }
    if let Some(tags) = &config.detection.field_tags {
        detector.field_tags = tags.clone();
    }
    settings.detector = detector;
    if let Some(deny_list) = &config.pipeline.deny_list {
        settings.deny_list = deny_list.clone();
    }
    if let Some(patterns) = &config.pipeline.protected_patterns {
        settings.protected_patterns = patterns.clone();
    }
    settings
}

fn load_configuration(override_path: Option<PathBuf>) -> AppConfig {
    match override_path {
        Some(path) => AppConfig::from_file(&path).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "加载指定配置失败，使用默认配置");
            AppConfig::default()
        }),
        None => match AppConfig::discover() {
            Ok(cfg) => cfg,
            Err(err) => {
                match &err {
                    ConfigError::Io { path, .. } | ConfigError::Parse { path, .. } => {
                        warn!(path = %path.display(), error = %err, "加载默认配置失败，使用内建默认值");
                    }
                    ConfigError::Context { .. } => {
                        warn!(error = %err, "加载默认配置失败，使用内建默认值");
                    }
                }
                AppConfig::default()
            }
        },
    }
}

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_new(config.logging.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter);
    if subscriber.try_init().is_err() {
        // 已初始化，忽略
    }
}
