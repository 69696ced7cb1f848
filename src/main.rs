//! 会话处理器入口
//!
//! ```bash
//! # 启动服务
//! stateful-vision-handler serve --config ./handler.yaml
//!
//! # 输出当前节点的已打开会话
//! stateful-vision-handler report-sessions --store-dir /tmp --model-name llama-3.2-11b-vision
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use stateful_vision_handler::config::{load_config, Config, LoggingConfig, StoreConfig};
use stateful_vision_handler::engine::{
    GenerationParams, HttpImageFetcher, HttpModelBackend, InferenceApi,
};
use stateful_vision_handler::metrics::collect_open_sessions;
use stateful_vision_handler::server::{run_server, AppState};
use stateful_vision_handler::session::{FileStore, RetryPolicy, SessionRegistry};
use stateful_vision_handler::CustomHandler;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 启动 HTTP 服务
    Serve {
        /// YAML 配置文件
        #[arg(short, long, default_value = "handler.yaml", env = "HANDLER_CONFIG")]
        config: PathBuf,
    },
    /// 读取存储文件并输出已打开会话
    ReportSessions {
        #[arg(long, default_value = "/tmp", env = "HANDLER_STORE_DIR")]
        store_dir: String,
        #[arg(long, env = "HANDLER_MODEL_NAME")]
        model_name: String,
    },
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Serve { config } => {
            let config = load_config(&config)
                .with_context(|| format!("加载配置失败: {:?}", config))?;
            init_logging(&config.logging);
            serve(config).await
        }
        Command::ReportSessions {
            store_dir,
            model_name,
        } => {
            init_logging(&LoggingConfig::default());
            report_sessions(&store_dir, &model_name)
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let fetch_timeout = config.timeouts.image_fetch_secs.map(Duration::from_secs);
    let generation_timeout = config.timeouts.generation_secs.map(Duration::from_secs);
    if fetch_timeout.is_none() || generation_timeout.is_none() {
        tracing::warn!("[Main] 未配置图片下载或生成超时，阻塞操作可能无限等待");
    }

    let client = reqwest::Client::builder()
        .build()
        .context("创建 HTTP 客户端失败")?;
    let model = HttpModelBackend::new(
        client.clone(),
        &config.model.backend_url,
        config.model.resolve_token(),
    );
    let engine = InferenceApi::new(
        Arc::new(model),
        Arc::new(HttpImageFetcher::new(client)),
        GenerationParams::from(&config.generation),
    )
    .with_timeouts(fetch_timeout, generation_timeout);

    let store_path = config.store_path();
    let store = FileStore::open(&store_path)
        .with_context(|| format!("打开会话存储失败: {:?}", store_path))?;
    tracing::info!("[Main] 会话存储: {:?}", store_path);
    let registry = Arc::new(SessionRegistry::new(
        Arc::new(store),
        RetryPolicy::from(&config.registry),
    ));

    let mut handler = CustomHandler::new(config.handler.clone(), engine, registry);
    handler.initialize().await.context("模型初始化失败")?;

    let state = AppState::new(handler, config.handler.headers.clone());

    run_server(
        &config.server.host,
        config.server.port,
        config.server.body_limit,
        state,
        async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("[Main] 监听退出信号失败: {}", e);
            }
        },
    )
    .await
    .map_err(|e| anyhow::anyhow!(e))?;

    Ok(())
}

fn report_sessions(store_dir: &str, model_name: &str) -> anyhow::Result<()> {
    let store = StoreConfig {
        dir: store_dir.to_string(),
    };
    let path = store.store_path(model_name);
    match collect_open_sessions(&path).context("读取会话存储失败")? {
        Some(report) => println!("{}", serde_json::to_string(&report)?),
        None => tracing::info!("[Main] 存储文件 {:?} 不存在，节点上没有会话", path),
    }
    Ok(())
}
