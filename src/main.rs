//! xtranslate-broker：以本地宿主方式运行后台代理
//!
//! 标准输入每行一条消息 `{ "id"?, "type", "payload"? }`，标准输出每行一个回复信封。
//! 请求并发处理，回复按完成顺序写出，调用方按 `messageId` 关联。

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use xtranslate::background::{Background, BackgroundDeps};
use xtranslate::bus::{BusClient, ContextKind, InstallReason, Message, MessageId, ReplyEnvelope};
use xtranslate::config::BrokerConfig;
use xtranslate::error::{helpers, BrokerError, BrokerResult, ErrorDescriptor};
use xtranslate::storage::FileBackend;
use xtranslate::{env, logging};

#[derive(Parser, Debug)]
#[command(name = "xtranslate-broker")]
#[command(about = "XTranslate background broker speaking newline-delimited JSON over stdio")]
#[command(version)]
struct Args {
    /// 配置文件路径，缺省时按搜索路径查找
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 存储目录，覆盖配置文件和环境变量
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// 启动时触发安装钩子
    #[arg(long, value_enum)]
    install: Option<InstallArg>,

    /// 与 `--install update` 一起使用的旧版本号
    #[arg(long, requires = "install")]
    previous_version: Option<String>,

    /// 打印示例配置后退出
    #[arg(long)]
    print_config: bool,

    /// 打印环境变量说明后退出
    #[arg(long)]
    env_docs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum InstallArg {
    Install,
    Update,
}

impl Args {
    fn install_reason(&self) -> Option<InstallReason> {
        self.install.map(|install| match install {
            InstallArg::Install => InstallReason::Install,
            InstallArg::Update => InstallReason::Update {
                previous_version: self.previous_version.clone(),
            },
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.print_config {
        return match BrokerConfig::example_toml() {
            Ok(example) => {
                print!("{}", example);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}", e);
                ExitCode::FAILURE
            }
        };
    }

    if args.env_docs {
        print!("{}", env::generate_env_docs());
        return ExitCode::SUCCESS;
    }

    // 日志级别也可以来自环境变量文件
    let env_file = BrokerConfig::load_dotenv();
    if let Err(e) = logging::init(args.log_level.as_deref()) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }
    if let Some(env_file) = env_file {
        info!("[BACKGROUND] 已加载环境变量文件: {}", env_file);
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("[BACKGROUND] 后台代理异常退出: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> BrokerResult<()> {
    let mut config = BrokerConfig::load(args.config.as_deref())?;
    if let Some(dir) = &args.storage_dir {
        config.storage.dir = dir.to_string_lossy().into_owned();
    }

    let backend = Arc::new(FileBackend::new(config.storage_dir()));
    let background = Background::start(&config, BackgroundDeps::new(backend))?;

    if let Some(max_entries) = config.history.max_entries {
        if let Err(e) = background.history().trim_oldest(max_entries).await {
            helpers::log_error(&e, "[HISTORY] 启动时裁剪历史失败");
        }
    }

    if let Some(reason) = args.install_reason() {
        if let Err(e) = background.notify_install(reason).await {
            helpers::log_error(&e, "[BACKGROUND] 安装钩子执行失败");
        }
    }

    let client = background.connect(ContextKind::NativeHost);
    let served = serve_stdio(client).await;
    background.shutdown().await?;
    served
}

/// 读取标准输入直到 EOF，等待所有请求完成后返回
async fn serve_stdio(client: BusClient) -> BrokerResult<()> {
    let (replies, mut outgoing) = mpsc::unbounded_channel::<ReplyEnvelope>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(envelope) = outgoing.recv().await {
            let mut line = serde_json::to_vec(&envelope)?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
            stdout.flush().await?;
        }
        Ok::<_, BrokerError>(())
    });

    info!("[BUS] 本地宿主已连接，等待标准输入");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message = match parse_message(line) {
            Ok(message) => message,
            Err((id, e)) => {
                warn!("[BUS] 无法解析输入行: {}", e);
                let _ = replies.send(ReplyEnvelope::failure(id, ErrorDescriptor::from(&e)));
                continue;
            }
        };

        let client = client.clone();
        let replies = replies.clone();
        in_flight.spawn(async move {
            let id = message.id.clone();
            let envelope = match client.request(message).await {
                Ok(envelope) => envelope,
                Err(e) => ReplyEnvelope::failure(id, ErrorDescriptor::from(&e)),
            };
            let _ = replies.send(envelope);
        });
    }

    while in_flight.join_next().await.is_some() {}
    drop(replies);

    writer
        .await
        .map_err(|e| BrokerError::InternalError(format!("输出任务异常结束: {}", e)))?
}

/// 解析一行输入，缺少 `id` 时自动生成
fn parse_message(line: &str) -> Result<Message, (MessageId, BrokerError)> {
    let mut value: Value = serde_json::from_str(line)
        .map_err(|e| (MessageId::generate(), BrokerError::ParseError(e.to_string())))?;

    let id = match value.get("id").and_then(Value::as_str) {
        Some(id) => MessageId::from(id),
        None => {
            let id = MessageId::generate();
            if let Value::Object(fields) = &mut value {
                fields.insert("id".to_string(), Value::String(id.to_string()));
            }
            id
        }
    };

    serde_json::from_value(value).map_err(|e| (id, BrokerError::ParseError(e.to_string())))
}
