//! Talk3 CLI 客户端（测试版）
//!
//! 非交互式 CLI，用于测试和展示同步核心：登录后连接，打印房间/好友
//! 列表并持续输出收到的实时事件；可选激活一个房间并发送一条消息

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use talk3_sdk_core::chat::client::ChatClient;
use talk3_sdk_core::chat::config::{ClientConfig, DeviceProfile};
use talk3_sdk_core::chat::friend::{FriendEntry, FriendListener, FriendRequestView};
use talk3_sdk_core::chat::msg::{MessageListener, MessageView, SenderRole};
use talk3_sdk_core::chat::notify::{NotificationListener, NotificationPayload};
use talk3_sdk_core::chat::room::{RoomListener, RoomWithMeta};
use tokio::time::{sleep, Duration};
use tracing::{error, info};

/// Talk3 CLI 客户端
#[derive(Parser, Debug)]
#[command(name = "talk3-cli")]
#[command(about = "Talk3 CLI 客户端 - 用于测试和展示同步核心", long_about = None)]
struct Args {
    /// 登录邮箱
    #[arg(short, long)]
    email: String,

    /// 登录密码
    #[arg(short, long)]
    password: String,

    /// 启动后激活的房间 ID
    #[arg(short, long)]
    room: Option<i64>,

    /// 激活房间后发送的一条消息
    #[arg(short, long)]
    send: Option<String>,

    /// 按移动端档位跑（看门狗/轮询间隔更短）
    #[arg(long)]
    mobile: bool,

    /// 运行时长（秒），0 表示持续运行
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// 日志级别（默认: info,talk3_sdk_core=debug）
    #[arg(long, default_value = "info,talk3_sdk_core=debug")]
    log_level: String,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("debug.log")
        .expect("无法创建日志文件 debug.log");

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: debug.log");
}

/// 设置监听器（输出所有接收到的信息）
fn setup_listeners(client: &mut ChatClient) {
    struct CliRoomListener;
    #[async_trait::async_trait]
    impl RoomListener for CliRoomListener {
        async fn on_rooms_changed(&self, rooms: Vec<RoomWithMeta>) {
            info!("[CLI/Room] 📋 房间列表变更（共 {} 个）", rooms.len());
            for room in rooms.iter().take(5) {
                info!(
                    "[CLI/Room]   - #{} {} | 最新: {} | {}",
                    room.id,
                    room.name,
                    room.last_msg.as_deref().unwrap_or("-"),
                    room.time_label.as_deref().unwrap_or("-"),
                );
            }
        }

        async fn on_loading_changed(&self, loading: bool) {
            if loading {
                info!("[CLI/Room] ⏳ 加载中…");
            }
        }
    }
    client.set_room_listener(Arc::new(CliRoomListener));

    struct CliMessageListener;
    #[async_trait::async_trait]
    impl MessageListener for CliMessageListener {
        async fn on_messages_changed(&self, messages: Vec<MessageView>) {
            if let Some(last) = messages.last() {
                let who = match last.role {
                    SenderRole::Me => "我".to_string(),
                    SenderRole::Friend => {
                        last.sender_name.clone().unwrap_or_else(|| "对方".to_string())
                    }
                };
                info!(
                    "[CLI/Msg] 💬 {} 条消息，最新 [{}] {}: {}",
                    messages.len(),
                    last.time,
                    who,
                    last.text
                );
                if let Some(text_en) = &last.text_en {
                    info!("[CLI/Msg]    ↳ 译文: {}", text_en);
                }
            } else {
                info!("[CLI/Msg] 💬 消息列表已清空");
            }
        }

        async fn on_loading_changed(&self, loading: bool) {
            if loading {
                info!("[CLI/Msg] ⏳ 加载中…");
            }
        }
    }
    client.set_message_listener(Arc::new(CliMessageListener));

    struct CliFriendListener;
    #[async_trait::async_trait]
    impl FriendListener for CliFriendListener {
        async fn on_friends_changed(&self, friends: Vec<FriendEntry>) {
            info!("[CLI/Friend] 👥 好友列表变更（共 {} 人）", friends.len());
        }

        async fn on_requests_changed(&self, requests: Vec<FriendRequestView>) {
            for request in &requests {
                info!(
                    "[CLI/Friend] 📝 待处理请求: {} ({})",
                    request.from_name.as_deref().unwrap_or("?"),
                    request.from_email.as_deref().unwrap_or("?"),
                );
            }
        }

        async fn on_loading_changed(&self, _loading: bool) {}
    }
    client.set_friend_listener(Arc::new(CliFriendListener));

    struct CliNotificationListener;
    #[async_trait::async_trait]
    impl NotificationListener for CliNotificationListener {
        async fn on_notification(&self, payload: NotificationPayload) {
            info!(
                "[CLI/Notify] 🔔 {}: {} (房间 {})",
                payload.title, payload.body, payload.room_id
            );
        }
    }
    client.set_notification_listener(Arc::new(CliNotificationListener));
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logger(&args.log_level);

    info!("[CLI] 🚀 Talk3 CLI 客户端（测试模式）");
    info!("[CLI] 📧 邮箱: {}", args.email);
    info!("[CLI] ⏱️  运行时长: {} 秒（0=持续运行）", args.duration);

    let mut config = ClientConfig::from_env();
    if args.mobile {
        config.device = DeviceProfile::Mobile;
    }
    if !config.is_configured() {
        error!("[CLI] ❌ 后端连接参数未配置，请设置环境变量后重试");
        anyhow::bail!("后端连接参数未配置");
    }

    let mut client = ChatClient::new(config);
    setup_listeners(&mut client);

    info!("[CLI] 🔐 正在登录...");
    client.login(&args.email, &args.password).await?;
    info!("[CLI] ✅ 登录成功！");

    info!("[CLI] 🔗 正在连接...");
    client.connect().await?;
    info!("[CLI] ✅ 连接成功！");

    // 等初始加载落地后打一版快照
    sleep(Duration::from_secs(2)).await;
    {
        let rooms = client.rooms();
        info!("[CLI] 📋 房间列表（共 {} 个）:", rooms.len());
        for room in rooms.iter().take(5) {
            info!(
                "[CLI]   - #{} {} | 最新: {}",
                room.id,
                room.name,
                room.last_msg.as_deref().unwrap_or("-"),
            );
        }
        info!("[CLI] 👥 好友列表（共 {} 人）", client.friends().len());
    }

    if let Some(room_id) = args.room {
        info!("[CLI] 🚪 激活房间: {}", room_id);
        client.activate_room(room_id).await?;

        if let Some(text) = &args.send {
            match client.send_message(text).await {
                Ok(view) => info!("[CLI] ✉️ 已发送: [{}] {}", view.time, view.text),
                Err(e) => error!("[CLI] ❌ 发送失败: {}", e),
            }
        }
    }

    info!("[CLI] 📥 开始监听事件...");
    if args.duration > 0 {
        info!("[CLI] ⏰ {} 秒后自动退出", args.duration);
        sleep(Duration::from_secs(args.duration)).await;
        client.shutdown().await;
        info!("[CLI] 👋 程序退出");
    } else {
        info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
        loop {
            sleep(Duration::from_secs(3600)).await;
        }
    }

    Ok(())
}
