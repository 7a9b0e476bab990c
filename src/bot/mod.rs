//! Telegram 入口：指令、普通消息过滤与长消息切分。

pub mod format;
pub mod handler;

use crate::gemini::GeminiClient;
use crate::logging::LogLevel;
use crate::ollama::OllamaClient;
use crate::relay::Relay;
use handler::{Command, handle_command, handle_message};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

pub type AppRelay = Relay<GeminiClient, OllamaClient>;

#[derive(Clone)]
pub struct BotState {
    pub relay: Arc<AppRelay>,
    pub reply_to_messages: bool,
    pub log_level: LogLevel,
}

/// 长轮询直到收到 Ctrl-C。单条消息处理失败只记录日志，不影响后续更新。
pub async fn run(bot: Bot, state: BotState) {
    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        tracing::warn!(error = %e, "设置 Telegram 指令列表失败");
    }

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
        .branch(Update::filter_message().endpoint(handle_message));

    tracing::info!(reply_to_messages = state.reply_to_messages, "Telegram 机器人已启动");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .error_handler(LoggingErrorHandler::with_custom_text(
            "Telegram 更新处理失败",
        ))
        .build()
        .dispatch()
        .await;

    tracing::info!("Telegram 机器人已停止");
}
