use super::format::{
    APOLOGY, ASK_USAGE, EMPTY_REPLY, IncomingText, QUOTA_EXHAUSTED_NOTICE, Skip, TELEGRAM_MAX_LEN,
    THINKING_NOTICE, extract_prompt, render_quota, split_message,
};
use super::{AppRelay, BotState};
use crate::logging;
use std::time::Instant;
use teloxide::prelude::*;
use teloxide::types::{Me, MessageEntityKind};
use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "snake_case", description = "可用指令：")]
pub enum Command {
    #[command(description = "顯示說明")]
    Help,
    #[command(description = "開始使用")]
    Start,
    #[command(description = "問 AI 問題，例如 /ask 乜嘢係 token")]
    Ask(String),
    #[command(description = "查看今日 Gemini 配額")]
    Quota,
    #[command(description = "查看今日 Gemini 配額")]
    GeminiQuota,
}

pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    state: BotState,
) -> ResponseResult<()> {
    match cmd {
        Command::Help | Command::Start => {
            bot.send_message(msg.chat.id, Command::descriptions().to_string())
                .await?;
        }
        Command::Quota | Command::GeminiQuota => {
            let report = state.relay.quota_report().await;
            bot.send_message(msg.chat.id, render_quota(&report)).await?;
        }
        Command::Ask(text) => {
            let prompt = text.trim();
            if prompt.is_empty() {
                bot.send_message(msg.chat.id, ASK_USAGE).await?;
                return Ok(());
            }
            answer(&bot, &msg, &state, prompt).await?;
        }
    }
    Ok(())
}

/// 普通文本消息：仅在开启 REPLY_TO_MESSAGES 时处理。
pub async fn handle_message(
    bot: Bot,
    msg: Message,
    me: Me,
    state: BotState,
) -> ResponseResult<()> {
    if !state.reply_to_messages {
        return Ok(());
    }
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let entities = msg.parse_entities().unwrap_or_default();
    let incoming = IncomingText {
        is_group: msg.chat.is_group() || msg.chat.is_supergroup(),
        text,
        mentions: entities
            .iter()
            .filter(|e| matches!(e.kind(), MessageEntityKind::Mention))
            .map(|e| e.text())
            .collect(),
        has_command: entities
            .iter()
            .any(|e| matches!(e.kind(), MessageEntityKind::BotCommand)),
    };

    match extract_prompt(&incoming, me.username()) {
        Ok(prompt) => answer(&bot, &msg, &state, &prompt).await,
        Err(Skip::Empty) => Ok(()),
        Err(reason) => {
            tracing::debug!(chat_id = %msg.chat.id, ?reason, "忽略消息");
            Ok(())
        }
    }
}

async fn answer(bot: &Bot, msg: &Message, state: &BotState, prompt: &str) -> ResponseResult<()> {
    if state.log_level.client_enabled() {
        logging::chat_request(&msg.chat.id.to_string(), &sender(msg), prompt);
    }

    let notice = if state.relay.has_any_quota().await {
        THINKING_NOTICE
    } else {
        QUOTA_EXHAUSTED_NOTICE
    };
    bot.send_message(msg.chat.id, notice).await?;

    let start = Instant::now();
    let text = reply_text(&state.relay, prompt).await;
    if state.log_level.client_enabled() {
        logging::chat_reply("relay", start.elapsed(), &text);
    }

    for chunk in split_message(&text, TELEGRAM_MAX_LEN) {
        bot.send_message(msg.chat.id, chunk).await?;
    }
    Ok(())
}

/// 兜底后端也失败时返回致歉文本，不让错误冒到分发循环。
async fn reply_text(relay: &AppRelay, prompt: &str) -> String {
    match relay.answer(prompt).await {
        Ok(reply) => {
            tracing::info!(
                source = ?reply.source,
                fallback = reply.source.is_fallback(),
                model = reply.model.as_deref().unwrap_or("-"),
                len = reply.text.chars().count(),
                "已生成回复"
            );
            if reply.text.trim().is_empty() {
                EMPTY_REPLY.to_string()
            } else {
                reply.text
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "兜底后端调用失败");
            APOLOGY.to_string()
        }
    }
}

fn sender(msg: &Message) -> String {
    match msg.from.as_ref() {
        Some(u) => u.username.clone().unwrap_or_else(|| u.id.to_string()),
        None => "-".to_string(),
    }
}
