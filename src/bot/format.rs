use crate::quota::short_model_name;
use crate::relay::QuotaReport;

/// Telegram 单条消息上限是 4096，留一点余量。
pub const TELEGRAM_MAX_LEN: usize = 4000;

pub const THINKING_NOTICE: &str = "🤔 等我諗諗先，你等陣...";
pub const QUOTA_EXHAUSTED_NOTICE: &str = "⛔ 今日 Gemini 配額已經用晒，改用本地 AI 回覆 👇";
pub const ASK_USAGE: &str = "⚠️ 請喺指令後面加埋問題，例如：\n/ask 乜嘢係 token";
pub const APOLOGY: &str = "😵 兩邊 AI 暫時都用唔到，遲啲再試吓 🙏";
pub const EMPTY_REPLY: &str = "🤷 AI 冇俾到任何回覆";

/// 聊天侧消息中与过滤相关的信息（与具体 SDK 类型解耦）。
#[derive(Debug, Clone, Default)]
pub struct IncomingText<'a> {
    pub is_group: bool,
    pub text: &'a str,
    /// 所有 @mention 实体的原文（含 @）。
    pub mentions: Vec<&'a str>,
    pub has_command: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    Command,
    NotMentioned,
    Empty,
}

/// 普通消息是否需要回复；需要时返回去掉 @bot 后的提问文本。
pub fn extract_prompt(msg: &IncomingText<'_>, bot_username: &str) -> Result<String, Skip> {
    if msg.has_command {
        return Err(Skip::Command);
    }

    if msg.is_group {
        let target = format!("@{bot_username}");
        let mentioned = msg.mentions.iter().any(|m| m.eq_ignore_ascii_case(&target));
        if !mentioned {
            return Err(Skip::NotMentioned);
        }
    }

    let prompt = strip_mention(msg.text, bot_username);
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return Err(Skip::Empty);
    }
    Ok(prompt.to_string())
}

/// 去掉文本中所有 `@username`（忽略 ASCII 大小写）。
pub fn strip_mention(text: &str, bot_username: &str) -> String {
    let needle = format!("@{bot_username}");
    let n = needle.len();
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    let mut copied = 0;
    while i + n <= bytes.len() {
        if bytes[i..i + n].eq_ignore_ascii_case(needle.as_bytes()) {
            out.push_str(&text[copied..i]);
            i += n;
            copied = i;
        } else {
            i += 1;
        }
    }
    out.push_str(&text[copied..]);
    out
}

/// 按字符切分长消息，保证不会切断 UTF-8 字符。
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut out = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for ch in text.chars() {
        if count == max_chars {
            out.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(ch);
        count += 1;
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

pub fn render_quota(report: &QuotaReport) -> String {
    let mut lines = vec!["🤖 Gemini 配額狀態".to_string()];
    for m in &report.models {
        lines.push(format!(
            "- {}: {} / {}（剩餘 {}）",
            short_model_name(&m.name),
            m.used,
            m.limit,
            m.remaining
        ));
    }
    lines.push(String::new());
    lines.push(format!("📊 總剩餘次數：{}", report.total_remaining));
    let next = report
        .next_model
        .as_deref()
        .map(short_model_name)
        .unwrap_or("❌ 無");
    lines.push(format!("🧠 下一個可用模型：{next}"));
    lines.join("\n")
}
