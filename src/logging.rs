use reqwest::header::HeaderMap;
use std::time::Duration;

/// 详细日志等级：
/// - off：只输出常规运行日志
/// - low：额外输出聊天侧的提问/回复
/// - medium：再加上后端请求/响应（格式化、脱敏、截断）
/// - high：后端请求/响应完全原样输出
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn raw_enabled(self) -> bool {
        self >= Self::High
    }
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn chat_request(chat: &str, user: &str, text: &str) {
    tracing::info!(
        "\n====================== 聊天提问 ========================\n[聊天] {chat} [用户] {user}\n{}\n==========================================================",
        truncate_text_for_log(text)
    );
}

pub fn chat_reply(source: &str, duration: Duration, text: &str) {
    tracing::info!(
        "\n====================== 聊天回复 ========================\n[来源] {source} {}ms\n{}\n==========================================================",
        format_duration_ms(duration),
        truncate_text_for_log(text)
    );
}

pub fn backend_request(method: &str, url: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端请求 ========================\n[后端请求] {method} {url}\n[后端请求头]\n{}\n{}\n==========================================================",
        format_headers(headers),
        format_body_bytes(body)
    );
}

pub fn backend_request_raw(method: &str, url: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n=================== 后端请求（RAW） ===================\n[后端请求] {method} {url}\n[后端请求头]\n{}\n[后端请求体]\n{}\n=========================================================",
        format_headers_raw(headers),
        String::from_utf8_lossy(body),
    );
}

pub fn backend_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端响应 ========================\n[后端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_body_bytes(body)
    );
}

pub fn backend_response_raw(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n=================== 后端响应（RAW） ===================\n[后端响应] {} {}ms\n{}\n=========================================================",
        status,
        format_duration_ms(duration),
        String::from_utf8_lossy(body),
    );
}

fn is_secret_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "authorization" | "proxy-authorization" | "x-api-key" | "x-goog-api-key" | "cookie"
    )
}

fn format_headers(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers.iter() {
        let key = name.as_str();
        let val = if is_secret_header(key) {
            "***"
        } else {
            value.to_str().unwrap_or("<binary>")
        };
        out.push_str(key);
        out.push_str(": ");
        out.push_str(val);
        out.push('\n');
    }
    out
}

fn format_headers_raw(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers.iter() {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(value.to_str().unwrap_or("<non-utf8>"));
        out.push('\n');
    }
    out
}

fn format_body_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    // 大包不解析，只截断输出。
    const MAX_PARSE_BYTES: usize = 2 * 1024 * 1024;
    if bytes.len() > MAX_PARSE_BYTES {
        return format!(
            "(body too large: {} bytes)\n{}",
            bytes.len(),
            truncate_text_for_log(&String::from_utf8_lossy(&bytes[..64 * 1024]))
        );
    }

    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => match sonic_rs::to_string_pretty(&v) {
            Ok(s) => truncate_text_for_log(&s),
            Err(_) => truncate_text_for_log(&v.to_string()),
        },
        Err(_) => truncate_text_for_log(&String::from_utf8_lossy(bytes)),
    }
}

fn truncate_text_for_log(s: &str) -> String {
    const MAX_CHARS: usize = 32 * 1024;
    if s.chars().count() <= MAX_CHARS {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_CHARS).collect();
    out.push_str("...[TRUNCATED]");
    out
}
