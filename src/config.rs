use crate::error::AppError;
use crate::quota::ModelSpec;
use figment::Figment;
use figment::providers::Env;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8046;
const DEFAULT_TIMEOUT_MS: u64 = 180_000;
const DEFAULT_OLLAMA_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_OLLAMA_MODEL: &str = "qwen3-vl:4b";
const DEFAULT_TEMPERATURE: f32 = 0.6;
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 2048;
const DEFAULT_SAFETY_MARGIN: u32 = 1;

/// 默认模型列表（按偏好顺序）：便宜/快的模型排在前面。
pub const DEFAULT_GEMINI_MODELS: &str =
    "models/gemini-2.5-flash:20,models/gemini-3-flash:20,models/gemini-2.5-flash-lite:10";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub bot_token: String,
    pub reply_to_messages: bool,

    pub gemini_api_key: String,
    pub gemini_base_url: String,
    pub models: Vec<ModelSpec>,
    pub safety_margin: u32,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout_ms: u64,
    pub proxy: String,

    pub ollama_url: String,
    pub ollama_model: String,
    pub ollama_timeout_ms: u64,

    pub api_key: String,
    pub debug: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST", default, deserialize_with = "lenient_string")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "BOT_TOKEN", default, deserialize_with = "lenient_string")]
    bot_token: Option<String>,
    #[serde(alias = "REPLY_TO_MESSAGES", default, deserialize_with = "lenient_string")]
    reply_to_messages: Option<String>,

    #[serde(alias = "GEMINI_API_KEY", default, deserialize_with = "lenient_string")]
    gemini_api_key: Option<String>,
    #[serde(alias = "GEMINI_BASE_URL", default, deserialize_with = "lenient_string")]
    gemini_base_url: Option<String>,
    #[serde(alias = "GEMINI_MODELS", default, deserialize_with = "lenient_string")]
    gemini_models: Option<String>,
    #[serde(alias = "SAFETY_MARGIN")]
    safety_margin: Option<u32>,
    #[serde(alias = "TEMPERATURE")]
    temperature: Option<f32>,
    #[serde(alias = "MAX_OUTPUT_TOKENS")]
    max_output_tokens: Option<u32>,
    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "PROXY", default, deserialize_with = "lenient_string")]
    proxy: Option<String>,

    #[serde(alias = "OLLAMA_URL", default, deserialize_with = "lenient_string")]
    ollama_url: Option<String>,
    #[serde(alias = "OLLAMA_MODEL", default, deserialize_with = "lenient_string")]
    ollama_model: Option<String>,
    #[serde(alias = "OLLAMA_TIMEOUT")]
    ollama_timeout: Option<u64>,

    #[serde(alias = "API_KEY", default, deserialize_with = "lenient_string")]
    api_key: Option<String>,
    #[serde(alias = "DEBUG", default, deserialize_with = "lenient_string")]
    debug: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        load_dotenv();

        let raw = extract_raw(Figment::from(Env::raw()))?;
        let mut cfg = Self::from_raw(raw)?;

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        Ok(cfg)
    }

    fn from_raw(raw: RawEnv) -> Result<Self, AppError> {
        let models = parse_models(raw.gemini_models.as_deref().unwrap_or(DEFAULT_GEMINI_MODELS))?;
        let timeout_ms = positive_ms("TIMEOUT", raw.timeout, DEFAULT_TIMEOUT_MS)?;
        let ollama_timeout_ms =
            positive_ms("OLLAMA_TIMEOUT", raw.ollama_timeout, DEFAULT_OLLAMA_TIMEOUT_MS)?;

        Ok(Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            bot_token: raw.bot_token.unwrap_or_default().trim().to_string(),
            reply_to_messages: parse_bool(raw.reply_to_messages.as_deref()),
            gemini_api_key: raw.gemini_api_key.unwrap_or_default().trim().to_string(),
            gemini_base_url: non_empty_or(raw.gemini_base_url, DEFAULT_GEMINI_BASE_URL),
            models,
            safety_margin: raw.safety_margin.unwrap_or(DEFAULT_SAFETY_MARGIN),
            temperature: raw.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_output_tokens: raw.max_output_tokens.unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS),
            timeout_ms,
            proxy: raw.proxy.unwrap_or_default(),
            ollama_url: non_empty_or(raw.ollama_url, DEFAULT_OLLAMA_URL),
            ollama_model: non_empty_or(raw.ollama_model, DEFAULT_OLLAMA_MODEL),
            ollama_timeout_ms,
            api_key: raw.api_key.unwrap_or_default(),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
        })
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }

    pub fn telegram_enabled(&self) -> bool {
        !self.bot_token.is_empty()
    }
}

/// 解析 `name:limit,name:limit` 形式的模型列表。
///
/// 以最后一个 `:` 分割，模型名本身可以包含 `:`。
pub fn parse_models(value: &str) -> Result<Vec<ModelSpec>, AppError> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    for part in value.split(',') {
        let p = part.trim();
        if p.is_empty() {
            continue;
        }
        let Some((name, limit)) = p.rsplit_once(':') else {
            return Err(AppError::config(format!("模型配置缺少每日上限: {p}")));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::config(format!("模型名为空: {p}")));
        }
        let limit: u32 = limit
            .trim()
            .parse()
            .map_err(|_| AppError::config(format!("每日上限不是合法整数: {p}")))?;
        if limit == 0 {
            return Err(AppError::config(format!("每日上限必须大于 0: {p}")));
        }
        if !seen.insert(name.to_string()) {
            return Err(AppError::config(format!("模型重复: {name}")));
        }
        out.push(ModelSpec::new(name, limit));
    }

    if out.is_empty() {
        return Err(AppError::config("至少需要配置一个模型"));
    }
    Ok(out)
}

/// figment 会把 `true` / `123` 这类环境变量解析成布尔或数字，这里统一转回字符串。
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Bool(bool),
        UInt(u64),
        Int(i64),
        Float(f64),
        Str(String),
    }

    Ok(Option::<Scalar>::deserialize(deserializer)?.map(|v| match v {
        Scalar::Bool(b) => b.to_string(),
        Scalar::UInt(n) => n.to_string(),
        Scalar::Int(n) => n.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Str(s) => s,
    }))
}

fn extract_raw(figment: Figment) -> Result<RawEnv, AppError> {
    figment
        .extract::<RawEnv>()
        .map_err(|e| AppError::config(format!("环境变量格式错误: {e}")))
}

/// 生成调用必须有硬超时，0 不被接受。
fn positive_ms(key: &str, value: Option<u64>, default: u64) -> Result<u64, AppError> {
    match value {
        Some(0) => Err(AppError::config(format!("{key} 必须大于 0（毫秒）"))),
        Some(v) => Ok(v),
        None => Ok(default),
    }
}

fn parse_bool(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        // 已由真实环境变量设置的键优先，不被 .env 覆盖。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：修改进程环境变量为 unsafe。这里在启动阶段、尚未启动任何线程时调用。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 不越过仓库根目录。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let Some(parent) = dir.parent() else {
            break;
        };
        if parent == dir {
            break;
        }
        dir = parent;
    }

    None
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let raw = raw.trim();
    if raw.len() >= 2 {
        let bytes = raw.as_bytes();
        let (first, last) = (bytes[0], bytes[raw.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return Some((key.to_string(), raw[1..raw.len() - 1].to_string()));
        }
    }

    Some((key.to_string(), strip_inline_comment(raw).trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] != b'#' {
            continue;
        }
        if i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t' {
            return value[..i].trim_end();
        }
    }
    value
}
