pub mod bot;
pub mod config;
pub mod error;
pub mod gemini;
pub mod logging;
pub mod ollama;
pub mod quota;
pub mod relay;
pub mod server;

use anyhow::Context;
use quota::{Dispatcher, GenerationSettings, LocalClock};
use std::future::Future;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load().context("加载配置失败")?;

    init_tracing();

    if cfg.gemini_api_key.is_empty() {
        tracing::warn!("未设置 GEMINI_API_KEY，所有请求都会转到兜底后端");
    }

    let gemini = gemini::GeminiClient::new(&cfg).context("初始化 GeminiClient 失败")?;
    let ollama = ollama::OllamaClient::new(&cfg).context("初始化 OllamaClient 失败")?;

    let fallback_model = ollama.model().to_string();
    let dispatcher = Dispatcher::new(
        cfg.models.clone(),
        cfg.safety_margin,
        Arc::new(LocalClock),
        gemini,
        GenerationSettings {
            temperature: cfg.temperature,
            max_output_tokens: cfg.max_output_tokens,
        },
    );
    let relay = Arc::new(relay::Relay::new(dispatcher, ollama));

    let models: Vec<String> = cfg
        .models
        .iter()
        .map(|m| format!("{}:{}", m.short_name(), m.daily_limit))
        .collect();
    tracing::info!(
        models = %models.join(","),
        safety_margin = cfg.safety_margin,
        fallback = %fallback_model,
        "模型调度已就绪"
    );

    let server_state = Arc::new(server::ServerState {
        relay: relay.clone(),
        api_key: cfg.api_key.clone(),
    });
    let addr = format!("{}:{}", cfg.host, cfg.port);
    let http = server::serve(&addr, server_state, shutdown_signal());

    let telegram = async {
        if !cfg.telegram_enabled() {
            tracing::info!("未设置 BOT_TOKEN，跳过 Telegram 机器人");
            return std::future::pending().await;
        }
        let state = bot::BotState {
            relay: relay.clone(),
            reply_to_messages: cfg.reply_to_messages,
            log_level: cfg.log_level(),
        };
        bot::run(teloxide::Bot::new(&cfg.bot_token), state).await;
    };

    run_surfaces(http, telegram)
        .await
        .inspect_err(|e| tracing::error!(error = %e, "HTTP 服务异常退出"))
        .context("服务异常退出")?;

    Ok(())
}

/// HTTP 服务一旦结束（出错或优雅关闭）立即返回；机器人先停止时再等 HTTP 关闭。
async fn run_surfaces<H, B>(http: H, telegram: B) -> Result<(), error::AppError>
where
    H: Future<Output = Result<(), error::AppError>>,
    B: Future<Output = ()>,
{
    tokio::pin!(http);
    tokio::select! {
        result = &mut http => return result,
        () = telegram => {}
    }
    http.await
}

fn init_tracing() {
    // DEBUG 只控制聊天/后端详细日志块，常规运行日志由 RUST_LOG 控制。
    // 依赖库默认只输出 warn，本项目自身日志至少为 info。
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        EnvFilter::new("warn,gemini_relay=info")
    } else if env.contains("gemini_relay") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},gemini_relay=info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn http_failure_ends_the_run_while_bot_keeps_polling() {
        let http = async { Err(error::AppError::from(std::io::Error::other("address in use"))) };
        let telegram = std::future::pending::<()>();

        let result = tokio::time::timeout(Duration::from_secs(1), run_surfaces(http, telegram))
            .await
            .expect("run_surfaces should return as soon as HTTP fails");
        assert!(matches!(result, Err(error::AppError::Io(_))));
    }

    #[tokio::test]
    async fn bot_stop_waits_for_http_shutdown() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let http = async move {
            let _ = rx.await;
            Ok(())
        };
        let telegram = async move {
            let _ = tx.send(());
        };

        let result = tokio::time::timeout(Duration::from_secs(1), run_surfaces(http, telegram))
            .await
            .unwrap();
        assert!(result.is_ok());
    }
}
