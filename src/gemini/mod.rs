//! Gemini（Generative Language API）主后端。

pub mod client;
pub mod types;

pub use client::{GeminiClient, ProviderError};
