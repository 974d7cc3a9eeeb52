//! 按需整房翻译调用
//!
//! 翻译本身由远端函数完成（逐条调用 LLM 并回写 content_en），这里只是
//! 触发入口；译文通过消息表的 UPDATE 事件流回，或由调用方随后 refresh

use crate::chat::config::ClientConfig;
use crate::chat::types::parse_rest_error;
use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

/// 翻译结果摘要
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TranslateOutcome {
    /// 本次翻译成功条数
    pub translated: u32,
    /// 待翻译总条数
    pub total: u32,
    /// 服务端附带说明（如"没有需要翻译的消息"）
    pub message: Option<String>,
}

/// 远端函数客户端
pub struct TranslateApi {
    http: reqwest::Client,
    functions_base: String,
}

impl TranslateApi {
    pub fn new(config: &ClientConfig, access_token: &str) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&format!("Bearer {}", access_token))
                .context("无效的访问令牌")?,
        );
        headers.insert(
            reqwest::header::HeaderName::from_static("apikey"),
            reqwest::header::HeaderValue::from_str(&config.anon_key).context("无效的 anon key")?,
        );
        let http = reqwest::ClientBuilder::new()
            .default_headers(headers)
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self {
            http,
            functions_base: config.functions_endpoint(),
        })
    }

    /// 触发整房翻译，返回翻译条数摘要
    pub async fn translate_room(&self, room_id: i64) -> Result<TranslateOutcome> {
        let url = format!("{}/translate-room", self.functions_base);
        info!("[Translate] 📡 触发整房翻译: room={}", room_id);

        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "roomId": room_id }))
            .send()
            .await
            .context("翻译请求失败")?;

        let status = response.status();
        let text = response.text().await.context("读取翻译响应失败")?;
        if !status.is_success() {
            let err = parse_rest_error(status.as_u16(), &text);
            return Err(anyhow::Error::new(err).context("翻译失败"));
        }

        let outcome: TranslateOutcome =
            serde_json::from_str(&text).context("翻译响应解析失败")?;
        info!(
            "[Translate] ✅ 翻译完成: {}/{} 条",
            outcome.translated, outcome.total
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_parses_full_response() {
        let outcome: TranslateOutcome = serde_json::from_str(
            r#"{"message":"Translation completed","translated":4,"total":5}"#,
        )
        .unwrap();
        assert_eq!(outcome.translated, 4);
        assert_eq!(outcome.total, 5);
    }

    #[test]
    fn test_outcome_parses_nothing_to_translate() {
        let outcome: TranslateOutcome =
            serde_json::from_str(r#"{"message":"No messages to translate","translated":0}"#)
                .unwrap();
        assert_eq!(outcome.translated, 0);
        assert_eq!(outcome.total, 0);
        assert!(outcome.message.is_some());
    }
}
