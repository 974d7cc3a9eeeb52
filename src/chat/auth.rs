//! 认证模块
//!
//! 密码登录，返回访问令牌与用户信息；令牌的 JWT 载荷在客户端侧解码
//! （仅读取 sub / exp 等声明，不做签名校验）

use crate::chat::config::ClientConfig;
use crate::chat::types::parse_rest_error;
use anyhow::{Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct PasswordLoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

/// 登录用户信息（认证端点返回）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthUser {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// 登录会话
#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub user: AuthUser,
}

/// JWT 载荷中关心的声明
#[derive(Debug, Clone, Deserialize, Default)]
pub struct JwtClaims {
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub exp: i64,
    #[serde(default)]
    pub email: Option<String>,
}

impl Session {
    /// 当前用户 ID：优先用响应里的 user，缺失时从令牌 sub 声明取
    pub fn user_id(&self) -> Result<String> {
        if !self.user.id.is_empty() {
            return Ok(self.user.id.clone());
        }
        let claims = decode_jwt_claims(&self.access_token)?;
        if claims.sub.is_empty() {
            anyhow::bail!("访问令牌缺少 sub 声明");
        }
        Ok(claims.sub)
    }

    /// 令牌在给定时刻是否已过期（exp 声明缺失时视为未过期）
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match decode_jwt_claims(&self.access_token) {
            Ok(claims) if claims.exp > 0 => now.timestamp() >= claims.exp,
            _ => false,
        }
    }
}

/// 解码 JWT 载荷（base64url，无签名校验）
pub fn decode_jwt_claims(token: &str) -> Result<JwtClaims> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("令牌格式错误（不是 JWT）"))?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .context("令牌载荷 base64 解码失败")?;
    serde_json::from_slice(&bytes).context("令牌载荷 JSON 解析失败")
}

/// 密码登录
pub async fn login_async(config: &ClientConfig, email: &str, password: &str) -> Result<Session> {
    if !config.is_configured() {
        anyhow::bail!("后端连接参数未配置，无法登录");
    }

    let client = reqwest::Client::new();
    let url = format!("{}/token?grant_type=password", config.auth_endpoint());

    info!("[Auth] 🔐 正在登录: {}", email);
    debug!("[Auth]   请求URL: {}", url);

    let response = client
        .post(&url)
        .header("apikey", &config.anon_key)
        .json(&PasswordLoginRequest { email, password })
        .send()
        .await
        .context("登录请求失败")?;

    let status = response.status();
    let text = response.text().await.context("读取登录响应失败")?;
    if !status.is_success() {
        let err = parse_rest_error(status.as_u16(), &text);
        anyhow::bail!("登录失败: {}", err);
    }

    let session: Session = serde_json::from_str(&text).context("登录响应解析失败")?;
    info!("[Auth] ✅ 登录成功，用户ID: {}", session.user_id()?);
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jwt(claims: &serde_json::Value) -> String {
        let engine = &base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = engine.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = engine.encode(claims.to_string().as_bytes());
        format!("{}.{}.sig", header, payload)
    }

    #[test]
    fn test_decode_jwt_claims() {
        let token = fake_jwt(&serde_json::json!({
            "sub": "user-1",
            "exp": 1_900_000_000i64,
            "email": "a@b.c"
        }));
        let claims = decode_jwt_claims(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.exp, 1_900_000_000);
        assert_eq!(claims.email.as_deref(), Some("a@b.c"));
    }

    #[test]
    fn test_decode_rejects_non_jwt() {
        assert!(decode_jwt_claims("not-a-token").is_err());
    }

    #[test]
    fn test_session_user_id_falls_back_to_sub() {
        let token = fake_jwt(&serde_json::json!({"sub": "user-9", "exp": 0}));
        let session = Session {
            access_token: token,
            token_type: "bearer".into(),
            expires_in: 3600,
            refresh_token: String::new(),
            user: AuthUser::default(),
        };
        assert_eq!(session.user_id().unwrap(), "user-9");
    }

    #[test]
    fn test_session_expiry() {
        let token = fake_jwt(&serde_json::json!({"sub": "u", "exp": 1_000}));
        let session = Session {
            access_token: token,
            token_type: String::new(),
            expires_in: 0,
            refresh_token: String::new(),
            user: AuthUser::default(),
        };
        let before = DateTime::<Utc>::from_timestamp(999, 0).unwrap();
        let after = DateTime::<Utc>::from_timestamp(1_001, 0).unwrap();
        assert!(!session.is_expired(before));
        assert!(session.is_expired(after));
    }
}
