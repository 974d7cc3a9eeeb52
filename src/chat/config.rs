//! 客户端配置
//!
//! 后端连接参数从环境变量读取（`.env` 支持），轮询/看门狗间隔按设备
//! 档位区分：移动端网络更不稳定，间隔调短

use tracing::{info, warn};

/// 环境变量名：后端基础 URL
pub const ENV_BASE_URL: &str = "TALK3_SUPABASE_URL";
/// 环境变量名：匿名访问密钥
pub const ENV_ANON_KEY: &str = "TALK3_SUPABASE_ANON_KEY";

/// 设备档位：决定消息同步器的看门狗与轮询间隔
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceProfile {
    #[default]
    Desktop,
    Mobile,
}

impl DeviceProfile {
    /// 消息订阅确认的看门狗时长（秒）
    pub fn msg_watchdog_secs(&self) -> u64 {
        match self {
            DeviceProfile::Desktop => 10,
            DeviceProfile::Mobile => 5,
        }
    }

    /// 消息增量轮询间隔（秒）
    pub fn msg_poll_secs(&self) -> u64 {
        match self {
            DeviceProfile::Desktop => 30,
            DeviceProfile::Mobile => 15,
        }
    }
}

/// 客户端配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 后端基础 URL，例如 `https://xyz.supabase.co`
    pub base_url: String,
    /// 匿名访问密钥（所有请求的 apikey）
    pub anon_key: String,
    /// 设备档位
    pub device: DeviceProfile,
    /// 实时连接心跳间隔（秒）
    pub heartbeat_secs: u64,
    /// 房间列表订阅确认看门狗（秒）
    pub room_watchdog_secs: u64,
    /// 房间列表全量轮询间隔（秒）
    pub room_poll_secs: u64,
}

impl ClientConfig {
    pub fn new(base_url: String, anon_key: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key,
            device: DeviceProfile::default(),
            heartbeat_secs: 25,
            room_watchdog_secs: 10,
            room_poll_secs: 30,
        }
    }

    /// 从环境变量构造（先尝试加载 `.env`）
    ///
    /// 变量缺失时返回"未配置"的空配置而不是错误：受影响的同步器会
    /// 直接给出空状态（见各同步器的 load 实现）
    pub fn from_env() -> Self {
        let _ = dotenv::dotenv();
        let base_url = std::env::var(ENV_BASE_URL).unwrap_or_default();
        let anon_key = std::env::var(ENV_ANON_KEY).unwrap_or_default();
        if base_url.is_empty() || anon_key.is_empty() {
            warn!(
                "[Config] ⚠️ 后端连接参数未配置（{} / {}），同步器将返回空状态",
                ENV_BASE_URL, ENV_ANON_KEY
            );
        } else {
            info!("[Config] ✅ 后端配置已加载: {}", base_url);
        }
        Self::new(base_url, anon_key)
    }

    /// 连接参数是否齐全
    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.anon_key.is_empty()
    }

    /// REST 存储端点
    pub fn rest_endpoint(&self) -> String {
        format!("{}/rest/v1", self.base_url)
    }

    /// 认证端点
    pub fn auth_endpoint(&self) -> String {
        format!("{}/auth/v1", self.base_url)
    }

    /// 边缘函数端点
    pub fn functions_endpoint(&self) -> String {
        format!("{}/functions/v1", self.base_url)
    }

    /// 实时连接 URL（http → ws）
    pub fn realtime_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        };
        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            ws_base, self.anon_key
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_profile_intervals() {
        assert_eq!(DeviceProfile::Desktop.msg_watchdog_secs(), 10);
        assert_eq!(DeviceProfile::Desktop.msg_poll_secs(), 30);
        assert_eq!(DeviceProfile::Mobile.msg_watchdog_secs(), 5);
        assert_eq!(DeviceProfile::Mobile.msg_poll_secs(), 15);
    }

    #[test]
    fn test_endpoints() {
        let cfg = ClientConfig::new("https://abc.supabase.co/".to_string(), "key1".to_string());
        assert_eq!(cfg.rest_endpoint(), "https://abc.supabase.co/rest/v1");
        assert_eq!(cfg.auth_endpoint(), "https://abc.supabase.co/auth/v1");
        assert_eq!(
            cfg.functions_endpoint(),
            "https://abc.supabase.co/functions/v1"
        );
        assert_eq!(
            cfg.realtime_url(),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=key1&vsn=1.0.0"
        );
    }

    #[test]
    fn test_is_configured() {
        assert!(ClientConfig::new("https://a.b".into(), "k".into()).is_configured());
        assert!(!ClientConfig::new(String::new(), "k".into()).is_configured());
        assert!(!ClientConfig::new("https://a.b".into(), String::new()).is_configured());
    }
}
