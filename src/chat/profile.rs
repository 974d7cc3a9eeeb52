//! 本人资料同步
//!
//! 登录后加载自己的资料行，缺行时就地创建（显示名默认取邮箱 @ 前缀）；
//! 资料行的远端更新通过实时事件回填

use crate::chat::realtime::{ChannelHandle, ChannelHandler, ChannelSpec, PgBinding, RealtimeClient};
use crate::chat::store::api::RestStore;
use crate::chat::store::types::{NewProfile, ProfileRow, ProfileUpdate};
use crate::chat::types::{display_name, ChangeEvent, ChannelState, EventKind};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// 资料变化回调
#[async_trait]
pub trait ProfileListener: Send + Sync {
    async fn on_profile_changed(&self, profile: ProfileRow);
}

/// 空实现（默认监听器）
pub struct EmptyProfileListener;

#[async_trait]
impl ProfileListener for EmptyProfileListener {
    async fn on_profile_changed(&self, _profile: ProfileRow) {}
}

/// 本人资料同步器
pub struct ProfileSyncer {
    user_id: String,
    email: Option<String>,
    store: Arc<RestStore>,
    listener: RwLock<Arc<dyn ProfileListener>>,
    profile: StdMutex<Option<ProfileRow>>,
    channel: tokio::sync::Mutex<Option<ChannelHandle>>,
}

struct ProfileFeedHandler {
    syncer: Weak<ProfileSyncer>,
}

#[async_trait]
impl ChannelHandler for ProfileFeedHandler {
    async fn on_event(&self, event: ChangeEvent) {
        if event.kind != EventKind::Update {
            return;
        }
        let Some(syncer) = self.syncer.upgrade() else {
            return;
        };
        match event.decode_new::<ProfileRow>() {
            Ok(profile) => syncer.apply_remote(profile).await,
            Err(e) => warn!("[Profile] 资料事件解析失败: {}", e),
        }
    }

    async fn on_state(&self, state: ChannelState) {
        debug!("[Profile] 通道状态: {:?}", state);
    }
}

impl ProfileSyncer {
    pub fn new(user_id: String, email: Option<String>, store: Arc<RestStore>) -> Self {
        Self {
            user_id,
            email,
            store,
            listener: RwLock::new(Arc::new(EmptyProfileListener)),
            profile: StdMutex::new(None),
            channel: tokio::sync::Mutex::new(None),
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn ProfileListener>) {
        let mut slot = self
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = listener;
    }

    fn listener(&self) -> Arc<dyn ProfileListener> {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn profile(&self) -> Option<ProfileRow> {
        self.profile
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 显示名兜底填充（资料没有名字时用邮箱 @ 前缀）
    fn with_default_name(&self, mut profile: ProfileRow) -> ProfileRow {
        if profile.name.as_deref().map_or(true, str::is_empty) {
            profile.name = Some(display_name(None, self.email.as_deref()));
        }
        profile
    }

    async fn apply_remote(&self, profile: ProfileRow) {
        let profile = self.with_default_name(profile);
        *self
            .profile
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(profile.clone());
        self.listener().on_profile_changed(profile).await;
    }

    /// 加载资料；缺行时就地创建
    pub async fn load(&self) {
        if !self.store.is_configured() {
            return;
        }
        let loaded = match self.store.profile_by_id(&self.user_id).await {
            Ok(Some(profile)) => Some(profile),
            Ok(None) => {
                // 注册后首次登录：资料行还不存在
                let default_name = display_name(None, self.email.as_deref());
                info!("[Profile] 🆕 资料不存在，创建默认资料: {}", default_name);
                match self
                    .store
                    .insert_profile(&NewProfile {
                        id: &self.user_id,
                        email: self.email.as_deref(),
                        name: &default_name,
                    })
                    .await
                {
                    Ok(profile) => Some(profile),
                    Err(e) => {
                        warn!("[Profile] ⚠️ 资料创建失败: {}", e);
                        None
                    }
                }
            }
            Err(e) => {
                warn!("[Profile] ⚠️ 资料加载失败: {}", e);
                None
            }
        };
        if let Some(profile) = loaded {
            self.apply_remote(profile).await;
        }
    }

    /// 更新显示名 / 状态签名
    pub async fn update(
        &self,
        name: Option<String>,
        status_msg: Option<String>,
    ) -> Result<ProfileRow> {
        let updated = self
            .store
            .update_profile(
                &self.user_id,
                &ProfileUpdate {
                    name,
                    status_msg,
                    updated_at: Utc::now(),
                },
            )
            .await?;
        info!("[Profile] ✅ 资料已更新");
        self.apply_remote(updated.clone()).await;
        Ok(updated)
    }

    /// 订阅自己资料行的更新
    pub async fn attach(self: &Arc<Self>, realtime: &RealtimeClient) -> Result<()> {
        let spec = ChannelSpec {
            name: format!("profile:{}", self.user_id),
            broadcast_self: true,
            join_timeout: Duration::from_secs(10),
            bindings: vec![PgBinding::with_filter(
                "*",
                "profiles",
                format!("id=eq.{}", self.user_id),
            )],
        };
        let handler = Arc::new(ProfileFeedHandler {
            syncer: Arc::downgrade(self),
        });
        let handle = realtime.subscribe(spec, handler).await?;
        *self.channel.lock().await = Some(handle);
        Ok(())
    }

    pub async fn detach(&self) {
        let handle = self.channel.lock().await.take();
        if let Some(handle) = handle {
            handle.leave().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::config::ClientConfig;

    fn test_syncer() -> Arc<ProfileSyncer> {
        let cfg = ClientConfig::new(String::new(), String::new());
        let store = Arc::new(RestStore::new(&cfg, "").unwrap());
        Arc::new(ProfileSyncer::new(
            "me".to_string(),
            Some("mina@example.com".to_string()),
            store,
        ))
    }

    #[tokio::test]
    async fn test_remote_update_fills_default_name() {
        let syncer = test_syncer();
        syncer
            .apply_remote(ProfileRow {
                id: "me".to_string(),
                email: Some("mina@example.com".to_string()),
                name: None,
                ..Default::default()
            })
            .await;
        let profile = syncer.profile().unwrap();
        assert_eq!(profile.name.as_deref(), Some("mina"));
    }

    #[tokio::test]
    async fn test_remote_update_keeps_explicit_name() {
        let syncer = test_syncer();
        syncer
            .apply_remote(ProfileRow {
                id: "me".to_string(),
                name: Some("민아".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(syncer.profile().unwrap().name.as_deref(), Some("민아"));
    }

    #[tokio::test]
    async fn test_load_unconfigured_store_is_noop() {
        let syncer = test_syncer();
        syncer.load().await;
        assert!(syncer.profile().is_none());
    }
}
