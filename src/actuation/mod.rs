//! 页面操作层：打开资料页、打开消息框、填入文本、确认发送
//!
//! 引擎只依赖 `Actuator` / `ActuatorFactory` 两个 trait；
//! 实现有 Headless Chrome（feature "browser"）与 dry-run 两种。

#[cfg(feature = "browser")]
pub mod browser;
pub mod dry_run;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{BrowserMode, BrowserSection};

#[cfg(feature = "browser")]
pub use browser::ChromeActuatorFactory;
pub use dry_run::{DryRunActuator, DryRunActuatorFactory};

/// 资料页上提取到的信息，空字段由调用方回退
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileFacts {
    pub headline: Option<String>,
    pub employer: Option<String>,
}

/// 页面操作错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActuationError {
    #[error("Browser launch failed: {0}")]
    Launch(String),

    #[error("Failed to open profile {locator}: {reason}")]
    Navigation { locator: String, reason: String },

    #[error("Failed to {action}: {reason}")]
    Action { action: String, reason: String },

    #[error("Browser not initialized")]
    NotInitialized,
}

impl ActuationError {
    pub fn action(action: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        ActuationError::Action {
            action: action.into(),
            reason: reason.to_string(),
        }
    }
}

/// 一个会话独占的页面操作面
#[async_trait]
pub trait Actuator: Send {
    /// 打开资料页并提取信息
    async fn open(&mut self, locator: &str) -> Result<ProfileFacts, ActuationError>;

    /// 打开消息输入框
    async fn open_compose(&mut self) -> Result<(), ActuationError>;

    /// 填入消息文本
    async fn inject(&mut self, text: &str) -> Result<(), ActuationError>;

    /// 点击发送
    async fn confirm_send(&mut self) -> Result<(), ActuationError>;

    /// 关闭当前条目的页面
    async fn close_surface(&mut self) -> Result<(), ActuationError>;

    /// 释放全部资源
    async fn shutdown(&mut self) -> Result<(), ActuationError>;
}

/// 为每个处理循环创建操作面
#[async_trait]
pub trait ActuatorFactory: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn Actuator>, ActuationError>;
}

/// 按配置选择实现
///
/// 要求 chrome 但未启用 browser feature 时退化为 dry-run
pub fn create_actuator_factory(settings: &BrowserSection) -> Arc<dyn ActuatorFactory> {
    match settings.mode {
        #[cfg(feature = "browser")]
        BrowserMode::Chrome => {
            tracing::info!(headless = settings.headless, "Using Chrome actuator");
            Arc::new(ChromeActuatorFactory::new(settings.clone()))
        }
        #[cfg(not(feature = "browser"))]
        BrowserMode::Chrome => {
            tracing::warn!("Chrome actuator requested but browser feature not enabled, using dry-run");
            Arc::new(DryRunActuatorFactory::new(settings.settle_delay_ms))
        }
        BrowserMode::DryRun => {
            tracing::info!("Using dry-run actuator");
            Arc::new(DryRunActuatorFactory::new(settings.settle_delay_ms))
        }
    }
}
