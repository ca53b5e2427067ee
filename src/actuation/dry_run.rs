//! Dry-run 操作面：不打开浏览器，只记录会执行的动作

use std::time::Duration;

use async_trait::async_trait;

use super::{ActuationError, Actuator, ActuatorFactory, ProfileFacts};

pub struct DryRunActuator {
    settle: Duration,
    current: Option<String>,
    composing: bool,
    staged: Option<String>,
    running: bool,
}

impl DryRunActuator {
    pub fn new(settle: Duration) -> Self {
        Self {
            settle,
            current: None,
            composing: false,
            staged: None,
            running: true,
        }
    }

    fn ensure_running(&self) -> Result<(), ActuationError> {
        if self.running {
            Ok(())
        } else {
            Err(ActuationError::NotInitialized)
        }
    }
}

#[async_trait]
impl Actuator for DryRunActuator {
    async fn open(&mut self, locator: &str) -> Result<ProfileFacts, ActuationError> {
        self.ensure_running()?;
        if locator.trim().is_empty() {
            return Err(ActuationError::Navigation {
                locator: locator.to_string(),
                reason: "empty profile URL".to_string(),
            });
        }
        tokio::time::sleep(self.settle).await;
        tracing::info!(locator, "[dry-run] open profile");
        self.current = Some(locator.to_string());
        Ok(ProfileFacts::default())
    }

    async fn open_compose(&mut self) -> Result<(), ActuationError> {
        self.ensure_running()?;
        if self.current.is_none() {
            return Err(ActuationError::action("open message box", "no profile open"));
        }
        self.composing = true;
        Ok(())
    }

    async fn inject(&mut self, text: &str) -> Result<(), ActuationError> {
        self.ensure_running()?;
        if !self.composing {
            return Err(ActuationError::action("paste message", "message box not open"));
        }
        self.staged = Some(text.to_string());
        Ok(())
    }

    async fn confirm_send(&mut self) -> Result<(), ActuationError> {
        self.ensure_running()?;
        let text = self
            .staged
            .take()
            .ok_or_else(|| ActuationError::action("send message", "no message staged"))?;
        tracing::info!(
            locator = self.current.as_deref().unwrap_or_default(),
            chars = text.chars().count(),
            "[dry-run] send message"
        );
        Ok(())
    }

    async fn close_surface(&mut self) -> Result<(), ActuationError> {
        self.current = None;
        self.composing = false;
        self.staged = None;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), ActuationError> {
        self.running = false;
        self.close_surface().await
    }
}

/// 创建 dry-run 操作面
pub struct DryRunActuatorFactory {
    settle: Duration,
}

impl DryRunActuatorFactory {
    pub fn new(settle_delay_ms: u64) -> Self {
        Self {
            settle: Duration::from_millis(settle_delay_ms),
        }
    }
}

#[async_trait]
impl ActuatorFactory for DryRunActuatorFactory {
    async fn launch(&self) -> Result<Box<dyn Actuator>, ActuationError> {
        Ok(Box::new(DryRunActuator::new(self.settle)))
    }
}
