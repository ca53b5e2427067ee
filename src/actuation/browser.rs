//! Chrome 操作面：使用 Headless Chrome 控制真实浏览器
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! headless_chrome 为同步 API，所有调用放到 spawn_blocking 中执行。

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};

use super::{ActuationError, Actuator, ActuatorFactory, ProfileFacts};
use crate::config::BrowserSection;

const HEADLINE_SELECTOR: &str = ".text-body-medium.break-words, .top-card-layout__headline";
const EMPLOYER_SELECTOR: &str = ".inline-show-more-text, .top-card-layout__headline + div";
const MESSAGE_BUTTON_XPATH: &str =
    "//button[contains(text(), 'Message') or contains(@aria-label, 'Message')]";
const MESSAGE_MODAL_SELECTOR: &str = r#"div[data-view-name="messaging-modal"]"#;
const MESSAGE_FIELD_SELECTOR: &str = r#"div[contenteditable="true"], textarea[placeholder*="message"], div[data-placeholder*="message"]"#;
const SEND_BUTTON_XPATH: &str = "//button[contains(text(), 'Send') or contains(@aria-label, 'Send')]";

/// Chrome 操作面：一个浏览器进程，每个条目一个 Tab
pub struct ChromeActuator {
    browser: Arc<RwLock<Option<Browser>>>,
    tab: Option<Arc<Tab>>,
    page_timeout: Duration,
    settle: Duration,
}

impl ChromeActuator {
    fn active_tab(&self) -> Result<Arc<Tab>, ActuationError> {
        self.tab.clone().ok_or(ActuationError::NotInitialized)
    }

    /// 在阻塞线程上对当前 Tab 执行操作，完成后等待页面稳定
    async fn with_tab<T, F>(&self, action: &'static str, f: F) -> Result<T, ActuationError>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T, String> + Send + 'static,
    {
        let tab = self.active_tab()?;
        let settle = self.settle;
        tokio::task::spawn_blocking(move || {
            let out = f(&*tab)?;
            std::thread::sleep(settle);
            Ok(out)
        })
        .await
        .map_err(|e| ActuationError::action(action, format!("task join: {}", e)))?
        .map_err(|reason: String| ActuationError::action(action, reason))
    }
}

fn inner_text(tab: &Tab, selector: &str) -> Option<String> {
    tab.find_element(selector)
        .ok()
        .and_then(|el| el.get_inner_text().ok())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl Actuator for ChromeActuator {
    async fn open(&mut self, locator: &str) -> Result<ProfileFacts, ActuationError> {
        let browser = Arc::clone(&self.browser);
        let url = locator.to_string();
        let timeout = self.page_timeout;
        let settle = self.settle;

        tracing::info!(url = %url, "browser open profile");

        let result = tokio::task::spawn_blocking(move || {
            let guard = browser.read().map_err(|e| e.to_string())?;
            let browser = guard.as_ref().ok_or_else(|| "browser not running".to_string())?;

            let tab = browser
                .new_tab()
                .map_err(|e| format!("Browser tab failed: {}", e))?;
            tab.set_default_timeout(timeout);
            tab.navigate_to(&url)
                .map_err(|e| format!("Navigate failed: {}", e))?;
            tab.wait_for_element("main")
                .map_err(|e| format!("Page load failed: {}", e))?;

            std::thread::sleep(settle);

            let facts = ProfileFacts {
                headline: inner_text(&tab, HEADLINE_SELECTOR),
                employer: inner_text(&tab, EMPLOYER_SELECTOR),
            };
            Ok::<_, String>((tab, facts))
        })
        .await
        .map_err(|e| ActuationError::Navigation {
            locator: locator.to_string(),
            reason: format!("task join: {}", e),
        })?;

        match result {
            Ok((tab, facts)) => {
                self.tab = Some(tab);
                Ok(facts)
            }
            Err(reason) => Err(ActuationError::Navigation {
                locator: locator.to_string(),
                reason,
            }),
        }
    }

    async fn open_compose(&mut self) -> Result<(), ActuationError> {
        self.with_tab("open message box", |tab| {
            tab.wait_for_xpath(MESSAGE_BUTTON_XPATH)
                .map_err(|e| format!("Message button not found: {}", e))?
                .click()
                .map_err(|e| format!("Click failed: {}", e))?;
            tab.wait_for_element(MESSAGE_MODAL_SELECTOR)
                .map_err(|e| format!("Message box did not appear: {}", e))?;
            Ok(())
        })
        .await
    }

    async fn inject(&mut self, text: &str) -> Result<(), ActuationError> {
        let text = text.to_string();
        self.with_tab("paste message", move |tab| {
            tab.wait_for_element(MESSAGE_FIELD_SELECTOR)
                .map_err(|e| format!("Message field not found: {}", e))?
                .type_into(&text)
                .map_err(|e| format!("Type failed: {}", e))?;
            Ok(())
        })
        .await
    }

    async fn confirm_send(&mut self) -> Result<(), ActuationError> {
        self.with_tab("send message", |tab| {
            tab.wait_for_xpath(SEND_BUTTON_XPATH)
                .map_err(|e| format!("Send button not found: {}", e))?
                .click()
                .map_err(|e| format!("Click failed: {}", e))?;
            Ok(())
        })
        .await
    }

    async fn close_surface(&mut self) -> Result<(), ActuationError> {
        let Some(tab) = self.tab.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || tab.close(false).map(|_| ()).map_err(|e| e.to_string()))
            .await
            .map_err(|e| ActuationError::action("close tab", format!("task join: {}", e)))?
            .map_err(|reason| ActuationError::action("close tab", reason))
    }

    async fn shutdown(&mut self) -> Result<(), ActuationError> {
        let closed = self.close_surface().await;
        let browser = Arc::clone(&self.browser);
        tokio::task::spawn_blocking(move || {
            // 丢弃 Browser 即结束 Chrome 进程
            if let Ok(mut guard) = browser.write() {
                guard.take();
            }
        })
        .await
        .map_err(|e| ActuationError::action("stop browser", format!("task join: {}", e)))?;
        tracing::info!("browser stopped");
        closed
    }
}

/// 按 [browser] 配置启动 Chrome
pub struct ChromeActuatorFactory {
    settings: BrowserSection,
}

impl ChromeActuatorFactory {
    pub fn new(settings: BrowserSection) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ActuatorFactory for ChromeActuatorFactory {
    async fn launch(&self) -> Result<Box<dyn Actuator>, ActuationError> {
        let headless = self.settings.headless;
        let profile_dir = self.settings.resolve_profile_dir().filter(|p| p.exists());
        let page_timeout = Duration::from_secs(self.settings.page_timeout_secs.max(1));

        let browser = tokio::task::spawn_blocking(move || {
            let options = LaunchOptions::default_builder()
                .headless(headless)
                .user_data_dir(profile_dir)
                .idle_browser_timeout(Duration::from_secs(3600))
                .build()
                .map_err(|e| format!("Invalid launch options: {}", e))?;
            Browser::new(options).map_err(|e| format!("Chrome launch failed: {}. Install Chrome/Chromium.", e))
        })
        .await
        .map_err(|e| ActuationError::Launch(format!("task join: {}", e)))?
        .map_err(ActuationError::Launch)?;

        tracing::info!(headless, "Chrome launched");

        Ok(Box::new(ChromeActuator {
            browser: Arc::new(RwLock::new(Some(browser))),
            tab: None,
            page_timeout,
            settle: Duration::from_millis(self.settings.settle_delay_ms),
        }))
    }
}
