//! Reach - 逐条外联会话引擎
//!
//! 模块划分：
//! - **actuation**: 目标站点操作（Chrome 控制 / dry-run）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 状态机、会话监管、倒计时、处理循环、编排器与关闭
//! - **gateway**: 会话事件、事件总线、HTTP + WebSocket 接入
//! - **ingest**: 背景文档与联系人列表解析
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）与消息草拟
//! - **observability**: 运维日志初始化
//! - **store**: 会话、队列条目与活动日志的存储（内存 / SQLite）

pub mod actuation;
pub mod config;
pub mod core;
pub mod gateway;
pub mod ingest;
pub mod llm;
pub mod observability;
pub mod store;

pub use crate::core::{EngineError, Orchestrator};
