//! 网关层：会话事件、按会话分发的事件总线，以及 HTTP/WebSocket 接入

mod bus;
mod event;
#[cfg(feature = "server")]
pub mod server;

pub use bus::EventBus;
pub use event::SessionEvent;
#[cfg(feature = "server")]
pub use server::{build_router, ApiError, AppState};
