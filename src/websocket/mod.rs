//! WebSocket module for exchange connection management

mod client;
mod dispatcher;
mod subscription;

pub use client::{ConnectionSupervisor, FrameReader, Inbound};
pub use dispatcher::{backoff, ensure_started, route_frame, DispatchState, Dispatcher};
pub use subscription::{Ack, Confirmation, SubscriptionManager};
