// src/rabbitmq/mod.rs
// Resilient RabbitMQ channel: connection recovery, consumers, publishing

pub mod broker;
pub mod errors;
pub mod lapin_broker;
pub mod memory;
pub mod routing;

mod channel;
mod connection;
mod consumer;
mod listener;
mod publisher;
mod shutdown;
mod topology;

// Re-export specific items to simplify imports elsewhere
pub use channel::RabbitChannel;
pub use connection::{ChannelConfig, ConnectionManager};
pub use consumer::{ConsumerRecord, ConsumerRegistry, MessageHandler};
pub use errors::{BusError, Result};
pub use listener::ListenerState;
pub use publisher::Publisher;
pub use shutdown::{InFlight, ShutdownCoordinator};
pub use topology::declare_exchange;
