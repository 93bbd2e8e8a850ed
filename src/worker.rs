// src/worker.rs
// Relays processed actions from the actions exchange to the events exchange

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::WorkerConfig;
use crate::message::InboundMessage;
use crate::rabbitmq::{Publisher, RabbitChannel, Result};

/// Event published for every action the worker handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionProcessed {
    pub action: String,
    pub source_message_id: Option<String>,
    pub payload: serde_json::Value,
    pub processed_at: DateTime<Utc>,
}

pub fn processed_routing_key(action_key: &str) -> String {
    format!("{}.processed", action_key)
}

/// Declares both exchanges and registers one consumer per action routing
/// key. Each queue is named after its routing key.
pub async fn start(channel: &RabbitChannel, config: &WorkerConfig) -> Result<()> {
    channel
        .declare_exchange(&config.actions_exchange, config.assume_exchanges_exist)
        .await?;
    channel
        .declare_exchange(&config.events_exchange, config.assume_exchanges_exist)
        .await?;

    for key in &config.action_routing_keys {
        let publisher = channel.publisher();
        let events = config.events_exchange.clone();
        channel
            .register_consumer(&config.actions_exchange, key, key, move |message: Arc<InboundMessage>| {
                relay(publisher.clone(), events.clone(), message)
            })
            .await?;
    }

    info!(
        actions = %config.actions_exchange,
        events = %config.events_exchange,
        consumers = config.action_routing_keys.len(),
        "Worker started"
    );
    Ok(())
}

async fn relay(
    publisher: Arc<Publisher>,
    events_exchange: String,
    message: Arc<InboundMessage>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = message
        .json()
        .with_context(|| format!("action on `{}` is not valid JSON", message.routing_key))?;

    let event = ActionProcessed {
        action: message.routing_key.clone(),
        source_message_id: message.message_id.clone(),
        payload,
        processed_at: Utc::now(),
    };
    let routing_key = processed_routing_key(&message.routing_key);
    publisher
        .publish(&event, &events_exchange, &routing_key, true)
        .await
        .with_context(|| format!("failed to publish `{}`", routing_key))?;

    debug!(action = %event.action, routing_key = %routing_key, "Action relayed");
    Ok(())
}
