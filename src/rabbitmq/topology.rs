// src/rabbitmq/topology.rs
// Exchange declaration

use tracing::debug;

use super::broker::{ExchangeDeclaration, Session};
use super::errors::Result;

/// Declares a durable, non-auto-deleted topic exchange. With `assume_exists`
/// the exchange is only checked for (passive declare) and never created,
/// for deployments where another process owns the topology.
pub async fn declare_exchange(session: &dyn Session, name: &str, assume_exists: bool) -> Result<()> {
    let declaration = ExchangeDeclaration::topic(name, assume_exists);
    session.declare_exchange(&declaration).await?;

    debug!(
        exchange = %name,
        kind = %declaration.kind,
        passive = assume_exists,
        "RabbitMQ: Exchange is declared"
    );
    Ok(())
}
