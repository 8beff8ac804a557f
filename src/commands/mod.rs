//! Command implementations

pub mod connect;
pub mod sdk;

use anyhow::{Context, Result};

use crate::cli::{CommandContext, CommandRegistry};
use crate::connection::ConnectionTarget;
use crate::sdk::SdkManager;
use crate::transport::{DebugOptions, PebbleConnection};

/// Every command the tool offers, in help order.
pub fn registry() -> Result<CommandRegistry> {
    let mut registry = CommandRegistry::new();
    registry.register(Box::new(connect::ConnectCommand))?;
    registry.register(Box::new(sdk::SdkCommand))?;
    Ok(registry)
}

/// Connect to the watch selected by the shared options and start reading
pub async fn connect_watch(ctx: &CommandContext) -> Result<PebbleConnection> {
    let target = ConnectionTarget::resolve(&ctx.shared, |key| std::env::var(key).ok())?;
    let transport = target.transport(ctx.sdk.as_deref().map(SdkManager::persist_dir))?;
    let description = transport.describe();

    let mut connection =
        PebbleConnection::new(transport, DebugOptions::from_verbosity(ctx.shared.verbose));
    connection
        .connect()
        .await
        .with_context(|| format!("Could not connect to {description}"))?;
    connection.run_async()?;

    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lists_commands_in_order() {
        let registry = registry().unwrap();
        assert_eq!(registry.names(), vec!["connect", "sdk"]);
        registry.cli().debug_assert();
    }
}
