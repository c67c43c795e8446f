//! Builds the module registry from configuration.
//!
//! Modules are registered explicitly; a provider or listener takes part
//! when its configuration section enables it.

use crate::config::Config;
use crate::modules::ModuleRegistry;
use crate::polling::PollingPolicy;
use crate::providers::{ObservatoryModule, SlackListener, SsllabsModule, WebhookListener};
use crate::server::ApiServerModule;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Register every enabled module.
pub fn load_registry(config: &Config) -> Result<ModuleRegistry> {
    let policy = PollingPolicy::from(&config.polling);
    let mut builder = ModuleRegistry::builder();

    if config.providers.ssllabs.enabled {
        let module = SsllabsModule::new(&config.providers.ssllabs, policy)
            .context("Failed to create the SSL Labs module")?;
        builder = builder.analysis(Arc::new(module))?;
    }

    if config.providers.observatory.enabled {
        let module = ObservatoryModule::new(&config.providers.observatory)
            .context("Failed to create the Observatory module")?;
        builder = builder.analysis(Arc::new(module))?;
    }

    if config.listeners.slack.enabled {
        let listener = SlackListener::new(&config.listeners.slack)
            .context("Failed to create the Slack listener")?;
        builder = builder.listener(Arc::new(listener))?;
    }

    if config.listeners.webhook.enabled {
        let listener = WebhookListener::new(&config.listeners.webhook)
            .context("Failed to create the webhook listener")?;
        builder = builder.listener(Arc::new(listener))?;
    }

    let timeout = config.analysis.timeout_seconds.map(Duration::from_secs);
    builder = builder.server(Arc::new(ApiServerModule::new().with_timeout(timeout)))?;

    let registry = builder.build();
    debug!("Registered {} module(s)", registry.len());
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModuleKind;

    #[test]
    fn test_default_registry() {
        let registry = load_registry(&Config::default()).unwrap();

        let ids: Vec<_> = registry
            .descriptors()
            .iter()
            .map(|d| (d.id.as_str(), d.kind))
            .collect();
        assert_eq!(
            ids,
            vec![
                ("api", ModuleKind::Server),
                ("observatory", ModuleKind::Analysis),
                ("ssllabs", ModuleKind::Analysis),
            ]
        );
        assert!(registry.listeners().is_empty());
        assert!(registry.server("api").is_ok());
    }

    #[test]
    fn test_enabled_sections_are_registered() {
        let mut config = Config::default();
        config.providers.observatory.enabled = false;
        config.listeners.slack.enabled = true;
        config.listeners.webhook.enabled = true;
        config.listeners.webhook.url = "https://hooks.example.com/grades".to_string();

        let registry = load_registry(&config).unwrap();
        assert!(registry.analysis("observatory").is_err());
        assert!(registry.analysis("ssllabs").is_ok());

        let listeners: Vec<_> = registry.listeners().iter().map(|l| l.id().to_string()).collect();
        assert_eq!(listeners, vec!["slack", "webhook"]);
    }
}
