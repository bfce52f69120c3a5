//! A minimal illustrative plugin, built in-process on top of
//! [`crate::transport::BuiltinTransport`].
//!
//! This is not a sample of any particular real plugin; it exists to show
//! how a builtin is wired up. It only observes `CreateContainer` and logs
//! the container id, leaving the adjustment empty.

use async_trait::async_trait;

use crate::api;
use crate::error::Result;
use crate::transport::{BuiltinHandlers, BuiltinTransport, PluginTransport};

/// Logs container creation and otherwise does nothing.
pub struct LoggingPlugin {
    name: String,
}

impl LoggingPlugin {
    pub fn new(name: impl Into<String>) -> Self {
        LoggingPlugin { name: name.into() }
    }

    pub fn into_transport(self) -> Box<dyn PluginTransport> {
        BuiltinTransport::new(self)
    }
}

#[async_trait]
impl BuiltinHandlers for LoggingPlugin {
    async fn create_container(&self, req: api::CreateContainerRequest) -> Result<api::CreateContainerResponse> {
        if let Some(container) = req.container.as_ref() {
            log::info!("{}: observed container {}", self.name, container.id);
        }
        Ok(api::CreateContainerResponse::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logging_plugin_returns_empty_adjustment() {
        let transport = LoggingPlugin::new("logger").into_transport();
        let mut req = api::CreateContainerRequest::new();
        let mut container = api::Container::new();
        container.id = "c1".to_string();
        req.container = protobuf::MessageField::some(container);
        let resp = transport.create_container(req).await.unwrap();
        assert!(resp.adjustment.is_none());
    }
}
