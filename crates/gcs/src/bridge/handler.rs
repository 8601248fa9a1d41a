//! Request handlers and the registry the bridge dispatches through.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gcs_bridge::{ProtocolVersion, Request, RequestKind, ResponseBody};

use crate::error::HandlerError;

/// Per-request metadata handed to a handler alongside the decoded request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: u32,
    pub kind: RequestKind,
    pub version: ProtocolVersion,
    /// Set on V4 connections, generated when the host sent none.
    pub activity_id: Option<String>,
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        ctx: RequestContext,
        request: Request,
    ) -> Result<ResponseBody, HandlerError>;
}

/// Collects handlers before the bridge starts. Built once, then frozen.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<RequestKind, Arc<dyn Handler>>,
}

impl HandlerRegistryBuilder {
    pub fn register(&mut self, kind: RequestKind, handler: Arc<dyn Handler>) -> &mut Self {
        if self.handlers.insert(kind, handler).is_some() {
            tracing::warn!(%kind, "Replacing previously registered handler");
        }
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
        }
    }
}

/// Read-only map from request kind to handler.
pub struct HandlerRegistry {
    handlers: HashMap<RequestKind, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn get(&self, kind: RequestKind) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(&kind)
    }

    pub fn contains(&self, kind: RequestKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
