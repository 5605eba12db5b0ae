use crate::access::AccessPolicy;
use crate::admission::AdmissionController;
use crate::mime::MimeResolver;
use crate::registry::TokenRegistry;
use crate::relay::StreamRelay;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Count of open connections on the public listener.
#[derive(Clone, Default)]
pub struct ConnectionGauge(Arc<AtomicUsize>);

impl ConnectionGauge {
    pub fn open(&self) -> OpenConnection {
        self.0.fetch_add(1, Ordering::Relaxed);
        OpenConnection(self.0.clone())
    }

    pub fn current(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counted until dropped.
pub struct OpenConnection(Arc<AtomicUsize>);

impl Drop for OpenConnection {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Shared handles for both listeners. Every field is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub registry: TokenRegistry,
    pub admission: AdmissionController,
    pub relay: StreamRelay,
    pub access: AccessPolicy,
    pub mime: MimeResolver,
    pub public_base_url: String,
    pub trust_forwarded_for: bool,
    pub connections: ConnectionGauge,
}

impl AppState {
    pub fn new(
        registry: TokenRegistry,
        admission: AdmissionController,
        relay: StreamRelay,
        access: AccessPolicy,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            admission,
            relay,
            access,
            mime: MimeResolver,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            trust_forwarded_for: false,
            connections: ConnectionGauge::default(),
        }
    }

    pub fn with_trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    pub fn stream_url(&self, token: &str) -> String {
        format!("{}/stream/{token}", self.public_base_url)
    }

    pub fn download_url(&self, token: &str) -> String {
        format!("{}/download/{token}", self.public_base_url)
    }
}
