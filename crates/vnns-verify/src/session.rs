// crates/vnns-verify/src/session.rs
//
// NetworkSession: an explicitly owned handle on one verification-network
// connection. Constructed once, passed to every component constructor, and
// closed when the pipeline shuts down. Calls made through a closed session
// fail with `NetworkError::SessionClosed`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use vnns_core::error::NetworkError;
use vnns_core::event::EventFilter;
use vnns_core::traits::{EventStream, VerificationNetwork};

pub struct NetworkSession {
    network: Arc<dyn VerificationNetwork>,
    domain_id: u32,
    opened_at: DateTime<Utc>,
    open: AtomicBool,
}

impl NetworkSession {
    /// Acquire a session on `network` for `domain_id`.
    pub fn open(network: Arc<dyn VerificationNetwork>, domain_id: u32) -> Arc<Self> {
        tracing::info!("Opened verification network session (domain {})", domain_id);
        Arc::new(Self {
            network,
            domain_id,
            opened_at: Utc::now(),
            open: AtomicBool::new(true),
        })
    }

    pub fn domain_id(&self) -> u32 {
        self.domain_id
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// The underlying network, if the session is still open.
    pub fn network(&self) -> Result<&dyn VerificationNetwork, NetworkError> {
        if self.is_open() {
            Ok(self.network.as_ref())
        } else {
            Err(NetworkError::SessionClosed)
        }
    }

    /// Subscribe to events for this session's domain.
    pub async fn subscribe(&self) -> Result<EventStream, NetworkError> {
        self.network()?
            .subscribe(EventFilter::domain(self.domain_id))
            .await
    }

    /// Release the session. Idempotent.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            tracing::info!(
                "Closed verification network session (domain {}, open since {})",
                self.domain_id,
                self.opened_at
            );
        }
    }
}

impl Drop for NetworkSession {
    fn drop(&mut self) {
        self.close();
    }
}
