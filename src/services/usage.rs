use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::db::queries;
use crate::services::clock::Clock;

/// Spend limiter consulted before every paid interpretation call.
pub trait UsageGuard: Send + Sync {
    fn allow(&self) -> bool;
    fn record(&self, session_id: &str, tokens: u64);
}

/// Never denies. Used when no paid interpreter is configured.
pub struct Unmetered;

impl UsageGuard for Unmetered {
    fn allow(&self) -> bool {
        true
    }

    fn record(&self, _session_id: &str, _tokens: u64) {}
}

/// Token ledger in sqlite with a hard dollar ceiling. Any ledger error denies.
pub struct LedgerUsageGuard {
    db: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    limit_dollars: f64,
    cost_per_1k_tokens: f64,
}

impl LedgerUsageGuard {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        clock: Arc<dyn Clock>,
        limit_dollars: f64,
        cost_per_1k_tokens: f64,
    ) -> Self {
        Self {
            db,
            clock,
            limit_dollars,
            cost_per_1k_tokens,
        }
    }

    pub fn projected_cost(&self) -> anyhow::Result<f64> {
        let conn = self
            .db
            .lock()
            .map_err(|_| anyhow::anyhow!("usage ledger lock poisoned"))?;
        let tokens = queries::total_tokens(&conn)?;
        Ok(tokens as f64 / 1000.0 * self.cost_per_1k_tokens)
    }
}

impl UsageGuard for LedgerUsageGuard {
    fn allow(&self) -> bool {
        match self.projected_cost() {
            Ok(cost) if cost < self.limit_dollars => true,
            Ok(cost) => {
                tracing::warn!(cost, limit = self.limit_dollars, "usage limit reached");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "usage ledger unavailable, denying");
                false
            }
        }
    }

    fn record(&self, session_id: &str, tokens: u64) {
        if tokens == 0 {
            return;
        }
        let result = self
            .db
            .lock()
            .map_err(|_| anyhow::anyhow!("usage ledger lock poisoned"))
            .and_then(|conn| queries::record_usage(&conn, session_id, tokens, &self.clock.now()));
        if let Err(e) = result {
            tracing::error!(session_id, tokens, error = %e, "failed to record token usage");
        }
    }
}
