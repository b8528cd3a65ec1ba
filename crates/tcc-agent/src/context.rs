// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transaction context threaded through protected calls.

/// Metadata key carrying the transaction id.
pub const TX_ID_KEY: &str = "transaction-id";
/// Metadata key carrying the require id of the enclosing lock.
pub const LOCK_ID_KEY: &str = "resource-lock-id";
/// Metadata key marking a transaction created implicitly by the callee.
pub const LOCALLY_ROOTED_KEY: &str = "locally-rooted";

/// Transaction scope of a call.
///
/// An empty `tx_id` means the call runs outside any transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxContext {
    pub tx_id: String,
    pub lock_id: Option<String>,
    pub locally_rooted: bool,
}

impl TxContext {
    /// Context that joins `tx_id`.
    pub fn with_tx(tx_id: impl Into<String>) -> Self {
        Self {
            tx_id: tx_id.into(),
            ..Default::default()
        }
    }

    pub fn has_tx(&self) -> bool {
        !self.tx_id.is_empty()
    }

    /// Metadata pairs for crossing a process boundary. Unset fields are omitted.
    pub fn to_metadata(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(3);
        if self.has_tx() {
            pairs.push((TX_ID_KEY, self.tx_id.clone()));
        }
        if let Some(lock_id) = &self.lock_id {
            pairs.push((LOCK_ID_KEY, lock_id.clone()));
        }
        if self.locally_rooted {
            pairs.push((LOCALLY_ROOTED_KEY, "true".to_string()));
        }
        pairs
    }

    /// Rebuild a context from metadata pairs. Unknown keys are ignored.
    pub fn from_metadata<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut ctx = Self::default();
        for (key, value) in pairs {
            match key {
                TX_ID_KEY => ctx.tx_id = value.to_string(),
                LOCK_ID_KEY if !value.is_empty() => ctx.lock_id = Some(value.to_string()),
                LOCALLY_ROOTED_KEY => ctx.locally_rooted = value == "true",
                _ => {}
            }
        }
        ctx
    }
}
