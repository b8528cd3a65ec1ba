// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Business side of a protected resource.

use async_trait::async_trait;

use crate::error::BoxError;

/// Applies the second phase of a transaction to one resource.
///
/// Commands are delivered at least once, so both methods must be idempotent
/// for a given `tx_id`. Returning an error leaves the resource pending and
/// the engine re-sends the command on its next replay.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    async fn commit(&self, tx_id: &str) -> Result<(), BoxError>;

    async fn cancel(&self, tx_id: &str) -> Result<(), BoxError>;
}
