// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identifier allocation.

use uuid::Uuid;

/// Prefix of resource row ids and agent-issued lock ids.
pub const RESOURCE_ID_PREFIX: &str = "R_";

/// Source of globally unique, lexically sortable identifiers.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// UUIDv7 ids: time-ordered, so their string form sorts by creation time.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidV7Generator;

impl IdGenerator for UuidV7Generator {
    fn next_id(&self) -> String {
        Uuid::now_v7().to_string()
    }
}

/// Resource row id for a freshly allocated id.
pub fn resource_id(id: &str) -> String {
    format!("{}{}", RESOURCE_ID_PREFIX, id)
}
