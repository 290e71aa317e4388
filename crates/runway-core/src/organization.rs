// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Organizations group workspaces.

use chrono::{DateTime, Utc};

use crate::error::{CoreError, Result};
use crate::run::current_timestamp;

/// An organization, identified by its unique name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Organization {
    /// Unique name.
    pub name: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Organization {
    /// Create a new organization, validating its name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(CoreError::ValidationError {
                field: "name".to_string(),
                message: format!("invalid organization name '{}'", name),
            });
        }
        Ok(Self {
            name,
            created_at: current_timestamp(),
        })
    }
}
