// Copyright (C) 2025-2026 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of drover.
//
// drover is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// drover is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with drover.  If not,
// see <http://www.gnu.org/licenses/>.

//! # identity
//!
//! The account store is an external collaborator; the core consumes only the ability to validate
//! a `(user, key)` credential pair. Account lifecycle (registration, verification, password
//! recovery) lives with that collaborator, not here.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::{entities::UserId, storage};

pub type Result<T> = std::result::Result<T, storage::Error>;

/// A validated caller.
#[derive(Clone, Debug)]
pub struct Identity {
    pub user_id: UserId,
    /// Admins may operate on any tenant's groups (given the group secret).
    pub is_admin: bool,
}

/// What the core requires of the identity collaborator.
#[async_trait]
pub trait Provider {
    /// `None` means the credentials are bad; callers surface that as an opaque 401.
    async fn identity_for(&self, user: &str, key: &str) -> Result<Option<Identity>>;
}

/// Config-seeded implementation, also used throughout the test suites.
#[derive(Default)]
pub struct MemoryProvider {
    users: HashMap<String, (String, bool)>,
}

impl MemoryProvider {
    pub fn new() -> MemoryProvider {
        MemoryProvider::default()
    }
    pub fn with_user<S: Into<String>>(mut self, id: S, key: S, admin: bool) -> MemoryProvider {
        self.users.insert(id.into(), (key.into(), admin));
        self
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn identity_for(&self, user: &str, key: &str) -> Result<Option<Identity>> {
        Ok(self.users.get(user).and_then(|(stored, admin)| {
            (stored == key).then(|| Identity {
                user_id: UserId::new(user),
                is_admin: *admin,
            })
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn validates_credentials() {
        let provider = MemoryProvider::new().with_user("alice", "wonderland", true);
        assert!(provider
            .identity_for("alice", "wonderland")
            .await
            .unwrap()
            .map(|id| id.is_admin)
            .unwrap_or(false));
        assert!(provider
            .identity_for("alice", "looking-glass")
            .await
            .unwrap()
            .is_none());
        assert!(provider.identity_for("bob", "x").await.unwrap().is_none());
    }
}
