//! Quota collaborator.
//!
//! The orchestrator asks before dispatching and deducts after settling. The
//! in-memory implementation keeps one balance per user.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::core::error::{AppError, Result};
use crate::store::models::User;

#[async_trait]
pub trait QuotaService: Send + Sync {
    /// True if `user_id` has at least `amount` remaining.
    async fn check_quota(&self, user_id: &str, amount: i64) -> Result<bool>;

    /// Charge `amount` to `user_id`. Fails with [`AppError::InsufficientQuota`]
    /// if the balance would go negative.
    async fn deduct_quota(&self, user_id: &str, amount: i64) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryQuota {
    users: DashMap<String, User>,
}

impl InMemoryQuota {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_users(users: &[User]) -> Self {
        let quota = Self::new();
        for user in users {
            quota.insert_user(user.clone());
        }
        quota
    }

    pub fn insert_user(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn remaining(&self, user_id: &str) -> Option<i64> {
        self.users.get(user_id).map(|u| u.remaining())
    }

    pub fn used(&self, user_id: &str) -> Option<i64> {
        self.users.get(user_id).map(|u| u.used_quota)
    }
}

#[async_trait]
impl QuotaService for InMemoryQuota {
    async fn check_quota(&self, user_id: &str, amount: i64) -> Result<bool> {
        Ok(self
            .users
            .get(user_id)
            .map(|u| u.remaining() >= amount)
            .unwrap_or(false))
    }

    async fn deduct_quota(&self, user_id: &str, amount: i64) -> Result<()> {
        let mut user = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| AppError::Storage(format!("user {} not found", user_id)))?;

        // The entry guard makes check and update a single step.
        if user.remaining() < amount {
            return Err(AppError::InsufficientQuota);
        }
        user.used_quota += amount;
        Ok(())
    }
}
