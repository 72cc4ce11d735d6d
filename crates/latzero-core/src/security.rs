// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Security seam for encrypted pools and blocks.
//!
//! The orchestration core calls this interface wherever cryptographic
//! policy applies; the algorithms themselves live behind it. The default
//! provider approves every operation and passes data through unchanged,
//! which is sufficient for unencrypted deployments and the core test suite.

use async_trait::async_trait;

use crate::error::CoreError;

/// Cryptographic policy hooks consulted by the pool and memory managers.
#[async_trait]
pub trait SecurityProvider: Send + Sync {
    /// May `app_id` perform `operation` inside the encrypted pool?
    async fn check_pool_access(
        &self,
        app_id: &str,
        pool: &str,
        operation: &str,
    ) -> Result<bool, CoreError>;

    /// Provision key material for a newly created encrypted pool.
    async fn prepare_encrypted_pool(&self, pool: &str) -> Result<(), CoreError>;

    /// Encrypt block bytes for storage inside an encrypted pool.
    async fn encrypt_block(&self, pool: &str, data: &[u8]) -> Result<Vec<u8>, CoreError>;

    /// Decrypt block bytes read from an encrypted pool.
    async fn decrypt_block(&self, pool: &str, data: &[u8]) -> Result<Vec<u8>, CoreError>;

    /// Rotate the key material of an encrypted pool.
    async fn rotate_keys(&self, pool: &str) -> Result<(), CoreError>;
}

/// Pass-through provider: approves all access, identity transforms.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllSecurity;

#[async_trait]
impl SecurityProvider for AllowAllSecurity {
    async fn check_pool_access(
        &self,
        _app_id: &str,
        _pool: &str,
        _operation: &str,
    ) -> Result<bool, CoreError> {
        Ok(true)
    }

    async fn prepare_encrypted_pool(&self, _pool: &str) -> Result<(), CoreError> {
        Ok(())
    }

    async fn encrypt_block(&self, _pool: &str, data: &[u8]) -> Result<Vec<u8>, CoreError> {
        Ok(data.to_vec())
    }

    async fn decrypt_block(&self, _pool: &str, data: &[u8]) -> Result<Vec<u8>, CoreError> {
        Ok(data.to_vec())
    }

    async fn rotate_keys(&self, _pool: &str) -> Result<(), CoreError> {
        Ok(())
    }
}
