//! Runtime permissions required before any Bluetooth use.

use crate::domain::models::{Permission, PermissionGrant, PermissionStatus};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("required permissions not granted: {missing:?}")]
pub struct PermissionDenied {
    pub missing: Vec<Permission>,
}

/// Host permission model.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// Check `permissions`, prompting the user where the host supports it.
    /// An empty result means the request was cancelled.
    async fn request(&self, permissions: &[Permission]) -> Vec<PermissionGrant>;
}

/// Every permission in `required` must appear in `grants` as granted.
pub fn verify(required: &[Permission], grants: &[PermissionGrant]) -> Result<(), PermissionDenied> {
    if grants.is_empty() {
        return Err(PermissionDenied {
            missing: required.to_vec(),
        });
    }

    let missing: Vec<Permission> = required
        .iter()
        .copied()
        .filter(|permission| {
            !grants.iter().any(|grant| {
                grant.permission == *permission && grant.status == PermissionStatus::Granted
            })
        })
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(PermissionDenied { missing })
    }
}

/// Answers from a fixed set of grants. Used on hosts without a runtime
/// permission model.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissionGate {
    denied: Vec<Permission>,
    cancelled: bool,
}

impl StaticPermissionGate {
    pub fn granting_all() -> Self {
        Self::default()
    }

    pub fn denying(denied: &[Permission]) -> Self {
        Self {
            denied: denied.to_vec(),
            cancelled: false,
        }
    }

    /// Behaves like a dismissed permission dialog.
    pub fn cancelled() -> Self {
        Self {
            denied: Vec::new(),
            cancelled: true,
        }
    }
}

#[async_trait]
impl PermissionGate for StaticPermissionGate {
    async fn request(&self, permissions: &[Permission]) -> Vec<PermissionGrant> {
        if self.cancelled {
            return Vec::new();
        }

        permissions
            .iter()
            .map(|permission| {
                if self.denied.contains(permission) {
                    PermissionGrant::denied(*permission)
                } else {
                    PermissionGrant::granted(*permission)
                }
            })
            .collect()
    }
}
