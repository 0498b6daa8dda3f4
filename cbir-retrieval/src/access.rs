//! Caller identity and record visibility

use serde::{Deserialize, Serialize};

use crate::record::{EmbeddingRecord, OwnerId, Partition};

/// Role attached to an authenticated caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// Authenticated principal issuing a request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub id: OwnerId,
    pub role: Role,
}

impl CallerIdentity {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: OwnerId::new(id),
            role: Role::User,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: OwnerId::new(id),
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// The caller's own private partition
    pub fn private_partition(&self) -> Partition {
        Partition::private(self.id.clone())
    }
}

/// Whether records in `partition` may be shown to `caller`
pub fn partition_visible(partition: &Partition, caller: &CallerIdentity) -> bool {
    match partition {
        Partition::Shared => true,
        Partition::Private { owner } => caller.is_admin() || owner == &caller.id,
    }
}

/// Whether `record` may be shown to `caller`
pub fn visible(record: &EmbeddingRecord, caller: &CallerIdentity) -> bool {
    partition_visible(record.partition(), caller)
}

/// Whether `caller` may modify or delete `record`. Shared-catalog records
/// are managed by admins only.
pub fn can_modify(record: &EmbeddingRecord, caller: &CallerIdentity) -> bool {
    match record.owner() {
        Some(owner) => caller.is_admin() || owner == &caller.id,
        None => caller.is_admin(),
    }
}
