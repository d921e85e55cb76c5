//! Source-to-destination identity mapping.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{MigrateError, Result};
use crate::model::{DestinationId, EntityKind, IdentityLink, LinkOutcome, SourceId};
use crate::store::StagingStore;

/// Single source of truth for create-vs-link decisions on the destination.
///
/// Links live only in the staging store; every lookup goes to its
/// primary-key index and nothing is held in process.
pub struct IdentityMapper {
    store: Arc<dyn StagingStore>,
}

impl IdentityMapper {
    pub fn new(store: Arc<dyn StagingStore>) -> Self {
        Self { store }
    }

    /// Destination id linked to `(kind, source_id)`, if any.
    pub async fn lookup(&self, kind: EntityKind, source_id: SourceId) -> Result<Option<DestinationId>> {
        self.store.lookup_link(kind, source_id).await
    }

    /// Durably link `(kind, source_id)` to `destination_id`.
    ///
    /// Re-linking to the same destination id succeeds without change. A
    /// different destination id fails with `Conflict` and the existing link
    /// is left untouched.
    pub async fn create(
        &self,
        kind: EntityKind,
        source_id: SourceId,
        destination_id: DestinationId,
    ) -> Result<()> {
        let link = IdentityLink::new(kind, source_id, destination_id);
        match self.store.insert_link(&link).await? {
            LinkOutcome::Inserted => {
                debug!("Linked {} {} -> {}", kind, source_id, destination_id);
                Ok(())
            }
            LinkOutcome::Existing(existing) if existing == destination_id => Ok(()),
            LinkOutcome::Existing(existing) => {
                warn!(
                    "Identity conflict for {} {}: linked to {}, attempted {}",
                    kind, source_id, existing, destination_id
                );
                Err(MigrateError::Conflict {
                    kind,
                    source_id,
                    existing,
                    attempted: destination_id,
                })
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStagingStore;

    fn mapper() -> (IdentityMapper, Arc<dyn StagingStore>) {
        let store: Arc<dyn StagingStore> = Arc::new(SqliteStagingStore::in_memory().unwrap());
        (IdentityMapper::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_lookup_missing() {
        let (mapper, _) = mapper();
        assert_eq!(mapper.lookup(EntityKind::Customer, 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_then_lookup() {
        let (mapper, store) = mapper();
        mapper.create(EntityKind::Customer, 42, 5001).await.unwrap();
        assert_eq!(
            mapper.lookup(EntityKind::Customer, 42).await.unwrap(),
            Some(5001)
        );
        assert_eq!(
            store.lookup_link(EntityKind::Customer, 42).await.unwrap(),
            Some(5001)
        );
    }

    #[tokio::test]
    async fn test_same_destination_is_noop() {
        let (mapper, _) = mapper();
        mapper.create(EntityKind::Order, 7, 70).await.unwrap();
        mapper.create(EntityKind::Order, 7, 70).await.unwrap();
    }

    #[tokio::test]
    async fn test_conflict_keeps_existing_link() {
        let (mapper, store) = mapper();
        mapper.create(EntityKind::Customer, 42, 1).await.unwrap();

        let err = mapper.create(EntityKind::Customer, 42, 2).await.unwrap_err();
        assert!(matches!(
            err,
            MigrateError::Conflict {
                existing: 1,
                attempted: 2,
                ..
            }
        ));
        assert_eq!(
            store.lookup_link(EntityKind::Customer, 42).await.unwrap(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_links_written_elsewhere_are_seen() {
        let (mapper, store) = mapper();
        store
            .insert_link(&IdentityLink::new(EntityKind::Subscription, 9, 900))
            .await
            .unwrap();
        assert_eq!(
            mapper.lookup(EntityKind::Subscription, 9).await.unwrap(),
            Some(900)
        );
    }

    #[tokio::test]
    async fn test_purged_links_are_not_served() {
        let (mapper, store) = mapper();
        mapper.create(EntityKind::Customer, 42, 5001).await.unwrap();
        assert_eq!(
            mapper.lookup(EntityKind::Customer, 42).await.unwrap(),
            Some(5001)
        );

        store.purge(true).await.unwrap();
        assert_eq!(mapper.lookup(EntityKind::Customer, 42).await.unwrap(), None);

        // Relinking after a purge is a fresh insert, not a conflict.
        mapper.create(EntityKind::Customer, 42, 6001).await.unwrap();
        assert_eq!(
            mapper.lookup(EntityKind::Customer, 42).await.unwrap(),
            Some(6001)
        );
    }
}
