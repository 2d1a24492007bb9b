use std::collections::BTreeMap;

use crate::api::options::SetOptions;
use crate::api::user_data::{parse_set_data, parse_update_data};
use crate::core::SyncClient;
use crate::error::{resource_exhausted, SyncResult};
use crate::model::{DocumentKey, Mutation, Precondition, SnapshotVersion};
use crate::value::Value;

const MAX_BATCH_WRITES: usize = 500;

/// Collects writes and submits them as one atomic batch.
///
/// Nothing touches the local cache until [`commit`](Self::commit).
#[derive(Clone)]
pub struct WriteBatch {
    client: SyncClient,
    mutations: Vec<Mutation>,
}

impl WriteBatch {
    pub(crate) fn new(client: SyncClient) -> Self {
        Self {
            client,
            mutations: Vec::new(),
        }
    }

    /// Writes `data` to `key`, replacing the document unless `options`
    /// asks for a merge.
    pub fn set(
        &mut self,
        key: &DocumentKey,
        data: BTreeMap<String, Value>,
        options: SetOptions,
    ) -> SyncResult<&mut Self> {
        self.ensure_capacity()?;
        let precondition = options.precondition.clone();
        let parsed = parse_set_data(data, &options)?;
        self.mutations.push(parsed.to_mutation(key.clone(), precondition));
        Ok(self)
    }

    /// Updates fields of an existing document. Keys are dot-separated field
    /// paths. Fails on commit if the document does not exist.
    pub fn update(&mut self, key: &DocumentKey, data: BTreeMap<String, Value>) -> SyncResult<&mut Self> {
        self.update_with_precondition(key, data, Precondition::Exists(true))
    }

    pub fn update_with_precondition(
        &mut self,
        key: &DocumentKey,
        data: BTreeMap<String, Value>,
        precondition: Precondition,
    ) -> SyncResult<&mut Self> {
        self.ensure_capacity()?;
        let parsed = parse_update_data(data)?;
        self.mutations.push(parsed.to_mutation(key.clone(), precondition));
        Ok(self)
    }

    pub fn delete(&mut self, key: &DocumentKey) -> SyncResult<&mut Self> {
        self.delete_with_precondition(key, Precondition::None)
    }

    pub fn delete_with_precondition(
        &mut self,
        key: &DocumentKey,
        precondition: Precondition,
    ) -> SyncResult<&mut Self> {
        self.ensure_capacity()?;
        self.mutations
            .push(Mutation::delete(key.clone()).with_precondition(precondition));
        Ok(self)
    }

    /// Fails the whole batch unless `precondition` holds for `key`.
    pub fn verify(&mut self, key: &DocumentKey, precondition: Precondition) -> SyncResult<&mut Self> {
        self.ensure_capacity()?;
        self.mutations.push(Mutation::Verify {
            key: key.clone(),
            precondition,
        });
        Ok(self)
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Applies the batch locally and resolves with the commit version once
    /// the remote authority acknowledges it.
    pub async fn commit(self) -> SyncResult<SnapshotVersion> {
        self.client.submit(self.mutations).await
    }

    fn ensure_capacity(&self) -> SyncResult<()> {
        if self.mutations.len() >= MAX_BATCH_WRITES {
            return Err(resource_exhausted(format!(
                "A write batch cannot contain more than {MAX_BATCH_WRITES} writes"
            )));
        }
        Ok(())
    }
}
