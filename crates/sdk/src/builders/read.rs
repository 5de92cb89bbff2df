//! Point reads.

use std::collections::HashMap;

use tessera_types::{AttributeValue, BatchGetRequest, GetRequest, Item};
use tracing::{debug, instrument};

use super::check_key_facets;
use crate::{
    batch::{BatchOrchestrator, timed},
    config::ExecuteOptions,
    entity::Entity,
    error::{Error, Result},
    metrics::DropReason,
    schema::CompiledSchema,
};

/// Fetches one item by its table-index facets.
///
/// Created by [`Entity::get`](crate::Entity::get).
#[derive(Debug)]
pub struct GetBuilder<'a> {
    entity: &'a Entity,
    facets: Item,
    options: ExecuteOptions,
}

impl<'a> GetBuilder<'a> {
    pub(crate) fn new(entity: &'a Entity, facets: Item) -> Self {
        Self { entity, facets, options: ExecuteOptions::default() }
    }

    /// Replaces the execution options.
    #[must_use]
    pub fn options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the compiled store request without executing it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a facet outside the table index and
    /// [`Error::IndexResolution`] if a table-index facet is missing.
    pub fn params(self) -> Result<GetRequest> {
        self.request()
    }

    fn request(&self) -> Result<GetRequest> {
        let schema = self.entity.schema();
        check_key_facets(schema, &self.facets)?;
        Ok(GetRequest {
            table: self.entity.config().table().to_owned(),
            key: self.entity.codec().primary_key(&self.facets)?,
            consistent_read: self.options.consistent,
        })
    }

    /// Fetches the item.
    ///
    /// Returns `None` if nothing is stored under the key, or the stored row
    /// belongs to another entity.
    ///
    /// # Errors
    ///
    /// Returns key errors as for [`Self::params`], the classified store
    /// error, or [`Error::Decode`] if the stored row does not match the schema.
    #[instrument(skip_all, fields(entity = %self.entity.model().entity, operation = "get"))]
    pub async fn go(self) -> Result<Option<Item>> {
        let config = self.entity.config();
        timed(config, "get", async {
            self.options.validate()?;
            let request = self.request()?;
            if self.options.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let row = self
                .entity
                .store()
                .get(request)
                .await
                .map_err(|e| Error::from_store("get", e, self.options.original_error))?;
            let Some(row) = row else {
                return Ok(None);
            };
            if self.options.raw {
                return Ok(Some(row));
            }
            let item = self.entity.pipeline().apply_read(&row, self.options.ignore_ownership)?;
            if item.is_none() {
                debug!("Stored row belongs to another entity");
                config.metrics.record_dropped_rows(&self.entity.scope(), DropReason::Foreign, 1);
            }
            Ok(item)
        })
        .await
    }
}

/// Fetches several items by their table-index facets.
///
/// Created by [`Entity::batch_get`](crate::Entity::batch_get). Duplicate
/// keys are fetched once; results are aligned with the input.
#[derive(Debug)]
pub struct BatchGetBuilder<'a> {
    entity: &'a Entity,
    keys: Vec<Item>,
    options: ExecuteOptions,
}

/// Identity of a physical key, used to match results back to inputs.
pub(crate) fn key_identity(schema: &CompiledSchema, key: &Item) -> String {
    schema
        .table_index()
        .key_fields()
        .map(|field| key.get(field).and_then(AttributeValue::as_str).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\0")
}

impl<'a> BatchGetBuilder<'a> {
    pub(crate) fn new(entity: &'a Entity, keys: Vec<Item>) -> Self {
        Self { entity, keys, options: ExecuteOptions::default() }
    }

    /// Replaces the execution options.
    #[must_use]
    pub fn options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    /// Encodes every key, returning the physical keys with their identities.
    fn physical_keys(&self) -> Result<Vec<(String, Item)>> {
        let schema = self.entity.schema();
        let codec = self.entity.codec();
        self.keys
            .iter()
            .map(|facets| {
                check_key_facets(schema, facets)?;
                let key = codec.primary_key(facets)?;
                Ok((key_identity(schema, &key), key))
            })
            .collect()
    }

    /// Returns the store requests the call would make, one per chunk.
    ///
    /// # Errors
    ///
    /// Returns key errors as for [`GetBuilder::params`].
    pub fn params(self) -> Result<Vec<BatchGetRequest>> {
        let mut seen = std::collections::HashSet::new();
        let keys: Vec<Item> = self
            .physical_keys()?
            .into_iter()
            .filter(|(identity, _)| seen.insert(identity.clone()))
            .map(|(_, key)| key)
            .collect();
        let config = self.entity.config();
        Ok(keys
            .chunks(config.batch().get_chunk_size)
            .map(|chunk| BatchGetRequest {
                table: config.table().to_owned(),
                keys: chunk.to_vec(),
                consistent_read: self.options.consistent,
            })
            .collect())
    }

    /// Fetches the items.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PartialBatchFailure`] if some keys stayed
    /// unprocessed after retries, with the fetched items in `succeeded` and
    /// the caller's facets in `unprocessed`. A non-retryable store error is
    /// returned classified when no chunk was answered, and as the `cause` of
    /// a [`Error::PartialBatchFailure`] otherwise.
    #[instrument(
        skip_all,
        fields(entity = %self.entity.model().entity, operation = "batch_get", keys = self.keys.len())
    )]
    pub async fn go(self) -> Result<Vec<Option<Item>>> {
        let config = self.entity.config();
        timed(config, "batch_get", async {
            self.options.validate()?;
            let physical = self.physical_keys()?;

            let mut facets_by_identity: HashMap<&str, &Item> = HashMap::new();
            let mut unique = Vec::new();
            for ((identity, key), facets) in physical.iter().zip(&self.keys) {
                if facets_by_identity.insert(identity.as_str(), facets).is_none() {
                    unique.push(key.clone());
                }
            }

            let outcome = BatchOrchestrator::new(self.entity.store(), config)
                .with_concurrency(self.options.concurrency)
                .with_cancellation(self.options.cancellation.as_ref())
                .get(unique, self.options.consistent)
                .await;
            if let Some(e) = &outcome.fatal
                && outcome.answered == 0
            {
                return Err(Error::from_store("batch_get", e.clone(), self.options.original_error));
            }

            let schema = self.entity.schema();
            let pipeline = self.entity.pipeline();
            let mut found: HashMap<String, Item> = HashMap::with_capacity(outcome.items.len());
            let mut foreign = 0usize;
            for row in outcome.items {
                let identity = key_identity(schema, &row);
                let item = if self.options.raw {
                    Some(row)
                } else {
                    pipeline.apply_read(&row, self.options.ignore_ownership)?
                };
                match item {
                    Some(item) => {
                        found.insert(identity, item);
                    },
                    None => foreign += 1,
                }
            }
            if foreign > 0 {
                debug!(foreign, "Dropped rows owned by other entities");
                config.metrics.record_dropped_rows(&self.entity.scope(), DropReason::Foreign, foreign);
            }

            if !outcome.unprocessed.is_empty() {
                let unprocessed = outcome
                    .unprocessed
                    .iter()
                    .filter_map(|key| facets_by_identity.get(key_identity(schema, key).as_str()))
                    .map(|facets| (*facets).clone())
                    .collect();
                return Err(Error::PartialBatchFailure {
                    succeeded: found.into_values().collect(),
                    unprocessed,
                    cancelled: outcome.cancelled,
                    cause: outcome.fatal,
                });
            }

            Ok(physical.iter().map(|(identity, _)| found.get(identity).cloned()).collect())
        })
        .await
    }
}
