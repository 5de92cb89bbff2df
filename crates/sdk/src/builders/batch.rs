//! Bulk puts and deletes.

use std::collections::HashMap;

use tessera_types::{BatchWriteRequest, Item, WriteRequest};
use tracing::instrument;

use super::{check_key_facets, read::key_identity};
use crate::{
    batch::{BatchOrchestrator, timed},
    config::ExecuteOptions,
    entity::Entity,
    error::{Error, Result},
    pipeline::WriteMode,
};

/// Result of a batch write in which every item was applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchWriteOutput {
    /// Number of items written or deleted.
    pub written: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Put,
    Delete,
}

/// Writes or deletes many items through the batch orchestrator.
///
/// Created by [`Entity::batch_put`](crate::Entity::batch_put) and
/// [`Entity::batch_delete`](crate::Entity::batch_delete).
#[derive(Debug)]
pub struct BatchWriteBuilder<'a> {
    entity: &'a Entity,
    kind: Kind,
    inputs: Vec<Item>,
    options: ExecuteOptions,
}

impl<'a> BatchWriteBuilder<'a> {
    pub(crate) fn puts(entity: &'a Entity, items: Vec<Item>) -> Self {
        Self { entity, kind: Kind::Put, inputs: items, options: ExecuteOptions::default() }
    }

    pub(crate) fn deletes(entity: &'a Entity, keys: Vec<Item>) -> Self {
        Self { entity, kind: Kind::Delete, inputs: keys, options: ExecuteOptions::default() }
    }

    /// Replaces the execution options.
    #[must_use]
    pub fn options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    fn operation(&self) -> &'static str {
        match self.kind {
            Kind::Put => "batch_put",
            Kind::Delete => "batch_delete",
        }
    }

    /// Compiles one write request per input, in input order.
    fn writes(&self) -> Result<Vec<WriteRequest>> {
        let schema = self.entity.schema();
        let pipeline = self.entity.pipeline();
        let codec = self.entity.codec();
        self.inputs
            .iter()
            .map(|input| match self.kind {
                Kind::Put => {
                    let attributes = pipeline.apply_write(input, WriteMode::Put)?;
                    Ok(WriteRequest::Put(pipeline.to_record(&attributes)?))
                },
                Kind::Delete => {
                    check_key_facets(schema, input)?;
                    Ok(WriteRequest::Delete(codec.primary_key(input)?))
                },
            })
            .collect()
    }

    /// Returns the store requests the call would make, one per chunk.
    ///
    /// # Errors
    ///
    /// Returns the first validation or key error among the inputs.
    pub fn params(self) -> Result<Vec<BatchWriteRequest>> {
        let config = self.entity.config();
        let writes = self.writes()?;
        Ok(writes
            .chunks(config.batch().write_chunk_size)
            .map(|chunk| BatchWriteRequest { table: config.table().to_owned(), writes: chunk.to_vec() })
            .collect())
    }

    /// Applies every write.
    ///
    /// Every input is validated before the first store call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PartialBatchFailure`] if some items stayed
    /// unprocessed after retries or cancellation, carrying the caller's
    /// inputs split into applied and unapplied. A non-retryable store error
    /// is returned classified when nothing was applied, and as the `cause`
    /// of a [`Error::PartialBatchFailure`] otherwise.
    #[instrument(
        skip_all,
        fields(entity = %self.entity.model().entity, operation = self.operation(), items = self.inputs.len())
    )]
    pub async fn go(self) -> Result<BatchWriteOutput> {
        let entity = self.entity;
        let config = entity.config();
        timed(config, self.operation(), async {
            self.options.validate()?;
            let writes = self.writes()?;
            if self.options.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let schema = entity.schema();
            let by_identity: HashMap<String, &Item> = writes
                .iter()
                .zip(&self.inputs)
                .map(|(write, input)| (key_identity(schema, write_key(write)), input))
                .collect();

            let outcome = BatchOrchestrator::new(entity.store(), config)
                .with_concurrency(self.options.concurrency)
                .with_cancellation(self.options.cancellation.as_ref())
                .write(writes)
                .await;

            if let Some(e) = &outcome.fatal
                && outcome.processed.is_empty()
            {
                return Err(Error::from_store("batch_write", e.clone(), self.options.original_error));
            }
            if outcome.unprocessed.is_empty() {
                return Ok(BatchWriteOutput { written: outcome.processed.len() });
            }
            let originals = |writes: &[WriteRequest]| -> Vec<Item> {
                writes
                    .iter()
                    .filter_map(|w| by_identity.get(&key_identity(schema, write_key(w))))
                    .map(|input| (*input).clone())
                    .collect()
            };
            Err(Error::PartialBatchFailure {
                succeeded: originals(&outcome.processed),
                unprocessed: originals(&outcome.unprocessed),
                cancelled: outcome.cancelled,
                cause: outcome.fatal,
            })
        })
        .await
    }
}

fn write_key(write: &WriteRequest) -> &Item {
    match write {
        WriteRequest::Put(item) | WriteRequest::Delete(item) => item,
    }
}
