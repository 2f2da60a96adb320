pub(crate) mod age;
mod job;
mod model;
mod pool;
mod relationship;
mod twin;

use std::sync::Arc;

use error_stack::{Report, ResultExt as _};
use tokio_postgres::GenericClient;

pub use self::{
    age::GraphName,
    pool::{PooledStore, PostgresStorePool},
};
use crate::{
    cache::ModelCache,
    store::{StoreError, error::DeletionError},
};

/// Abstraction over pooled connections and open transactions, so every store
/// operation can run in either context.
pub trait AsClient: Send + Sync {
    type Client: GenericClient + Send + Sync;

    fn as_client(&self) -> &Self::Client;
    fn as_mut_client(&mut self) -> &mut Self::Client;
}

impl AsClient for deadpool_postgres::Object {
    type Client = tokio_postgres::Client;

    fn as_client(&self) -> &Self::Client {
        self
    }

    fn as_mut_client(&mut self) -> &mut Self::Client {
        self
    }
}

impl AsClient for tokio_postgres::Client {
    type Client = Self;

    fn as_client(&self) -> &Self::Client {
        self
    }

    fn as_mut_client(&mut self) -> &mut Self::Client {
        self
    }
}

impl AsClient for tokio_postgres::Transaction<'_> {
    type Client = Self;

    fn as_client(&self) -> &Self::Client {
        self
    }

    fn as_mut_client(&mut self) -> &mut Self::Client {
        self
    }
}

/// A Postgres/AGE-backed store bound to one tenant graph.
pub struct PostgresStore<C> {
    client: C,
    graph: GraphName,
    cache: Arc<ModelCache>,
    instance_id: String,
}

impl<C: AsClient> PostgresStore<C> {
    #[must_use]
    pub const fn new(
        client: C,
        graph: GraphName,
        cache: Arc<ModelCache>,
        instance_id: String,
    ) -> Self {
        Self {
            client,
            graph,
            cache,
            instance_id,
        }
    }

    #[must_use]
    pub const fn graph(&self) -> &GraphName {
        &self.graph
    }

    pub(crate) fn raw_client(&self) -> &<C as AsClient>::Client {
        self.client.as_client()
    }

    #[must_use]
    pub fn model_cache(&self) -> &ModelCache {
        &self.cache
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Opens a transaction-scoped view of this store.
    ///
    /// # Errors
    ///
    /// - if `BEGIN` fails.
    pub async fn transaction(
        &mut self,
    ) -> Result<PostgresStore<tokio_postgres::Transaction<'_>>, Report<StoreError>> {
        Ok(PostgresStore::new(
            self.client
                .as_mut_client()
                .transaction()
                .await
                .change_context(StoreError)?,
            self.graph.clone(),
            Arc::clone(&self.cache),
            self.instance_id.clone(),
        ))
    }

    /// Initializes the tenant graph: the AGE graph with its labels and
    /// indexes, the `is_of_model` helper routines, and the jobs schema.
    ///
    /// # Errors
    ///
    /// - if any DDL statement fails, e.g. because the graph already exists.
    #[tracing::instrument(skip(self), fields(graph = %self.graph))]
    pub async fn create_graph(&self) -> Result<(), Report<StoreError>> {
        for statement in age::create_graph_statements(&self.graph) {
            self.client
                .as_client()
                .simple_query(&statement)
                .await
                .change_context(StoreError)
                .attach_printable_lazy(|| statement.clone())?;
        }
        Ok(())
    }

    /// Tears the tenant graph down, including the jobs schema.
    ///
    /// # Errors
    ///
    /// - if the graph does not exist or a drop statement fails.
    #[tracing::instrument(skip(self), fields(graph = %self.graph))]
    pub async fn drop_graph(&self) -> Result<(), Report<DeletionError>> {
        for statement in age::drop_graph_statements(&self.graph) {
            self.client
                .as_client()
                .simple_query(&statement)
                .await
                .change_context(DeletionError)
                .attach_printable_lazy(|| statement.clone())?;
        }
        self.cache.clear();
        Ok(())
    }
}

impl PostgresStore<tokio_postgres::Transaction<'_>> {
    /// # Errors
    ///
    /// - if `COMMIT` fails.
    pub async fn commit(self) -> Result<(), Report<StoreError>> {
        self.client.commit().await.change_context(StoreError)
    }

    /// # Errors
    ///
    /// - if `ROLLBACK` fails.
    pub async fn rollback(self) -> Result<(), Report<StoreError>> {
        self.client.rollback().await.change_context(StoreError)
    }
}
