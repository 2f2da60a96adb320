//! The deadpool-backed connection pool.

use std::{sync::Arc, time::Duration};

use deadpool_postgres::{
    Hook, HookError, ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Timeouts,
};
use error_stack::{Report, ResultExt as _};
use tokio_postgres::{
    Socket,
    tls::{MakeTlsConnect, TlsConnect},
};

use crate::{
    cache::ModelCache,
    store::{
        DatabaseConnectionInfo, DatabasePoolConfig, PostgresStore, StoreError,
        postgres::age::{GraphName, SESSION_SETUP},
    },
};

/// A store checked out of the pool.
pub type PooledStore = PostgresStore<Object>;

pub struct PostgresStorePool {
    pool: Pool,
    cache: Arc<ModelCache>,
    /// A stable id for this process, used as the job-lock owner.
    instance_id: String,
}

impl PostgresStorePool {
    /// Creates a new connection pool.
    ///
    /// Every created connection loads the AGE extension and puts
    /// `ag_catalog` on its search path before it is handed out.
    ///
    /// # Errors
    ///
    /// - if building the pool fails.
    #[tracing::instrument(skip(tls))]
    pub async fn new<Tls>(
        db_info: &DatabaseConnectionInfo,
        pool_config: &DatabasePoolConfig,
        tls: Tls,
    ) -> Result<Self, Report<StoreError>>
    where
        Tls: MakeTlsConnect<
                Socket,
                Stream: Send + Sync,
                TlsConnect: TlsConnect<Socket, Future: Send> + Send + Sync,
            > + Clone
            + Send
            + Sync
            + 'static,
    {
        tracing::debug!(url = %db_info, "Creating connection pool to Postgres");

        let config = deadpool_postgres::Config {
            user: Some(db_info.user().to_owned()),
            password: Some(db_info.password().to_owned()),
            host: Some(db_info.host().to_owned()),
            port: Some(db_info.port()),
            dbname: Some(db_info.database().to_owned()),
            pool: Some(PoolConfig {
                max_size: pool_config.max_connections.get(),
                timeouts: Timeouts {
                    wait: None,
                    create: None,
                    recycle: None,
                },
                ..PoolConfig::default()
            }),
            manager: Some(ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            }),
            ..deadpool_postgres::Config::default()
        };

        let pool = config
            .builder(tls)
            .change_context(StoreError)
            .attach_printable_lazy(|| db_info.clone())?
            .post_create(Hook::async_fn(|client, _metrics| {
                Box::pin(async move {
                    for statement in SESSION_SETUP {
                        client
                            .simple_query(statement)
                            .await
                            .map_err(HookError::Backend)?;
                    }
                    Ok(())
                })
            }))
            .build()
            .change_context(StoreError)?;

        Ok(Self {
            pool,
            cache: Arc::new(ModelCache::new(Duration::from_secs(
                pool_config.model_cache_ttl_seconds,
            ))),
            instance_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Acquires a store bound to the given tenant graph.
    ///
    /// # Errors
    ///
    /// - if no connection can be checked out of the pool.
    pub async fn acquire(
        &self,
        graph: GraphName,
    ) -> Result<PostgresStore<Object>, Report<StoreError>> {
        Ok(PostgresStore::new(
            self.pool.get().await.change_context(StoreError)?,
            graph,
            Arc::clone(&self.cache),
            self.instance_id.clone(),
        ))
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}
