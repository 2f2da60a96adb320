#![cfg(test)]
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod job;
mod model;
mod query;
mod relationship;
mod twin;

use std::sync::Arc;

use tokio_postgres::NoTls;
use twin_graph::store::{
    DatabaseConnectionInfo, DatabasePoolConfig, GraphName, PooledStore, PostgresStorePool,
};
use uuid::Uuid;

pub(crate) fn init_logging() {
    let _: Result<_, _> = tracing_subscriber::fmt()
        .with_ansi(true)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct DatabaseTestWrapper {
    pool: Arc<PostgresStorePool>,
    graph: GraphName,
}

impl DatabaseTestWrapper {
    /// Connects using the `TWIN_GRAPH_PG_*` environment and creates a
    /// uniquely named graph. The model cache runs with TTL zero so every
    /// test observes its own writes immediately.
    pub async fn new() -> Self {
        init_logging();

        let user = std::env::var("TWIN_GRAPH_PG_USER").unwrap_or_else(|_| "postgres".to_owned());
        let password =
            std::env::var("TWIN_GRAPH_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_owned());
        let host = std::env::var("TWIN_GRAPH_PG_HOST").unwrap_or_else(|_| "localhost".to_owned());
        let port = std::env::var("TWIN_GRAPH_PG_PORT").map_or(5432, |port| {
            port.parse::<u16>().expect("could not parse port")
        });
        let database =
            std::env::var("TWIN_GRAPH_PG_DATABASE").unwrap_or_else(|_| "twins".to_owned());

        let connection_info =
            DatabaseConnectionInfo::new(user, password, host, port, database);
        let pool_config = DatabasePoolConfig {
            model_cache_ttl_seconds: 0,
            ..DatabasePoolConfig::default()
        };

        let pool = PostgresStorePool::new(&connection_info, &pool_config, NoTls)
            .await
            .expect("could not connect to database");

        let graph = GraphName::new(format!("test_{}", Uuid::new_v4().simple()))
            .expect("generated graph names are valid");
        let store = pool.acquire(graph.clone()).await.expect("could not acquire store");
        store.create_graph().await.expect("could not create test graph");

        Self {
            pool: Arc::new(pool),
            graph,
        }
    }

    pub async fn store(&self) -> PooledStore {
        self.pool
            .acquire(self.graph.clone())
            .await
            .expect("could not acquire store")
    }

    #[must_use]
    pub fn pool(&self) -> Arc<PostgresStorePool> {
        Arc::clone(&self.pool)
    }

    #[must_use]
    pub fn graph(&self) -> &GraphName {
        &self.graph
    }

    pub async fn teardown(self) {
        let store = self
            .pool
            .acquire(self.graph.clone())
            .await
            .expect("could not acquire store");
        store.drop_graph().await.expect("could not drop test graph");
    }
}
