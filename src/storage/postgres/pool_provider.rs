//! Read/write pool routing for the PostgreSQL store.
//!
//! Conditional writes (slot claims, renewals, commits) and reads that must
//! observe them go to [`PoolProvider::write`]. The recovery scan and registry
//! listing tolerate replica lag and go to [`PoolProvider::read`].

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Source of connection pools for the store.
///
/// ```ignore
/// #[derive(Clone)]
/// struct Pools {
///     primary: PgPool,
///     replica: Option<PgPool>,
/// }
///
/// impl PoolProvider for Pools {
///     fn read(&self) -> &PgPool {
///         self.replica.as_ref().unwrap_or(&self.primary)
///     }
///
///     fn write(&self) -> &PgPool {
///         &self.primary
///     }
/// }
/// ```
pub trait PoolProvider: Clone + Send + Sync + 'static {
    /// Pool for scans that may lag the primary.
    fn read(&self) -> &PgPool;

    /// Pool for writes and read-after-write lookups. Always the primary.
    fn write(&self) -> &PgPool;
}

/// A single pool serves both roles.
impl PoolProvider for PgPool {
    fn read(&self) -> &PgPool {
        self
    }

    fn write(&self) -> &PgPool {
        self
    }
}

/// Pools for tests: the read pool rejects writes.
///
/// Any conditional write accidentally routed through `read()` fails with
/// "cannot execute ... in a read-only transaction".
#[derive(Clone, Debug)]
pub struct TestDbPools {
    primary: PgPool,
    replica: PgPool,
}

impl TestDbPools {
    pub async fn new(pool: PgPool) -> Result<Self, sqlx::Error> {
        let primary = pool.clone();

        let replica = PgPoolOptions::new()
            .max_connections(pool.options().get_max_connections())
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("SET default_transaction_read_only = on")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect_with(pool.connect_options().as_ref().clone())
            .await?;

        Ok(Self { primary, replica })
    }
}

impl PoolProvider for TestDbPools {
    fn read(&self) -> &PgPool {
        &self.replica
    }

    fn write(&self) -> &PgPool {
        &self.primary
    }
}
