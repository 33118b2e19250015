//! # notely-db
//!
//! PostgreSQL layer for notely.
//!
//! This crate provides:
//! - Connection pool management
//! - Read repositories for notes, spaces, and users
//! - The transactional write path the worker applies commands through
//! - A durable, per-topic FIFO broker backed by `broker_message`
//!
//! ## Example
//!
//! ```rust,ignore
//! use notely_db::Database;
//! use notely_core::{NewUser, SpaceReader};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/notely").await?;
//!     db.migrate().await?;
//!
//!     let user = db.users.register(NewUser { tg_id: 42, username: None }).await?;
//!     let space = db.spaces.get_space(user.personal_space_id).await?;
//!     println!("{:?}", space);
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod notes;
pub mod pool;
pub mod spaces;
pub mod writer;

// Always compiled so integration tests (in tests/) can use it.
pub mod test_fixtures;

pub use broker::PgBroker;
pub use notes::PgNoteRepository;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use spaces::{PgSpaceRepository, PgUserRepository};
pub use writer::{PgWriteStore, PgWriteTx};

use notely_core::Result;

/// All repositories over one connection pool.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    pub notes: PgNoteRepository,
    pub spaces: PgSpaceRepository,
    /// User provisioning (outside the command pipeline).
    pub users: PgUserRepository,
    pub broker: PgBroker,
    /// Write path; only the worker should hold this.
    pub writer: PgWriteStore,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            notes: PgNoteRepository::new(pool.clone()),
            spaces: PgSpaceRepository::new(pool.clone()),
            users: PgUserRepository::new(pool.clone()),
            broker: PgBroker::new(pool.clone()),
            writer: PgWriteStore::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| notely_core::Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
