//! Persistent host-port allocation.
//!
//! Assignments are keyed by `(slug, tag)` and written through to the state
//! database on every mutation, so a restarted manager keeps reasoning about
//! ports it handed out in a previous life. Allocation walks up from the
//! configured base port, skipping both recorded assignments and ports
//! something else on the host is already bound to.

use sqlx::sqlite::SqlitePool;
use tokio::sync::Mutex;
use tracing::debug;

pub struct PortAllocator {
    pool: SqlitePool,
    base: u16,
    // Single writer; readers go straight to the pool.
    write_lock: Mutex<()>,
}

impl PortAllocator {
    pub async fn new(pool: SqlitePool, base: u16) -> Result<Self, sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS port_allocations (
                key TEXT PRIMARY KEY, -- {slug}-{deployment tag}
                port INTEGER NOT NULL UNIQUE
            );",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            base,
            write_lock: Mutex::new(()),
        })
    }

    /// The port recorded for `key`, if any.
    pub async fn lookup(&self, key: &str) -> Result<Option<u16>, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT port FROM port_allocations WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(port,)| port as u16))
    }

    /// Returns the existing assignment for `key`, or picks the lowest free
    /// port at or above the base.
    pub async fn allocate(&self, key: &str) -> Result<u16, sqlx::Error> {
        let _guard = self.write_lock.lock().await;

        if let Some(port) = self.lookup(key).await? {
            return Ok(port);
        }

        let taken: Vec<(i64,)> = sqlx::query_as("SELECT port FROM port_allocations")
            .fetch_all(&self.pool)
            .await?;
        let taken: Vec<u16> = taken.into_iter().map(|(port,)| port as u16).collect();

        let mut candidate = self.base;
        loop {
            if !taken.contains(&candidate) && portpicker::is_free(candidate) {
                break;
            }
            candidate = candidate
                .checked_add(1)
                .expect("ran out of host ports above the configured base");
        }

        sqlx::query("INSERT INTO port_allocations (key, port) VALUES (?, ?)")
            .bind(key)
            .bind(candidate as i64)
            .execute(&self.pool)
            .await?;

        debug!(key, port = candidate, "allocated host port");
        Ok(candidate)
    }

    /// Drops the assignment for `key`, making its port reusable.
    pub async fn release(&self, key: &str) -> Result<(), sqlx::Error> {
        let _guard = self.write_lock.lock().await;

        sqlx::query("DELETE FROM port_allocations WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    async fn memory_pool() -> SqlitePool {
        // A second connection would open a second, empty in-memory database.
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    async fn allocator() -> PortAllocator {
        PortAllocator::new(memory_pool().await, 21000).await.unwrap()
    }

    #[tokio::test]
    async fn allocations_are_unique_per_key() {
        let allocator = allocator().await;

        let a = allocator.allocate("blog-cafe0123").await.unwrap();
        let b = allocator.allocate("blog-beef4567").await.unwrap();
        let c = allocator.allocate("shop-0badf00d").await.unwrap();

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        assert!(a >= 21000 && b >= 21000 && c >= 21000);
    }

    #[tokio::test]
    async fn same_key_reuses_the_assignment() {
        let allocator = allocator().await;

        let first = allocator.allocate("blog-cafe0123").await.unwrap();
        let second = allocator.allocate("blog-cafe0123").await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn assignments_survive_a_new_allocator_on_the_same_state() {
        let pool = memory_pool().await;

        let first = PortAllocator::new(pool.clone(), 21000)
            .await
            .unwrap()
            .allocate("blog-cafe0123")
            .await
            .unwrap();

        // A fresh manager process reuses the persisted map.
        let second = PortAllocator::new(pool, 21000)
            .await
            .unwrap()
            .allocate("blog-cafe0123")
            .await
            .unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn released_ports_can_be_handed_out_again() {
        let allocator = allocator().await;

        let port = allocator.allocate("blog-cafe0123").await.unwrap();
        allocator.release("blog-cafe0123").await.unwrap();
        let reused = allocator.allocate("shop-0badf00d").await.unwrap();

        assert_eq!(port, reused);
    }

    #[tokio::test]
    async fn lookup_misses_return_none() {
        let allocator = allocator().await;
        assert_eq!(allocator.lookup("nothing-here").await.unwrap(), None);
    }
}
