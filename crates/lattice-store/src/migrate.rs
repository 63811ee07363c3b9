//! Schema migration management.
//!
//! Migrations form a chain where each entry names the revision it
//! replaces. The head is the unique revision no other entry replaces; a
//! set with zero or multiple heads is invalid, and a registration that
//! would close a cycle is rejected outright.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use tracing::info;

use crate::error::StoreError;

/// The symbolic revision name resolving to the computed head.
pub const HEAD: &str = "head";

/// Reads and records the migration version in a backing datastore.
#[async_trait]
pub trait MigrationDriver: Send + Sync {
    /// The current version, or the empty string for a brand-new store.
    async fn version(&self) -> Result<String, StoreError>;

    async fn write_version(&self, version: &str, replaced: &str) -> Result<(), StoreError>;
}

pub type MigrationFuture<'d> =
    Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'd>>;

/// The upgrade function of a single migration.
pub type MigrationUp<D> = for<'d> fn(&'d D) -> MigrationFuture<'d>;

struct Migration<D> {
    version: String,
    replaces: String,
    up: MigrationUp<D>,
}

/// A self-contained set of migrations for one backend.
pub struct MigrationManager<D> {
    migrations: HashMap<String, Migration<D>>,
}

impl<D: MigrationDriver> MigrationManager<D> {
    pub fn new() -> Self {
        Self { migrations: HashMap::new() }
    }

    /// Associate a migration with the manager. Rejects duplicate versions,
    /// the reserved name `head`, and registrations that would close a
    /// cycle in the replaces chain.
    pub fn register(
        &mut self,
        version: &str,
        replaces: &str,
        up: MigrationUp<D>,
    ) -> Result<(), StoreError> {
        if version.eq_ignore_ascii_case(HEAD) {
            return Err(StoreError::Migration(
                "unable to register a version called head".to_string(),
            ));
        }
        if self.migrations.contains_key(version) {
            return Err(StoreError::Migration(format!("revision already exists: {version}")));
        }

        // Walk the existing replaces chain from the proposed parent; if it
        // leads back to the new version the registration closes a cycle.
        let mut current = replaces.to_string();
        while !current.is_empty() {
            if current == version {
                return Err(StoreError::Migration(format!(
                    "migration {version} would create a cycle through {replaces}"
                )));
            }
            match self.migrations.get(&current) {
                Some(found) => current = found.replaces.clone(),
                None => break,
            }
        }

        self.migrations.insert(
            version.to_string(),
            Migration { version: version.to_string(), replaces: replaces.to_string(), up },
        );
        Ok(())
    }

    /// The unique revision that no other migration replaces.
    pub fn head_revision(&self) -> Result<String, StoreError> {
        let mut candidates: std::collections::HashSet<&str> =
            self.migrations.keys().map(String::as_str).collect();
        for migration in self.migrations.values() {
            candidates.remove(migration.replaces.as_str());
        }

        let mut heads: Vec<&str> = candidates.into_iter().collect();
        if heads.len() != 1 {
            heads.sort_unstable();
            return Err(StoreError::Migration(format!(
                "multiple or zero head revisions found: {heads:?}"
            )));
        }
        Ok(heads[0].to_string())
    }

    /// Whether a store at `revision` can serve alongside the head: it is
    /// either at head or one step behind.
    pub fn is_head_compatible(&self, revision: &str) -> Result<bool, StoreError> {
        let head = self.head_revision()?;
        let head_migration = self
            .migrations
            .get(&head)
            .ok_or_else(|| StoreError::Migration(format!("unknown head revision: {head}")))?;
        Ok(revision == head_migration.version || revision == head_migration.replaces)
    }

    /// Bring the driver from its current revision to `through` (or the
    /// head when `through` is `head`). A dry run only validates the plan.
    pub async fn run(&self, driver: &D, through: &str, dry_run: bool) -> Result<(), StoreError> {
        let starting = driver.version().await?;

        let through = if through.eq_ignore_ascii_case(HEAD) {
            self.head_revision()?
        } else {
            through.to_string()
        };

        let to_run = self.collect_range(&starting, &through)?;

        if dry_run {
            return Ok(());
        }

        for migration in to_run {
            // Double check that the version reported is the one expected.
            let current = driver.version().await?;
            if migration.replaces != current {
                return Err(StoreError::Migration(format!(
                    "migration attempting to run out of order: {} != {}",
                    current, migration.replaces
                )));
            }

            info!(from = %migration.replaces, to = %migration.version, "migrating");
            (migration.up)(driver).await?;
            driver.write_version(&migration.version, &migration.replaces).await?;
        }

        Ok(())
    }

    fn collect_range(&self, starting: &str, through: &str) -> Result<Vec<&Migration<D>>, StoreError> {
        let mut found = Vec::new();
        let mut looking_for = through.to_string();
        while looking_for != starting {
            let migration = self.migrations.get(&looking_for).ok_or_else(|| {
                StoreError::Migration(format!("unable to find migration for revision: {looking_for}"))
            })?;
            found.push(migration);
            looking_for = migration.replaces.clone();
        }
        found.reverse();
        Ok(found)
    }
}

impl<D: MigrationDriver> Default for MigrationManager<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct FakeDriver {
        version: Mutex<String>,
        applied: Mutex<Vec<String>>,
    }

    impl FakeDriver {
        fn at(version: &str) -> Self {
            Self { version: Mutex::new(version.to_string()), applied: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl MigrationDriver for FakeDriver {
        async fn version(&self) -> Result<String, StoreError> {
            Ok(self.version.lock().unwrap().clone())
        }

        async fn write_version(&self, version: &str, _replaced: &str) -> Result<(), StoreError> {
            *self.version.lock().unwrap() = version.to_string();
            self.applied.lock().unwrap().push(version.to_string());
            Ok(())
        }
    }

    fn three_step_manager() -> MigrationManager<FakeDriver> {
        let mut manager = MigrationManager::new();
        manager.register("one", "", |_d| Box::pin(async { Ok(()) })).unwrap();
        manager.register("two", "one", |_d| Box::pin(async { Ok(()) })).unwrap();
        manager.register("three", "two", |_d| Box::pin(async { Ok(()) })).unwrap();
        manager
    }

    #[test]
    fn head_is_the_unreplaced_revision() {
        let manager = three_step_manager();
        assert_eq!(manager.head_revision().unwrap(), "three");
    }

    #[test]
    fn head_compatibility_spans_one_step() {
        let manager = three_step_manager();
        assert!(manager.is_head_compatible("three").unwrap());
        assert!(manager.is_head_compatible("two").unwrap());
        assert!(!manager.is_head_compatible("one").unwrap());
    }

    #[test]
    fn duplicate_and_reserved_names_rejected() {
        let mut manager = three_step_manager();
        assert!(manager.register("two", "one", |_d| Box::pin(async { Ok(()) })).is_err());
        assert!(manager.register("HEAD", "three", |_d| Box::pin(async { Ok(()) })).is_err());
    }

    #[test]
    fn cycle_rejected_at_registration() {
        let mut manager = MigrationManager::<FakeDriver>::new();
        manager.register("a", "b", |_d| Box::pin(async { Ok(()) })).unwrap();
        // b replaces a, but a already replaces b.
        let err = manager.register("b", "a", |_d| Box::pin(async { Ok(()) })).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn forked_history_has_no_unique_head() {
        let mut manager = MigrationManager::<FakeDriver>::new();
        manager.register("one", "", |_d| Box::pin(async { Ok(()) })).unwrap();
        manager.register("fork-a", "one", |_d| Box::pin(async { Ok(()) })).unwrap();
        manager.register("fork-b", "one", |_d| Box::pin(async { Ok(()) })).unwrap();
        assert!(manager.head_revision().is_err());
    }

    #[tokio::test]
    async fn runs_pending_migrations_in_order() {
        let manager = three_step_manager();
        let driver = FakeDriver::at("one");

        manager.run(&driver, HEAD, false).await.unwrap();
        assert_eq!(*driver.version.lock().unwrap(), "three");
        assert_eq!(*driver.applied.lock().unwrap(), vec!["two", "three"]);
    }

    #[tokio::test]
    async fn dry_run_only_plans() {
        let manager = three_step_manager();
        let driver = FakeDriver::at("");

        manager.run(&driver, HEAD, true).await.unwrap();
        assert_eq!(*driver.version.lock().unwrap(), "");
        assert!(driver.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_target_revision_fails() {
        let manager = three_step_manager();
        let driver = FakeDriver::at("");
        assert!(manager.run(&driver, "nonexistent", false).await.is_err());
    }

    #[tokio::test]
    async fn already_at_head_is_a_no_op() {
        let manager = three_step_manager();
        let driver = FakeDriver::at("three");
        manager.run(&driver, HEAD, false).await.unwrap();
        assert!(driver.applied.lock().unwrap().is_empty());
    }
}
