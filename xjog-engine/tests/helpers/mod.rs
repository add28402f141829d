#![allow(dead_code)]

pub mod machines;

use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Statement};
use std::time::Duration;
use xjog_engine::EngineSettings;
use xjog_migration::MigratorTrait;

/// Creates a uniquely named database from `DATABASE_URL` and runs the
/// migrator. Each engine under test gets its own connection via
/// [`TestDb::connect`] so instances behave like separate processes.
pub struct TestDb {
    base_url: String,
    db_name: String,
    admin: DatabaseConnection,
}

impl TestDb {
    pub async fn new(test_name: &str) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let base_url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set to initialize a test database")
            .trim_end_matches('/')
            .to_string();
        let admin = Database::connect(&base_url)
            .await
            .expect("connection to postgres (without database) failed");
        let db_name = format!("xjog_test_{test_name}");

        execute(&admin, format!("DROP DATABASE IF EXISTS \"{db_name}\" WITH (FORCE)")).await;
        execute(&admin, format!("CREATE DATABASE \"{db_name}\"")).await;

        let conn = Database::connect(format!("{base_url}/{db_name}"))
            .await
            .expect("connection to test database failed");
        xjog_migration::Migrator::up(&conn, None)
            .await
            .expect("migration failed");
        let _ = conn.close().await;

        Self {
            base_url,
            db_name,
            admin,
        }
    }

    pub async fn connect(&self) -> DatabaseConnection {
        Database::connect(format!("{}/{}", self.base_url, self.db_name))
            .await
            .expect("connection to test database failed")
    }
}

async fn execute(db: &DatabaseConnection, sql: String) {
    db.execute(Statement::from_string(db.get_database_backend(), sql))
        .await
        .expect("test database statement failed");
}

/// Settings tightened so lifecycle scenarios settle within a test run.
pub fn fast_settings() -> EngineSettings {
    let mut settings = EngineSettings::default();
    settings.startup.adoption_frequency = Duration::from_millis(50);
    settings.startup.grace_period = Duration::from_millis(400);
    settings.startup.death_note_polling_frequency = Duration::from_millis(100);
    settings.deferred_events.interval = Duration::from_millis(100);
    settings.shutdown.own_chart_polling_frequency = Duration::from_millis(50);
    settings
}

/// Inline polling loop: evaluates the condition expression until it holds or
/// the deadline passes.
#[macro_export]
macro_rules! wait_until {
    ($what:expr, $deadline:expr, $condition:expr) => {{
        let started = tokio::time::Instant::now();
        loop {
            if $condition {
                break;
            }
            assert!(started.elapsed() < $deadline, "timed out waiting for: {}", $what);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }};
}
