use std::{path::Path, thread};

use sqlx::PgPool;
use tokio::runtime::Runtime;

/// throwaway postgres database for integration tests: created with a unique
/// name on construction, migrated, and dropped again when the value drops
pub struct TestDb {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

impl TestDb {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        password: impl Into<String>,
        migrations: impl Into<String>,
    ) -> TestDb {
        let mut tdb = TestDb {
            host: host.into(),
            port,
            user: user.into(),
            password: password.into(),
            dbname: "".into(),
        };
        tdb.dbname = format!("test_{}", uuid::Uuid::new_v4().simple());
        let server_url = tdb.server_url();
        let url = tdb.url();
        let dbname = tdb.dbname.clone();
        let migrations = migrations.into();
        // run create + migrate on a dedicated runtime so this works from
        // inside a #[tokio::test]
        thread::spawn(move || {
            Runtime::new().unwrap().block_on(async move {
                let conn = PgPool::connect(&server_url).await.unwrap();
                sqlx::query(&format!(r#"CREATE DATABASE "{}""#, dbname))
                    .execute(&conn)
                    .await
                    .unwrap();

                let conn = PgPool::connect(&url).await.unwrap();
                sqlx::migrate::Migrator::new(Path::new(&migrations))
                    .await
                    .unwrap()
                    .run(&conn)
                    .await
                    .unwrap();
            });
        })
        .join()
        .unwrap();
        tdb
    }

    pub fn server_url(&self) -> String {
        if self.password.is_empty() {
            format!("postgres://{}@{}:{}", self.user, self.host, self.port)
        } else {
            format!(
                "postgres://{}:{}@{}:{}",
                self.user, self.password, self.host, self.port
            )
        }
    }

    pub fn url(&self) -> String {
        format!("{}/{}", self.server_url(), self.dbname)
    }

    pub async fn pool(&self) -> PgPool {
        sqlx::Pool::connect(&self.url()).await.unwrap()
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        let server_url = self.server_url();
        let dbname = self.dbname.clone();
        thread::spawn(move || {
            Runtime::new().unwrap().block_on(async move {
                let conn = PgPool::connect(&server_url).await.unwrap();
                // kick out any connection still attached to the test database
                sqlx::query(&format!(
                    "SELECT pg_terminate_backend(pg_stat_activity.pid) FROM pg_stat_activity
                     WHERE pg_stat_activity.datname = '{dbname}' AND pid <> pg_backend_pid();"
                ))
                .execute(&conn)
                .await
                .unwrap();
                sqlx::query(&format!(r#"DROP DATABASE "{dbname}""#))
                    .execute(&conn)
                    .await
                    .unwrap();
            });
        })
        .join()
        .unwrap();
    }
}
