mod sqlx_tester;

pub use sqlx_tester::TestDb;
