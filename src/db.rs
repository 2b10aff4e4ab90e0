use log::{debug, info};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};
use std::fs::{self, OpenOptions};
use std::path::Path;

use crate::config::AppConfig;

pub async fn connect_db(config: &AppConfig) -> Result<DatabaseConnection, DbErr> {
    let url = config.database_url();
    let mut options = ConnectOptions::new(url.clone());
    if is_memory(&url) {
        // every pooled connection would otherwise see its own empty database
        options.max_connections(1).min_connections(1);
    } else {
        ensure_sqlite_path(&url);
    }
    options.sqlx_logging(false);

    let db = Database::connect(options).await?;
    init_sqlite_schema(&db).await?;
    Ok(db)
}

fn is_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

fn ensure_sqlite_path(raw: &str) {
    let path = raw
        .strip_prefix("sqlite://")
        .or_else(|| raw.strip_prefix("sqlite:"))
        .unwrap_or(raw);
    let path = path.split('?').next().unwrap_or(path);
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let _ = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path);
}

async fn init_sqlite_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let exists_stmt = Statement::from_string(
        backend,
        "SELECT name FROM sqlite_master WHERE type='table' AND name='t_user' LIMIT 1",
    );
    let exists = db.query_one(exists_stmt).await?.is_some();
    if exists {
        debug!("schema already present");
        return Ok(());
    }

    let sql = include_str!("../schema-sqlite.sql");
    for stmt in split_sql(sql) {
        db.execute(Statement::from_string(backend, stmt)).await?;
    }
    info!("schema initialised");
    Ok(())
}

fn split_sql(input: &str) -> Vec<String> {
    let mut buf = String::new();
    for line in input.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("--") || trimmed.is_empty() {
            continue;
        }
        buf.push_str(line);
        buf.push('\n');
    }
    buf.split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

pub fn is_unique_violation(err: &DbErr) -> bool {
    let msg = err.to_string();
    msg.contains("UNIQUE") || msg.contains("Duplicate")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_sql_skips_comments_and_blank_statements() {
        let sql = "-- header\nCREATE TABLE a (id INTEGER);\n\n  -- note\nCREATE INDEX i ON a (id);\n;";
        let stmts = split_sql(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE a"));
        assert!(stmts[1].starts_with("CREATE INDEX i"));
    }

    #[test]
    fn bundled_schema_splits_into_statements() {
        let stmts = split_sql(include_str!("../schema-sqlite.sql"));
        assert!(stmts.iter().any(|s| s.contains("uk_email_primary")));
        assert!(stmts.iter().all(|s| !s.starts_with("--")));
    }

    #[actix_web::test]
    async fn memory_database_gets_schema() {
        let db = connect_db(&AppConfig::for_tests()).await.unwrap();
        let backend = db.get_database_backend();
        let row = db
            .query_one(Statement::from_string(
                backend,
                "SELECT COUNT(*) AS cnt FROM sqlite_master WHERE type='table' AND name LIKE 't_%'",
            ))
            .await
            .unwrap()
            .unwrap();
        let cnt: i64 = row.try_get("", "cnt").unwrap();
        assert_eq!(cnt, 4);
    }
}
