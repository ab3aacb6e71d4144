//! SQLite-слой: серверы, учёт занятых мест и журнал неудалённых ключей.

use crate::config::ServerEntry;
use crate::panel::{PanelKind, ServerDescriptor};
use sqlx::FromRow;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, FromRow)]
struct ServerRow {
    id: i64,
    name: String,
    type_vpn: i64,
    address: String,
    outline_link: Option<String>,
}

impl From<ServerRow> for ServerDescriptor {
    fn from(row: ServerRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            kind: PanelKind::from_code(row.type_vpn),
            address: row.address,
            outline_link: row.outline_link,
        }
    }
}

/// Ключ, который не удалось подтверждённо удалить с панели.
#[derive(Debug, Clone, FromRow)]
pub struct UnresolvedDeletion {
    pub id: i64,
    pub name_key: String,
    pub key_id: i64,
    pub server_id: i64,
    pub wg_public_key: String,
    pub created_at: i64,
}

/// Итог синхронизации реестра серверов с конфигом.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSync {
    pub upserted: usize,
    pub removed: u64,
}

pub struct Db {
    pool: SqlitePool,
}

fn current_unix_timestamp() -> Result<i64, anyhow::Error> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .map_err(|err| anyhow::anyhow!("Системное время меньше UNIX_EPOCH: {}", err))
}

impl Db {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("Не удалось создать директорию для БД: {}", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts)
            .await
            .map_err(|e| anyhow::anyhow!("Не удалось подключиться к SQLite: {}", e))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// In-memory база живёт, пока жив единственный коннект пула.
    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, anyhow::Error> {
        use sqlx::sqlite::SqlitePoolOptions;

        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                type_vpn INTEGER NOT NULL,
                address TEXT NOT NULL,
                login TEXT,
                password TEXT,
                outline_link TEXT,
                inbound_id INTEGER,
                work INTEGER NOT NULL DEFAULT 1
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Миграция servers: {}", e))?;

        self.ensure_column_exists("servers", "actual_space", "INTEGER NOT NULL DEFAULT 0")
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS unresolved_deletions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name_key TEXT NOT NULL,
                key_id INTEGER NOT NULL,
                server_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_unresolved_triple
                ON unresolved_deletions(name_key, key_id, server_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Миграция unresolved_deletions: {}", e))?;

        self.ensure_column_exists(
            "unresolved_deletions",
            "wg_public_key",
            "TEXT NOT NULL DEFAULT ''",
        )
        .await?;

        Ok(())
    }

    async fn ensure_column_exists(
        &self,
        table: &str,
        column: &str,
        sql_type: &str,
    ) -> Result<(), anyhow::Error> {
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM pragma_table_info('{}') WHERE name = '{}'",
            table, column
        ))
        .fetch_one(&self.pool)
        .await?;
        if count == 0 {
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table, column, sql_type
            ))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Приводит таблицу `servers` к списку из конфига. `actual_space` существующих
    /// серверов сохраняется; серверы, которых нет в списке, удаляются.
    pub async fn sync_servers(&self, servers: &[ServerEntry]) -> Result<ServerSync, anyhow::Error> {
        let mut tx = self.pool.begin().await?;
        for server in servers {
            sqlx::query(
                r#"
                INSERT INTO servers (id, name, type_vpn, address, login, password, outline_link, inbound_id)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    type_vpn = excluded.type_vpn,
                    address = excluded.address,
                    login = excluded.login,
                    password = excluded.password,
                    outline_link = excluded.outline_link,
                    inbound_id = excluded.inbound_id
                "#,
            )
            .bind(server.id)
            .bind(server.name.as_str())
            .bind(server.type_vpn)
            .bind(server.address.as_str())
            .bind(server.login.as_deref())
            .bind(server.password.as_deref())
            .bind(server.outline_link.as_deref())
            .bind(server.inbound_id)
            .execute(&mut *tx)
            .await?;
        }

        let ids = serde_json::to_string(&servers.iter().map(|s| s.id).collect::<Vec<_>>())?;
        let removed = sqlx::query("DELETE FROM servers WHERE id NOT IN (SELECT value FROM json_each(?))")
            .bind(ids)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(ServerSync {
            upserted: servers.len(),
            removed,
        })
    }

    /// Синхронизирует реестр с конфигом (если там есть `[[servers]]`) и проверяет,
    /// что он не пуст: без серверов любое удаление молча считалось бы выполненным.
    pub async fn load_registry(&self, servers: &[ServerEntry]) -> Result<i64, anyhow::Error> {
        if servers.is_empty() {
            tracing::info!("No [[servers]] in config, using servers table as is");
        } else {
            let sync = self.sync_servers(servers).await?;
            tracing::info!(
                upserted = sync.upserted,
                removed = sync.removed,
                "Server registry synced from config"
            );
        }
        let total = self.count_servers().await?;
        if total == 0 {
            anyhow::bail!("Реестр серверов пуст: добавьте [[servers]] в конфиг");
        }
        Ok(total)
    }

    pub async fn count_servers(&self) -> Result<i64, anyhow::Error> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM servers")
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }

    pub async fn get_server(&self, server_id: i64) -> Result<Option<ServerDescriptor>, anyhow::Error> {
        let row = sqlx::query_as::<_, ServerRow>(
            "SELECT id, name, type_vpn, address, outline_link FROM servers WHERE id = ?",
        )
        .bind(server_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ServerDescriptor::from))
    }

    /// Записывает фактическое число клиентов на сервере. `false`, если сервера нет.
    pub async fn update_space(&self, server_id: i64, count: i64) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("UPDATE servers SET actual_space = ? WHERE id = ?")
            .bind(count)
            .bind(server_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Дубликаты допустимы: очистка удаляет все строки тройки.
    /// `wg_public_key` хранится только для повторного запуска удаления из админки.
    pub async fn record_unresolved(
        &self,
        name_key: &str,
        key_id: i64,
        server_id: i64,
        wg_public_key: &str,
    ) -> Result<(), anyhow::Error> {
        let now = current_unix_timestamp()?;
        sqlx::query(
            "INSERT INTO unresolved_deletions (name_key, key_id, server_id, wg_public_key, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name_key)
        .bind(key_id)
        .bind(server_id)
        .bind(wg_public_key)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_unresolved(
        &self,
        name_key: &str,
        key_id: i64,
        server_id: i64,
    ) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            "DELETE FROM unresolved_deletions WHERE name_key = ? AND key_id = ? AND server_id = ?",
        )
        .bind(name_key)
        .bind(key_id)
        .bind(server_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_unresolved(&self) -> Result<i64, anyhow::Error> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM unresolved_deletions")
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }

    pub async fn list_unresolved(&self, limit: i64) -> Result<Vec<UnresolvedDeletion>, anyhow::Error> {
        let rows = sqlx::query_as::<_, UnresolvedDeletion>(
            "SELECT id, name_key, key_id, server_id, wg_public_key, created_at
             FROM unresolved_deletions
             ORDER BY created_at ASC, id ASC
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_unresolved(&self, id: i64) -> Result<Option<UnresolvedDeletion>, anyhow::Error> {
        let row = sqlx::query_as::<_, UnresolvedDeletion>(
            "SELECT id, name_key, key_id, server_id, wg_public_key, created_at FROM unresolved_deletions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[cfg(test)]
pub fn server_entry(id: i64, type_vpn: i64) -> ServerEntry {
    ServerEntry {
        id,
        name: format!("srv-{}", id),
        type_vpn,
        address: "10.0.0.7".to_string(),
        login: Some("admin".to_string()),
        password: Some("secret".to_string()),
        outline_link: None,
        inbound_id: Some(2),
    }
}

#[cfg(test)]
impl Db {
    pub async fn actual_space(&self, server_id: i64) -> Result<Option<i64>, anyhow::Error> {
        let space = sqlx::query_scalar::<_, i64>("SELECT actual_space FROM servers WHERE id = ?")
            .bind(server_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(space)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_lookup_maps_panel_kind() {
        let db = Db::open_in_memory().await.unwrap();
        db.sync_servers(&[server_entry(7, 3)]).await.unwrap();

        let server = db.get_server(7).await.unwrap().unwrap();
        assert_eq!(server.kind, PanelKind::WireGuard);
        assert_eq!(server.address, "10.0.0.7");
        assert!(db.get_server(107).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_space_reports_missing_server() {
        let db = Db::open_in_memory().await.unwrap();
        db.sync_servers(&[server_entry(7, 3)]).await.unwrap();

        assert!(db.update_space(7, 17).await.unwrap());
        assert_eq!(db.actual_space(7).await.unwrap(), Some(17));

        db.sync_servers(&[server_entry(8, 1)]).await.unwrap();
        assert!(!db.update_space(7, 3).await.unwrap());
    }

    #[tokio::test]
    async fn sync_updates_keeps_space_and_drops_unlisted() {
        let db = Db::open_in_memory().await.unwrap();
        assert_eq!(db.count_servers().await.unwrap(), 0);

        let first = db
            .sync_servers(&[server_entry(7, 3), server_entry(8, 1)])
            .await
            .unwrap();
        assert_eq!(first, ServerSync { upserted: 2, removed: 0 });
        db.update_space(7, 12).await.unwrap();

        let mut moved = server_entry(7, 3);
        moved.address = "10.0.0.70".to_string();
        let second = db.sync_servers(&[moved]).await.unwrap();
        assert_eq!(second, ServerSync { upserted: 1, removed: 1 });

        assert_eq!(db.count_servers().await.unwrap(), 1);
        assert_eq!(db.get_server(7).await.unwrap().unwrap().address, "10.0.0.70");
        assert_eq!(db.actual_space(7).await.unwrap(), Some(12));
        assert!(db.get_server(8).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_registry_refuses_to_start() {
        let db = Db::open_in_memory().await.unwrap();
        assert!(db.load_registry(&[]).await.is_err());

        assert_eq!(db.load_registry(&[server_entry(7, 3)]).await.unwrap(), 1);
        // без [[servers]] таблица остаётся как есть
        assert_eq!(db.load_registry(&[]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_removes_every_duplicate_and_is_repeatable() {
        let db = Db::open_in_memory().await.unwrap();
        db.record_unresolved("5001.42.wg", 42, 7, "").await.unwrap();
        db.record_unresolved("5001.42.wg", 42, 7, "").await.unwrap();
        db.record_unresolved("5001.43.wg", 43, 7, "").await.unwrap();
        assert_eq!(db.count_unresolved().await.unwrap(), 3);

        assert!(db.clear_unresolved("5001.42.wg", 42, 7).await.unwrap());
        assert!(!db.clear_unresolved("5001.42.wg", 42, 7).await.unwrap());

        let rest = db.list_unresolved(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].key_id, 43);
        let row = db.get_unresolved(rest[0].id).await.unwrap().unwrap();
        assert_eq!(row.name_key, "5001.43.wg");
    }
}
