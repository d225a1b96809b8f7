use chrono::Utc;
use rusqlite::{Result, Row, params};

use crate::db::types::{Binding, Model, Provider};
use crate::db::{Database, to_ts};
use crate::dialect::Dialect;

fn map_provider(row: &Row<'_>) -> Result<Provider> {
    let kind: String = row.get(2)?;
    Ok(Provider {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: Dialect::parse(&kind).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown provider kind: {kind}").into(),
            )
        })?,
        config: row.get(3)?,
    })
}

fn map_model(row: &Row<'_>) -> Result<Model> {
    Ok(Model {
        id: row.get(0)?,
        name: row.get(1)?,
        remark: row.get(2)?,
        max_retry: row.get(3)?,
        timeout_secs: row.get(4)?,
        created_at: crate::db::parse_ts(&row.get::<_, String>(5)?)?,
    })
}

fn map_binding(row: &Row<'_>) -> Result<Binding> {
    Ok(Binding {
        id: row.get(0)?,
        model_id: row.get(1)?,
        provider_id: row.get(2)?,
        upstream_model: row.get(3)?,
        tool_call: row.get(4)?,
        structured_output: row.get(5)?,
        image: row.get(6)?,
        weight: row.get(7)?,
    })
}

impl Database {
    // ---- 配置快照刷新使用的整表读取 ----

    pub async fn list_providers(&self) -> Result<Vec<Provider>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, kind, config FROM providers WHERE deleted_at IS NULL ORDER BY id",
        )?;
        let rows = stmt.query_map([], map_provider)?;
        rows.collect()
    }

    pub async fn list_models(&self) -> Result<Vec<Model>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, remark, max_retry, timeout_secs, created_at
             FROM models WHERE deleted_at IS NULL ORDER BY id",
        )?;
        let rows = stmt.query_map([], map_model)?;
        rows.collect()
    }

    /// JOIN 一次取回所有绑定及其模型名，供快照按模型名分组。
    pub async fn list_bindings_with_model_name(&self) -> Result<Vec<(String, Binding)>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT m.name,
                    mwp.id, mwp.model_id, mwp.provider_id, mwp.upstream_model,
                    mwp.tool_call, mwp.structured_output, mwp.image, mwp.weight
             FROM model_with_providers mwp
             JOIN models m ON m.id = mwp.model_id AND m.deleted_at IS NULL
             WHERE mwp.deleted_at IS NULL
             ORDER BY mwp.id",
        )?;
        let rows = stmt.query_map([], |row| {
            let model_name: String = row.get(0)?;
            let binding = Binding {
                id: row.get(1)?,
                model_id: row.get(2)?,
                provider_id: row.get(3)?,
                upstream_model: row.get(4)?,
                tool_call: row.get(5)?,
                structured_output: row.get(6)?,
                image: row.get(7)?,
                weight: row.get(8)?,
            };
            Ok((model_name, binding))
        })?;
        rows.collect()
    }

    pub async fn get_provider(&self, id: i64) -> Result<Option<Provider>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, kind, config FROM providers WHERE id = ?1 AND deleted_at IS NULL",
        )?;
        let mut rows = stmt.query_map(params![id], map_provider)?;
        rows.next().transpose()
    }

    pub async fn get_model_by_name(&self, name: &str) -> Result<Option<Model>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, remark, max_retry, timeout_secs, created_at
             FROM models WHERE name = ?1 AND deleted_at IS NULL",
        )?;
        let mut rows = stmt.query_map(params![name], map_model)?;
        rows.next().transpose()
    }

    // ---- 管理面写入（外部 CRUD 层经由这里落库）----

    pub async fn create_provider(&self, name: &str, kind: Dialect, config: &str) -> Result<i64> {
        let conn = self.connection.lock().await;
        let now = to_ts(&Utc::now());
        conn.execute(
            "INSERT INTO providers (name, kind, config, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![name, kind.as_str(), config, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn create_model(
        &self,
        name: &str,
        remark: &str,
        max_retry: i64,
        timeout_secs: i64,
    ) -> Result<i64> {
        let conn = self.connection.lock().await;
        let now = to_ts(&Utc::now());
        conn.execute(
            "INSERT INTO models (name, remark, max_retry, timeout_secs, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![name, remark, max_retry, timeout_secs, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn create_binding(
        &self,
        model_id: i64,
        provider_id: i64,
        upstream_model: &str,
        tool_call: Option<bool>,
        structured_output: Option<bool>,
        image: Option<bool>,
        weight: i64,
    ) -> Result<i64> {
        // 入库时权重至少为 1
        let weight = weight.max(1);
        let conn = self.connection.lock().await;
        let now = to_ts(&Utc::now());
        conn.execute(
            "INSERT INTO model_with_providers
             (model_id, provider_id, upstream_model, tool_call, structured_output, image, weight,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                model_id,
                provider_id,
                upstream_model,
                tool_call,
                structured_output,
                image,
                weight,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn delete_provider(&self, id: i64) -> Result<bool> {
        let conn = self.connection.lock().await;
        let now = to_ts(&Utc::now());
        let changed = conn.execute(
            "UPDATE providers SET deleted_at = ?1, updated_at = ?1
             WHERE id = ?2 AND deleted_at IS NULL",
            params![now, id],
        )?;
        Ok(changed > 0)
    }

    pub async fn delete_model(&self, id: i64) -> Result<bool> {
        let conn = self.connection.lock().await;
        let now = to_ts(&Utc::now());
        let changed = conn.execute(
            "UPDATE models SET deleted_at = ?1, updated_at = ?1
             WHERE id = ?2 AND deleted_at IS NULL",
            params![now, id],
        )?;
        Ok(changed > 0)
    }

    pub async fn delete_binding(&self, id: i64) -> Result<bool> {
        let conn = self.connection.lock().await;
        let now = to_ts(&Utc::now());
        let changed = conn.execute(
            "UPDATE model_with_providers SET deleted_at = ?1, updated_at = ?1
             WHERE id = ?2 AND deleted_at IS NULL",
            params![now, id],
        )?;
        Ok(changed > 0)
    }
}
