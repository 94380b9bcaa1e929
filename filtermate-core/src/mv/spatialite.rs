//! SpatiaLite temp-table adapter (spec §4.5 "SpatiaLite variant").
//!
//! SpatiaLite has no materialized views, so the engine emulates one
//! with an ordinary, non-temporary table plus `RecoverGeometryColumn`
//! and `CreateSpatialIndex` to install an R-tree (GLOSSARY "Temp table
//! (SpatiaLite sense)").

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::ident::quote_ident;
use crate::model::{ViewInfo, ViewKind};
use crate::pool::sqlite::execute_with_retry;

use super::port::{view_name, MaterializedViewPort, MvConfig};

pub struct SpatialiteTempTableManager {
    pool: SqlitePool,
    session_id: String,
    config: MvConfig,
    created: Mutex<HashMap<String, ViewInfo>>,
}

impl SpatialiteTempTableManager {
    #[must_use]
    pub fn new(pool: SqlitePool, session_id: String, config: MvConfig) -> Self {
        SpatialiteTempTableManager {
            pool,
            session_id,
            config,
            created: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl MaterializedViewPort for SpatialiteTempTableManager {
    fn config(&self) -> &MvConfig {
        &self.config
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn create_view(
        &self,
        query: &str,
        source_table: &str,
        geometry_column: &str,
        srid: i32,
        indexes: &[String],
        session_scoped: bool,
    ) -> EngineResult<String> {
        let _ = source_table;
        let name = view_name(&self.config.prefix, &self.session_id, query);

        if self.view_exists(&name).await? {
            return Ok(name);
        }

        let name_q = quote_ident(&name)?;
        let create_sql = format!("CREATE TABLE {name_q} AS {query}");
        execute_with_retry(|| async {
            sqlx::query(create_sql.as_str()).execute(&self.pool).await
        })
        .await
        .map_err(|e| EngineError::MVCreateFailed {
            view_name: name.clone(),
            reason: e.to_string(),
        })?;

        if self.config.register_geometry {
            let recover_sql = format!(
                "SELECT RecoverGeometryColumn('{name}', '{geometry_column}', {srid}, 'GEOMETRY', 'XY')"
            );
            if let Err(e) = sqlx::query(recover_sql.as_str()).execute(&self.pool).await {
                warn!(view = %name, error = %e, "RecoverGeometryColumn failed, continuing without registering geometry");
            }
        }

        if self.config.use_rtree {
            let index_sql = format!("SELECT CreateSpatialIndex('{name}', '{geometry_column}')");
            if let Err(e) = sqlx::query(index_sql.as_str()).execute(&self.pool).await {
                warn!(view = %name, error = %e, "CreateSpatialIndex failed, continuing without R-tree");
            }
        }

        if self.config.create_btree_indexes {
            for col in indexes {
                let col_q = quote_ident(col)?;
                let idx_name = quote_ident(&format!("{name}_{col}_idx"))?;
                let idx_sql = format!("CREATE INDEX IF NOT EXISTS {idx_name} ON {name_q} ({col_q})");
                let _ = sqlx::query(idx_sql.as_str()).execute(&self.pool).await;
            }
        }

        let row_count = sqlx::query(format!("SELECT count(*) AS c FROM {name_q}").as_str())
            .fetch_one(&self.pool)
            .await
            .ok()
            .map(|r| r.get::<i64, _>("c"))
            .unwrap_or(-1);

        let info = ViewInfo {
            name: name.clone(),
            kind: ViewKind::TempTable,
            schema: None,
            created_at: 0,
            last_refresh: Some(0),
            row_count,
            size_bytes: 0,
            is_populated: true,
            definition: query.to_string(),
            session_id: session_scoped.then(|| self.session_id.clone()),
            geometry_column: Some(geometry_column.to_string()),
            srid: Some(srid),
            has_spatial_index: self.config.use_rtree,
        };
        self.created.lock().expect("temp table registry lock").insert(name.clone(), info);

        Ok(name)
    }

    async fn refresh_view(&self, view_name: &str) -> EngineResult<bool> {
        let info = self.created.lock().expect("temp table registry lock").get(view_name).cloned();
        let Some(info) = info else {
            return Ok(false);
        };
        if !self.drop_view(view_name, true).await? {
            return Ok(false);
        }
        self.create_view(
            &info.definition,
            "",
            info.geometry_column.as_deref().unwrap_or("geom"),
            info.srid.unwrap_or(4326),
            &[],
            info.session_id.is_some(),
        )
        .await?;
        Ok(true)
    }

    async fn drop_view(&self, view_name: &str, if_exists: bool) -> EngineResult<bool> {
        let name_q = quote_ident(view_name)?;
        let if_exists_sql = if if_exists { "IF EXISTS" } else { "" };
        let sql = format!("DROP TABLE {if_exists_sql} {name_q}");
        self.created.lock().expect("temp table registry lock").remove(view_name);
        match sqlx::query(sql.as_str()).execute(&self.pool).await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(view = view_name, error = %e, "temp table drop failed");
                Ok(false)
            }
        }
    }

    async fn view_exists(&self, view_name: &str) -> EngineResult<bool> {
        if self.created.lock().expect("temp table registry lock").contains_key(view_name) {
            return Ok(true);
        }
        let row = sqlx::query("SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?")
            .bind(view_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(EngineError::from)?;
        Ok(row.is_some())
    }

    async fn get_view_info(&self, view_name: &str) -> EngineResult<Option<ViewInfo>> {
        Ok(self.created.lock().expect("temp table registry lock").get(view_name).cloned())
    }

    async fn list_session_views(&self) -> EngineResult<Vec<ViewInfo>> {
        Ok(self
            .created
            .lock()
            .expect("temp table registry lock")
            .values()
            .filter(|v| v.session_id.as_deref() == Some(self.session_id.as_str()))
            .cloned()
            .collect())
    }

    async fn cleanup_session_views(&self) -> EngineResult<usize> {
        let names: Vec<String> = self.list_session_views().await?.into_iter().map(|v| v.name).collect();
        let mut dropped = 0usize;
        for name in names {
            match self.drop_view(&name, true).await {
                Ok(true) => dropped += 1,
                Ok(false) => warn!(view = %name, "cleanup could not drop temp table, leaving dangling entry"),
                Err(e) => warn!(view = %name, error = %e, "cleanup drop errored, continuing"),
            }
        }
        Ok(dropped)
    }

    async fn get_feature_ids(&self, view_name: &str, primary_key: &str) -> EngineResult<Vec<i64>> {
        let name_q = quote_ident(view_name)?;
        let pk_q = quote_ident(primary_key)?;
        let sql = format!("SELECT {pk_q} AS pk FROM {name_q}");
        let rows = sqlx::query(sql.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(EngineError::from)?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("pk")).collect())
    }
}
