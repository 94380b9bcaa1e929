//! PostgreSQL materialized-view adapter (spec §4.5 "PostgreSQL variant").

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use semver::Version;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};
use crate::ident::quote_ident;
use crate::model::{ViewInfo, ViewKind};
use crate::pool::pg::PgPool;

use super::port::{view_name, MaterializedViewPort, MvConfig};

/// `ANALYZE`/`CREATE STATISTICS` require no gating beyond the pool's
/// PostgreSQL version already having been checked ≥ 11 at connect time.
pub struct PostgresMvManager {
    pool: PgPool,
    session_id: String,
    config: MvConfig,
    created: Mutex<HashMap<String, ViewInfo>>,
    postgis_version: Version,
}

impl PostgresMvManager {
    #[must_use]
    pub fn new(pool: PgPool, session_id: String, config: MvConfig) -> Self {
        let postgis_version = pool.postgis_version().clone();
        PostgresMvManager {
            pool,
            session_id,
            config,
            created: Mutex::new(HashMap::new()),
            postgis_version,
        }
    }

    async fn ensure_schema(&self) -> EngineResult<String> {
        let client = self.pool.get().await.map_err(EngineError::from)?;
        let preferred = quote_ident(&self.config.schema).map_err(|_| EngineError::Config("invalid MV schema name"))?;
        let create_sql = format!("CREATE SCHEMA IF NOT EXISTS {preferred}");
        match client.execute(create_sql.as_str(), &[]).await {
            Ok(_) => Ok(self.config.schema.clone()),
            Err(_) => {
                warn!(schema = %self.config.schema, "falling back to public schema: permission denied");
                Ok("public".to_string())
            }
        }
    }

    fn full_name(&self, schema: &str, name: &str) -> EngineResult<String> {
        let schema_q = quote_ident(schema)?;
        let name_q = quote_ident(name)?;
        Ok(format!("{schema_q}.{name_q}"))
    }

    async fn create_spatial_index(&self, full_name: &str, view_short_name: &str, geometry_column: &str, feature_count: u64) -> EngineResult<()> {
        let client = self.pool.get().await.map_err(EngineError::from)?;
        let geom_q = quote_ident(geometry_column)?;
        let index_name = quote_ident(&format!("{view_short_name}_gist_idx"))?;
        let include_clause = if self.pool.supports_covering_index() {
            " INCLUDE (\"pk\")"
        } else {
            ""
        };
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {index_name} ON {full_name} USING GIST ({geom_q}){include_clause} WITH (FILLFACTOR=90)"
        );
        if let Err(e) = client.execute(sql.as_str(), &[]).await {
            warn!(error = %e, "spatial index creation failed, continuing without it");
        }

        if self.config.enable_bbox_column && feature_count >= self.config.bbox_column_min_features {
            let bbox_sql = format!("ALTER TABLE {full_name} ADD COLUMN IF NOT EXISTS bbox geometry");
            if let Err(e) = client.execute(bbox_sql.as_str(), &[]).await {
                warn!(error = %e, "bbox column creation failed, continuing without it");
            } else {
                let update_sql = format!("UPDATE {full_name} SET bbox = ST_Envelope({geom_q})");
                let _ = client.execute(update_sql.as_str(), &[]).await;
                let bbox_idx = quote_ident(&format!("{view_short_name}_bbox_gist_idx"))?;
                let bbox_idx_sql = format!("CREATE INDEX IF NOT EXISTS {bbox_idx} ON {full_name} USING GIST (bbox)");
                let _ = client.execute(bbox_idx_sql.as_str(), &[]).await;
            }
        }

        Ok(())
    }

    async fn create_btree_index(&self, full_name: &str, view_short_name: &str, column: &str) -> EngineResult<()> {
        let client = self.pool.get().await.map_err(EngineError::from)?;
        let col_q = quote_ident(column)?;
        let index_name = quote_ident(&format!("{view_short_name}_{column}_btree_idx"))?;
        let sql = format!("CREATE INDEX IF NOT EXISTS {index_name} ON {full_name} ({col_q})");
        if let Err(e) = client.execute(sql.as_str(), &[]).await {
            warn!(error = %e, column, "btree index creation failed, continuing without it");
        }
        Ok(())
    }

    async fn cluster_and_analyze(&self, full_name: &str, view_short_name: &str, feature_count: u64) -> EngineResult<()> {
        if feature_count >= self.config.async_cluster_max_features {
            info!(view = view_short_name, feature_count, "skipping CLUSTER: dataset too large");
        } else {
            let gist_idx = quote_ident(&format!("{view_short_name}_gist_idx"))?;
            let cluster_sql = format!("CLUSTER {full_name} USING {gist_idx}");
            if feature_count < self.config.async_cluster_min_features {
                let client = self.pool.get().await.map_err(EngineError::from)?;
                if let Err(e) = client.execute(cluster_sql.as_str(), &[]).await {
                    warn!(error = %e, "synchronous CLUSTER failed, continuing unclustered");
                }
            } else {
                // Asynchronous path: an independent connection with its own
                // statement_timeout, never touching the shared manager state
                // (spec §4.5, §5 shared-resource rule).
                let pool = self.pool.clone();
                let full_name = full_name.to_string();
                let cluster_sql = cluster_sql.clone();
                tokio::spawn(async move {
                    let Ok(client) = pool.get().await else {
                        return;
                    };
                    if client.execute("SET statement_timeout = '120s'", &[]).await.is_err() {
                        return;
                    }
                    if client.execute(cluster_sql.as_str(), &[]).await.is_err() {
                        return;
                    }
                    let _ = client.execute(format!("ANALYZE {full_name}").as_str(), &[]).await;
                });
                return Ok(());
            }
        }

        let client = self.pool.get().await.map_err(EngineError::from)?;
        let _ = client.execute(format!("ANALYZE {full_name}").as_str(), &[]).await;
        if self.postgis_version.major >= 3 {
            let stats_name = quote_ident(&format!("{view_short_name}_stats"))?;
            let stats_sql = format!("CREATE STATISTICS IF NOT EXISTS {stats_name} ON \"pk\", geom FROM {full_name}");
            let _ = client.execute(stats_sql.as_str(), &[]).await;
        }
        Ok(())
    }
}

#[async_trait]
impl MaterializedViewPort for PostgresMvManager {
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
        let _ = srid;
        let name = view_name(&self.config.prefix, &self.session_id, query);

        if self.view_exists(&name).await? {
            return Ok(name);
        }

        let schema = self.ensure_schema().await?;
        let full = self.full_name(&schema, &name)?;

        let client = self.pool.get().await.map_err(EngineError::from)?;
        let with_clause = if self.config.with_data { "WITH DATA" } else { "WITH NO DATA" };
        let create_sql = format!("CREATE MATERIALIZED VIEW {full} AS {query} {with_clause}");
        client
            .execute(create_sql.as_str(), &[])
            .await
            .map_err(|e| EngineError::MVCreateFailed {
                view_name: name.clone(),
                reason: e.to_string(),
            })?;

        let row_count = if self.config.with_data {
            let row = client.query_one(format!("SELECT count(*) FROM {full}").as_str(), &[]).await;
            row.ok().map(|r| r.get::<_, i64>(0)).unwrap_or(-1)
        } else {
            -1
        };
        let feature_count = row_count.max(0) as u64;

        if self.config.create_spatial_index {
            self.create_spatial_index(&full, &name, geometry_column, feature_count).await?;
        }
        if self.config.create_btree_indexes {
            for col in indexes {
                self.create_btree_index(&full, &name, col).await?;
            }
            self.create_btree_index(&full, &name, "pk").await?;
        }
        self.cluster_and_analyze(&full, &name, feature_count).await?;

        let info = ViewInfo {
            name: name.clone(),
            kind: ViewKind::MaterializedView,
            schema: Some(schema),
            created_at: 0,
            last_refresh: if self.config.with_data { Some(0) } else { None },
            row_count,
            size_bytes: 0,
            is_populated: self.config.with_data,
            definition: query.to_string(),
            session_id: session_scoped.then(|| self.session_id.clone()),
            geometry_column: Some(geometry_column.to_string()),
            srid: Some(srid),
            has_spatial_index: self.config.create_spatial_index,
        };
        self.created.lock().expect("mv registry lock").insert(name.clone(), info);

        let _ = source_table;
        info!(view = %name, "created materialized view");
        Ok(name)
    }

    async fn refresh_view(&self, view_name: &str) -> EngineResult<bool> {
        let schema = {
            let guard = self.created.lock().expect("mv registry lock");
            guard
                .get(view_name)
                .and_then(|v| v.schema.clone())
                .unwrap_or_else(|| self.config.schema.clone())
        };
        let full = self.full_name(&schema, view_name)?;
        let client = self.pool.get().await.map_err(EngineError::from)?;
        let concurrently = if self.config.concurrent_refresh { "CONCURRENTLY" } else { "" };
        let sql = format!("REFRESH MATERIALIZED VIEW {concurrently} {full}");
        match client.execute(sql.as_str(), &[]).await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(view = view_name, error = %e, "materialized view refresh failed");
                Ok(false)
            }
        }
    }

    async fn drop_view(&self, view_name: &str, if_exists: bool) -> EngineResult<bool> {
        let schema = {
            let mut guard = self.created.lock().expect("mv registry lock");
            guard.remove(view_name).and_then(|v| v.schema).unwrap_or_else(|| self.config.schema.clone())
        };
        let full = self.full_name(&schema, view_name)?;
        let client = self.pool.get().await.map_err(EngineError::from)?;
        let if_exists_sql = if if_exists { "IF EXISTS" } else { "" };
        let sql = format!("DROP MATERIALIZED VIEW {if_exists_sql} {full} CASCADE");
        match client.execute(sql.as_str(), &[]).await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(view = view_name, error = %e, "materialized view drop failed");
                Ok(false)
            }
        }
    }

    async fn view_exists(&self, view_name: &str) -> EngineResult<bool> {
        if self.created.lock().expect("mv registry lock").contains_key(view_name) {
            return Ok(true);
        }
        let client = self.pool.get().await.map_err(EngineError::from)?;
        let row = client
            .query_opt(
                "SELECT 1 FROM pg_matviews WHERE matviewname = $1",
                &[&view_name],
            )
            .await
            .map_err(|e| EngineError::MVCreateFailed {
                view_name: view_name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(row.is_some())
    }

    async fn get_view_info(&self, view_name: &str) -> EngineResult<Option<ViewInfo>> {
        Ok(self.created.lock().expect("mv registry lock").get(view_name).cloned())
    }

    async fn list_session_views(&self) -> EngineResult<Vec<ViewInfo>> {
        Ok(self
            .created
            .lock()
            .expect("mv registry lock")
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
                Ok(false) => warn!(view = %name, "cleanup could not drop view, leaving dangling entry"),
                Err(e) => warn!(view = %name, error = %e, "cleanup drop errored, continuing"),
            }
        }
        Ok(dropped)
    }

    async fn get_feature_ids(&self, view_name: &str, primary_key: &str) -> EngineResult<Vec<i64>> {
        let schema = {
            let guard = self.created.lock().expect("mv registry lock");
            guard
                .get(view_name)
                .and_then(|v| v.schema.clone())
                .unwrap_or_else(|| self.config.schema.clone())
        };
        let full = self.full_name(&schema, view_name)?;
        let pk_q = quote_ident(primary_key)?;
        let client = self.pool.get().await.map_err(EngineError::from)?;
        let sql = format!("SELECT {pk_q} FROM {full}");
        let rows = client
            .query(sql.as_str(), &[])
            .await
            .map_err(|e| EngineError::MVCreateFailed {
                view_name: view_name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(rows.iter().map(|r| r.get::<_, i64>(0)).collect())
    }
}
