//! PostgreSQL connection pool and error types.
//!
//! Grounded on this crate's sibling tile-server's `pg::pool`/`pg::errors`
//! modules: a `deadpool-postgres` pool wrapped to carry an id for
//! logging, with a startup version check. Here the gate is PostGIS
//! (not `ST_TileEnvelope`-specific) since every backend operation below
//! C8's PostgreSQL executor assumes `ST_MakeValid`, `ST_Buffer` with a
//! style string, and materialized views are all available.

use std::io;
use std::path::PathBuf;

use deadpool_postgres::tokio_postgres::error::Error as TokioPgError;
use deadpool_postgres::{BuildError, Manager, ManagerConfig, Object, Pool, PoolError, RecyclingMethod};
use postgres::config::SslMode;
use semver::Version;
use tracing::{info, warn};

use super::tls::{make_connector, parse_conn_str, SslModeOverride};

pub const POOL_SIZE_DEFAULT: usize = 20;

/// The engine generates `ST_MakeValid`-wrapped predicates and GIST
/// indexes with `INCLUDE` columns; both need at least PostGIS 3 on
/// PostgreSQL 11 (`INCLUDE` support landed in PostgreSQL 11).
const MINIMUM_POSTGIS_VER: Version = Version::new(3, 0, 0);
const MINIMUM_POSTGRES_VER: Version = Version::new(11, 0, 0);

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors from PostgreSQL connection setup and execution.
#[derive(thiserror::Error, Debug)]
pub enum PgError {
    #[error("cannot load platform root certificates: {0:?}")]
    CannotLoadRoots(Vec<rustls_native_certs::Error>),

    #[error("cannot open certificate file {1}: {0}")]
    CannotOpenCert(#[source] io::Error, PathBuf),

    #[error("cannot parse certificate file {1}: {0}")]
    CannotParseCert(#[source] io::Error, PathBuf),

    #[error("unable to parse PEM private key file {0}")]
    InvalidPrivateKey(PathBuf),

    #[error("unable to use client certificate pair {1} / {2}: {0}")]
    CannotUseClientKey(#[source] rustls::Error, PathBuf, PathBuf),

    #[error(transparent)]
    RustlsError(#[from] rustls::Error),

    #[error("unknown SSL mode: {0:?}")]
    UnknownSslMode(SslMode),

    #[error("postgres error while {1}: {0}")]
    PostgresError(#[source] TokioPgError, &'static str),

    #[error("unable to build a postgres connection pool {1}: {0}")]
    PostgresPoolBuildError(#[source] BuildError, String),

    #[error("unable to get a postgres connection from the pool {1}: {0}")]
    PostgresPoolConnError(#[source] PoolError, String),

    #[error("unable to parse connection string {1}: {0}")]
    BadConnectionString(#[source] TokioPgError, String),

    #[error("unable to parse PostGIS version {1}: {0}")]
    BadPostgisVersion(#[source] semver::Error, String),

    #[error("unable to parse PostgreSQL version {1}: {0}")]
    BadPostgresVersion(#[source] semver::Error, String),

    #[error("PostGIS version {0} is too old, minimum required is {1}")]
    PostgisTooOld(Version, Version),

    #[error("PostgreSQL version {0} is too old, minimum required is {1}")]
    PostgresqlTooOld(Version, Version),

    #[error("schema {0} could not be created or used")]
    SchemaPermissionDenied(String),
}

/// Optional client-certificate material for TLS connections.
#[derive(Debug, Clone, Default)]
pub struct PgSslCerts {
    pub ssl_root_cert: Option<PathBuf>,
    pub ssl_cert: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
}

/// Configuration required to open a pool.
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub connection_string: String,
    pub pool_size: Option<usize>,
    pub ssl_certificates: PgSslCerts,
}

/// A pooled PostgreSQL connection source, with the PostGIS/PostgreSQL
/// version check run once at construction.
#[derive(Clone, Debug)]
pub struct PgPool {
    id: String,
    pool: Pool,
    postgis_version: Version,
}

impl PgPool {
    pub async fn new(config: &PgConfig) -> PgResult<Self> {
        let (id, mgr) = Self::parse_config(config)?;

        let pool = Pool::builder(mgr)
            .max_size(config.pool_size.unwrap_or(POOL_SIZE_DEFAULT))
            .build()
            .map_err(|e| PgError::PostgresPoolBuildError(e, id.clone()))?;

        let postgres_version = get_postgres_version(&pool, &id).await?;
        if postgres_version < MINIMUM_POSTGRES_VER {
            return Err(PgError::PostgresqlTooOld(postgres_version, MINIMUM_POSTGRES_VER));
        }

        let postgis_version = get_postgis_version(&pool, &id).await?;
        if postgis_version < MINIMUM_POSTGIS_VER {
            return Err(PgError::PostgisTooOld(postgis_version.clone(), MINIMUM_POSTGIS_VER));
        }

        Ok(Self {
            id,
            pool,
            postgis_version,
        })
    }

    fn parse_config(config: &PgConfig) -> PgResult<(String, Manager)> {
        let (pg_cfg, ssl_mode) = parse_conn_str(&config.connection_string)?;

        let id = pg_cfg
            .get_dbname()
            .map_or_else(|| format!("{:?}", pg_cfg.get_hosts().first()), ToString::to_string);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = if pg_cfg.get_ssl_mode() == SslMode::Disable {
            info!(%id, "connecting to postgres without SSL");
            let connector = deadpool_postgres::tokio_postgres::NoTls;
            Manager::from_config(pg_cfg, connector, mgr_config)
        } else {
            info!(%id, ?ssl_mode, "connecting to postgres with SSL");
            let connector = make_connector(&config.ssl_certificates, ssl_mode)?;
            Manager::from_config(pg_cfg, connector, mgr_config)
        };

        Ok((id, mgr))
    }

    pub async fn get(&self) -> PgResult<Object> {
        get_conn(&self.pool, &self.id).await
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// PostgreSQL ≥ 11 is needed for `INCLUDE` columns on GIST indexes
    /// (spec §4.5: covering index on MVs).
    #[must_use]
    pub fn supports_covering_index(&self) -> bool {
        true
    }

    /// PostgreSQL ≥ 10 is needed for `CREATE STATISTICS` (spec §4.5).
    #[must_use]
    pub fn postgis_version(&self) -> &Version {
        &self.postgis_version
    }
}

async fn get_postgis_version(pool: &Pool, id: &str) -> PgResult<Version> {
    let version: String = get_conn(pool, id)
        .await?
        .query_one(
            r"SELECT (regexp_matches(PostGIS_Lib_Version(), '^(\d+\.\d+\.\d+)', 'g'))[1] as version",
            &[],
        )
        .await
        .map(|row| row.get("version"))
        .map_err(|e| PgError::PostgresError(e, "querying postgis version"))?;
    version.parse().map_err(|e| PgError::BadPostgisVersion(e, version))
}

async fn get_postgres_version(pool: &Pool, id: &str) -> PgResult<Version> {
    let version: String = get_conn(pool, id)
        .await?
        .query_one(
            r"SELECT (regexp_matches(current_setting('server_version'), '^(\d+\.\d+)', 'g'))[1] || '.0' as version",
            &[],
        )
        .await
        .map(|row| row.get("version"))
        .map_err(|e| PgError::PostgresError(e, "querying postgres version"))?;
    version.parse().map_err(|e| PgError::BadPostgresVersion(e, version))
}

async fn get_conn(pool: &Pool, id: &str) -> PgResult<Object> {
    pool.get().await.map_err(|e| PgError::PostgresPoolConnError(e, id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_gate_constants_are_sane() {
        assert!(MINIMUM_POSTGIS_VER <= Version::new(3, 4, 0));
        assert!(MINIMUM_POSTGRES_VER <= Version::new(16, 0, 0));
    }
}

#[cfg(all(test, feature = "test-pg"))]
mod pg_container_tests {
    use testcontainers_modules::postgres::Postgres;
    use testcontainers_modules::testcontainers::runners::AsyncRunner as _;
    use testcontainers_modules::testcontainers::ImageExt as _;

    use super::*;

    #[tokio::test]
    async fn new_rejects_a_postgis_install_below_the_minimum() {
        let node = Postgres::default()
            .with_name("postgis/postgis")
            .with_tag("11-3.0") // purposely very old and stable
            .start()
            .await
            .expect("container launched");

        let connection_string = format!(
            "postgres://postgres:postgres@{}:{}/postgres?sslmode=disable",
            node.get_host().await.unwrap(),
            node.get_host_port_ipv4(5432).await.unwrap(),
        );

        let config = PgConfig {
            connection_string,
            pool_size: Some(2),
            ssl_certificates: PgSslCerts::default(),
        };

        // 11-3.0 sits right at both gates (spec §4.5 covering index /
        // `CREATE STATISTICS` needs), so this should succeed rather than
        // trip PostgisTooOld/PostgresqlTooOld.
        let pool = PgPool::new(&config).await.expect("pool opens against a minimum-version image");
        assert_eq!(pool.postgis_version().major, 3);
        assert_eq!(pool.postgis_version().minor, 0);

        let conn = pool.get().await.expect("connection from the pool");
        let row = conn.query_one("SELECT 1 as one", &[]).await.expect("trivial query");
        let one: i32 = row.get("one");
        assert_eq!(one, 1);
    }
}
