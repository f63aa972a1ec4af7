// SQLite persistence for the project catalog. Internal to the crate.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::Result;

#[derive(Clone)]
pub(crate) struct Store {
    pool: SqlitePool,
}

/// A row from the resource_revision table. The error and metadata columns
/// hold JSON documents; exactly one of them is the JSON value `null`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct RevisionRow {
    pub id: i64,
    pub resource_id: i64,
    pub request_cookie: Option<String>,
    pub error: String,
    pub metadata: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ResourceRow {
    pub id: i64,
    pub url: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct RootResourceRow {
    pub id: i64,
    pub name: String,
    pub resource_id: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ResourceGroupRow {
    pub id: i64,
    pub name: String,
    pub url_pattern: String,
    pub source_type: Option<String>,
    pub source_id: Option<i64>,
    pub do_not_download: bool,
}

impl Store {
    pub(crate) async fn open(db_path: &Path, create: bool, readonly: bool) -> Result<Store> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(create)
            .read_only(readonly)
            .foreign_keys(true);
        // A single connection: the catalog is single-writer and every
        // mutation runs under the project core lock anyway.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Store { pool })
    }

    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) async fn create_schema(&self) -> Result<()> {
        sqlx::raw_sql(
            r#"
            create table if not exists project_property (
                name text unique not null,
                value text
            );
            create table if not exists resource (
                id integer primary key autoincrement,
                url text unique not null
            );
            create table if not exists root_resource (
                id integer primary key,
                name text not null,
                resource_id integer unique not null,
                foreign key (resource_id) references resource(id)
            );
            create table if not exists resource_group (
                id integer primary key,
                name text not null,
                url_pattern text not null,
                source_type text,
                source_id integer,
                do_not_download integer not null default 0
            );
            create table if not exists resource_revision (
                id integer primary key autoincrement,
                resource_id integer not null,
                request_cookie text,
                error text not null,
                metadata text not null
            );
            create index if not exists resource_revision__resource_id
                on resource_revision (resource_id);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // === Properties ===

    pub(crate) async fn properties(&self) -> Result<Vec<(String, Option<String>)>> {
        let rows = sqlx::query_as::<_, (String, Option<String>)>(
            "select name, value from project_property",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub(crate) async fn set_property(&self, name: &str, value: Option<&str>) -> Result<()> {
        sqlx::query("insert or replace into project_property (name, value) values (?, ?)")
            .bind(name)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // === Resources ===

    pub(crate) async fn resources(&self) -> Result<Vec<ResourceRow>> {
        let rows = sqlx::query_as::<_, ResourceRow>("select id, url from resource order by id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub(crate) async fn insert_resource(&self, url: &str) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>("insert into resource (url) values (?) returning id")
            .bind(url)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    /// Insert many resources in one transaction. Substantially faster than
    /// N individual inserts when a parsed document yields hundreds of links.
    pub(crate) async fn insert_resources_bulk(&self, urls: &[String]) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(urls.len());
        for url in urls {
            let id = sqlx::query_scalar::<_, i64>(
                "insert into resource (url) values (?) returning id",
            )
            .bind(url)
            .fetch_one(&mut *tx)
            .await?;
            ids.push(id);
        }
        tx.commit().await?;
        Ok(ids)
    }

    pub(crate) async fn delete_resource(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("delete from resource_revision where resource_id=?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("delete from root_resource where resource_id=?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("delete from resource where id=?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // === Root resources ===

    pub(crate) async fn root_resources(&self) -> Result<Vec<RootResourceRow>> {
        let rows = sqlx::query_as::<_, RootResourceRow>(
            "select id, name, resource_id from root_resource order by id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub(crate) async fn insert_root_resource(&self, name: &str, resource_id: i64) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            "insert into root_resource (name, resource_id) values (?, ?) returning id",
        )
        .bind(name)
        .bind(resource_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub(crate) async fn update_root_resource_name(&self, id: i64, name: &str) -> Result<()> {
        sqlx::query("update root_resource set name=? where id=?")
            .bind(name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(crate) async fn delete_root_resource(&self, id: i64) -> Result<()> {
        sqlx::query("delete from root_resource where id=?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // === Resource groups ===

    pub(crate) async fn resource_groups(&self) -> Result<Vec<ResourceGroupRow>> {
        let rows = sqlx::query_as::<_, ResourceGroupRow>(
            r#"
            select id, name, url_pattern, source_type, source_id, do_not_download
            from resource_group order by id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub(crate) async fn insert_resource_group(
        &self,
        name: &str,
        url_pattern: &str,
        source_type: Option<&str>,
        source_id: Option<i64>,
        do_not_download: bool,
    ) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            insert into resource_group (name, url_pattern, source_type, source_id, do_not_download)
            values (?, ?, ?, ?, ?) returning id
            "#,
        )
        .bind(name)
        .bind(url_pattern)
        .bind(source_type)
        .bind(source_id)
        .bind(do_not_download)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub(crate) async fn update_group_source(
        &self,
        id: i64,
        source_type: Option<&str>,
        source_id: Option<i64>,
    ) -> Result<()> {
        sqlx::query("update resource_group set source_type=?, source_id=? where id=?")
            .bind(source_type)
            .bind(source_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(crate) async fn update_group_do_not_download(&self, id: i64, value: bool) -> Result<()> {
        sqlx::query("update resource_group set do_not_download=? where id=?")
            .bind(value)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(crate) async fn delete_resource_group(&self, id: i64) -> Result<()> {
        sqlx::query("delete from resource_group where id=?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // === Revisions ===

    pub(crate) async fn insert_revision(
        &self,
        resource_id: i64,
        request_cookie: Option<&str>,
        error_json: &str,
        metadata_json: &str,
    ) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            insert into resource_revision (resource_id, request_cookie, error, metadata)
            values (?, ?, ?, ?) returning id
            "#,
        )
        .bind(resource_id)
        .bind(request_cookie)
        .bind(error_json)
        .bind(metadata_json)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub(crate) async fn delete_revision(&self, id: i64) -> Result<()> {
        sqlx::query("delete from resource_revision where id=?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(crate) async fn revision(&self, id: i64) -> Result<Option<RevisionRow>> {
        let row = sqlx::query_as::<_, RevisionRow>(
            r#"
            select id, resource_id, request_cookie, error, metadata
            from resource_revision where id=?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub(crate) async fn revisions_for_resource(&self, resource_id: i64) -> Result<Vec<RevisionRow>> {
        let rows = sqlx::query_as::<_, RevisionRow>(
            r#"
            select id, resource_id, request_cookie, error, metadata
            from resource_revision where resource_id=? order by id
            "#,
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Most recent revision of a resource, the one served and parsed by default.
    pub(crate) async fn latest_revision(&self, resource_id: i64) -> Result<Option<RevisionRow>> {
        let row = sqlx::query_as::<_, RevisionRow>(
            r#"
            select id, resource_id, request_cookie, error, metadata
            from resource_revision where resource_id=? order by id desc limit 1
            "#,
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub(crate) async fn has_any_revisions(&self, resource_id: i64) -> Result<bool> {
        let row = sqlx::query_scalar::<_, i64>(
            "select 1 from resource_revision where resource_id=? limit 1",
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub(crate) async fn max_revision(&self) -> Result<Option<RevisionRow>> {
        let row = sqlx::query_as::<_, RevisionRow>(
            r#"
            select id, resource_id, request_cookie, error, metadata
            from resource_revision order by id desc limit 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Narrow repair path; revisions are otherwise immutable once written.
    pub(crate) async fn update_revision_metadata(
        &self,
        id: i64,
        metadata_json: &str,
    ) -> Result<()> {
        sqlx::query("update resource_revision set metadata=? where id=?")
            .bind(metadata_json)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
