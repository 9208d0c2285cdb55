//! PostGIS access through sqlx: a query set backed by hand-written SQL, and the
//! queries the renderer runs against live subquery datasources.
use crate::config::ConnectionParams;
use crate::datasource::PostGisDatasource;
use crate::geometry::{decode_wkb, to_ewkb, Envelope};
use crate::query::{CompiledQuery, FieldType, ModelMeta, QuerySet, Row, SqlParam, Value};
use crate::sql::{quote_ident, rewrite_placeholders, table_from_sql};
use crate::Error;

use async_trait::async_trait;

use futures::TryStreamExt;
use geo_types::Geometry;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row as _};
use tracing::debug;

/// Alias the query set's SQL is wrapped under when fetching rows.
const ROWS_ALIAS: &str = "q";

/// Opens a single-connection pool for a datasource.
pub async fn connect(params: &ConnectionParams) -> Result<PgPool, Error> {
    let mut options = PgConnectOptions::new().database(&params.dbname);
    if !params.host.is_empty() {
        options = options.host(&params.host);
    }
    if let Some(port) = params.port {
        options = options.port(port);
    }
    if !params.user.is_empty() {
        options = options.username(&params.user);
    }
    if !params.password.is_empty() {
        options = options.password(&params.password);
    }

    Ok(PgPoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?)
}

/// A query set over SQL written by the caller.
///
/// The SQL must select a column for every field of `meta`, under the field's name.
/// Geometry parameters are bound as EWKB and converted server side.
#[derive(Clone, Debug)]
pub struct PgQuerySet {
    pool: PgPool,
    meta: ModelMeta,
    query: CompiledQuery,
    using: Option<String>,
}

impl PgQuerySet {
    pub fn new(pool: PgPool, meta: ModelMeta, query: CompiledQuery) -> PgQuerySet {
        PgQuerySet {
            pool,
            meta,
            query,
            using: None,
        }
    }

    /// Every row of the model's table.
    pub fn all(pool: PgPool, meta: ModelMeta) -> PgQuerySet {
        let query = CompiledQuery::new(meta.select_all());
        PgQuerySet::new(pool, meta, query)
    }

    pub fn with_database<S: Into<String>>(mut self, alias: S) -> PgQuerySet {
        self.using = Some(alias.into());
        self
    }

    /// Wraps the query so every column comes back in a type rows can hold.
    fn rows_sql(&self) -> Result<String, Error> {
        let columns: Vec<String> = self
            .meta
            .fields
            .iter()
            .map(|f| {
                let column = format!("{}.{}", ROWS_ALIAS, quote_ident(&f.name));
                match f.field_type {
                    FieldType::Bool => format!("{}::boolean", column),
                    FieldType::Int => format!("{}::bigint", column),
                    FieldType::Float => format!("{}::double precision", column),
                    FieldType::Text => format!("{}::text", column),
                    FieldType::Geometry { .. } => format!("ST_AsBinary({})", column),
                }
            })
            .collect();

        let bound = self.query.params.len();
        let inner = rewrite_placeholders(&self.query.sql, |index| {
            match index.checked_sub(1).and_then(|i| self.query.params.get(i)) {
                Some(SqlParam::Geometry { .. }) => Ok(format!("ST_GeomFromEWKB(${})", index)),
                // Inlined untyped so it compares against any column type
                Some(SqlParam::Scalar(Value::Null)) => Ok(String::from("NULL")),
                Some(SqlParam::Scalar(_)) => Ok(format!("${}", index)),
                None => Err(Error::MissingParameter { index, bound }),
            }
        })?;

        Ok(format!(
            "SELECT {} FROM ({}) AS {}",
            columns.join(", "),
            inner,
            ROWS_ALIAS
        ))
    }

    fn decode_row(&self, row: &PgRow) -> Result<Row, Error> {
        let mut values = Vec::with_capacity(self.meta.fields.len());
        for (i, field) in self.meta.fields.iter().enumerate() {
            let value = match field.field_type {
                FieldType::Bool => Value::from(row.try_get::<Option<bool>, _>(i)?),
                FieldType::Int => Value::from(row.try_get::<Option<i64>, _>(i)?),
                FieldType::Float => Value::from(row.try_get::<Option<f64>, _>(i)?),
                FieldType::Text => Value::from(row.try_get::<Option<String>, _>(i)?),
                FieldType::Geometry { .. } => Value::from(row.try_get::<Option<Vec<u8>>, _>(i)?),
            };
            values.push(value);
        }
        Ok(Row(values))
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.clone()),
        Value::Bytes(b) => query.bind(b.clone()),
    }
}

#[async_trait]
impl QuerySet for PgQuerySet {
    fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    fn using(&self) -> Option<&str> {
        self.using.as_deref()
    }

    fn compile(&self) -> Result<CompiledQuery, Error> {
        Ok(self.query.clone())
    }

    async fn fetch_rows(&self) -> Result<Vec<Row>, Error> {
        let sql = self.rows_sql()?;
        debug!(sql = %sql, "Fetching rows");

        let mut query = sqlx::query(&sql);
        for param in &self.query.params {
            query = match param {
                SqlParam::Scalar(value) => bind_value(query, value),
                SqlParam::Geometry { wkb, srid } => query.bind(to_ewkb(wkb, *srid)?),
            };
        }

        let mut rows = Vec::new();
        let mut stream = query.fetch(&self.pool);
        while let Some(row) = stream.try_next().await? {
            rows.push(self.decode_row(&row)?);
        }

        Ok(rows)
    }
}

/// SQL computing a datasource's extent, over the subquery or its base table.
pub fn extent_sql(ds: &PostGisDatasource) -> String {
    let source = if ds.extent_from_subquery {
        ds.table.clone()
    } else {
        table_from_sql(&ds.table)
    };

    format!(
        "SELECT ST_XMin(ext), ST_YMin(ext), ST_XMax(ext), ST_YMax(ext) \
         FROM (SELECT ST_Extent({}) AS ext FROM {}) AS extent",
        quote_ident(&ds.geometry_field),
        source
    )
}

/// SQL fetching a datasource's geometries, optionally limited to a box.
pub fn geometries_sql(ds: &PostGisDatasource, bbox: Option<&Envelope>) -> String {
    let geom = quote_ident(&ds.geometry_field);
    let mut sql = format!("SELECT ST_AsBinary({}) FROM {}", geom, ds.table);
    if let Some(b) = bbox {
        sql.push_str(&format!(
            " WHERE {} && ST_MakeEnvelope({}, {}, {}, {}, {})",
            geom, b.min_x, b.min_y, b.max_x, b.max_y, ds.srid
        ));
    }
    sql
}

pub async fn fetch_extent(pool: &PgPool, ds: &PostGisDatasource) -> Result<Option<Envelope>, Error> {
    let sql = extent_sql(ds);
    debug!(sql = %sql, "Fetching extent");

    let row = sqlx::query(&sql).fetch_one(pool).await?;
    let bounds = (
        row.try_get::<Option<f64>, _>(0)?,
        row.try_get::<Option<f64>, _>(1)?,
        row.try_get::<Option<f64>, _>(2)?,
        row.try_get::<Option<f64>, _>(3)?,
    );

    Ok(match bounds {
        (Some(min_x), Some(min_y), Some(max_x), Some(max_y)) => {
            Some(Envelope::new(min_x, min_y, max_x, max_y))
        }
        _ => None,
    })
}

/// Fetches and decodes geometries, skipping NULLs.
pub async fn fetch_geometries(
    pool: &PgPool,
    ds: &PostGisDatasource,
    bbox: Option<&Envelope>,
) -> Result<Vec<Geometry<f64>>, Error> {
    let sql = geometries_sql(ds, bbox);
    debug!(sql = %sql, "Fetching geometries");

    let mut geometries = Vec::new();
    let mut stream = sqlx::query(&sql).fetch(pool);
    while let Some(row) = stream.try_next().await? {
        if let Some(wkb) = row.try_get::<Option<Vec<u8>>, _>(0)? {
            geometries.push(decode_wkb(&wkb)?);
        }
    }

    Ok(geometries)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::geometry::GeometryKind;
    use crate::query::Field;

    fn datasource(table: &str, extent_from_subquery: bool) -> PostGisDatasource {
        PostGisDatasource {
            table: table.to_string(),
            geometry_field: String::from("mpoly"),
            srid: 4326,
            extent_from_subquery,
            persist_connection: false,
            connection: ConnectionParams {
                dbname: String::from("world"),
                user: String::new(),
                password: String::new(),
                host: String::new(),
                port: None,
            },
        }
    }

    #[test]
    fn test_extent_sql_uses_base_table_for_plain_selects() {
        let ds = datasource(
            "(SELECT \"world\".\"mpoly\" FROM \"world\") as geoquery_table",
            false,
        );

        assert_eq!(
            "SELECT ST_XMin(ext), ST_YMin(ext), ST_XMax(ext), ST_YMax(ext) \
             FROM (SELECT ST_Extent(\"mpoly\") AS ext FROM \"world\") AS extent",
            extent_sql(&ds)
        );
    }

    #[test]
    fn test_extent_sql_uses_subquery_when_filtered() {
        let table = "(SELECT \"world\".\"mpoly\" FROM \"world\" WHERE \"pop\" > 5) as geoquery_table";
        let ds = datasource(table, true);

        assert!(extent_sql(&ds).contains(&format!("AS ext FROM {}) AS extent", table)));
    }

    #[test]
    fn test_geometries_sql() {
        let ds = datasource("(SELECT 1) as geoquery_table", false);

        assert_eq!(
            "SELECT ST_AsBinary(\"mpoly\") FROM (SELECT 1) as geoquery_table",
            geometries_sql(&ds, None)
        );
        assert_eq!(
            "SELECT ST_AsBinary(\"mpoly\") FROM (SELECT 1) as geoquery_table \
             WHERE \"mpoly\" && ST_MakeEnvelope(-10.5, -5, 10, 5.25, 4326)",
            geometries_sql(&ds, Some(&Envelope::new(-10.5, -5.0, 10.0, 5.25)))
        );
    }

    #[tokio::test]
    async fn test_rows_sql_inlines_null_params() {
        let meta = ModelMeta {
            name: String::from("city"),
            table: String::from("geo_city"),
            fields: vec![
                Field::new("pop", FieldType::Int),
                Field::geometry("point", GeometryKind::Point, 4326),
            ],
        };
        let query = CompiledQuery::new(
            "SELECT \"pop\", \"point\" FROM \"geo_city\" \
             WHERE \"pop\" IS DISTINCT FROM $1 AND \"pop\" > $2",
        )
        .bind(Value::Null)
        .bind(10);
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/world")
            .unwrap();
        let qs = PgQuerySet::new(pool, meta, query);

        assert_eq!(
            "SELECT q.\"pop\"::bigint, ST_AsBinary(q.\"point\") \
             FROM (SELECT \"pop\", \"point\" FROM \"geo_city\" \
             WHERE \"pop\" IS DISTINCT FROM NULL AND \"pop\" > $2) AS q",
            qs.rows_sql().unwrap()
        );
    }

    #[tokio::test]
    async fn test_rows_sql_casts_columns_and_wraps_geometry_params() {
        let meta = ModelMeta {
            name: String::from("worldborder"),
            table: String::from("world_worldborder"),
            fields: vec![
                Field::new("name", FieldType::Text),
                Field::new("pop", FieldType::Int),
                Field::geometry("mpoly", GeometryKind::MultiPolygon, 4326),
            ],
        };
        let query = CompiledQuery::new(
            "SELECT \"name\", \"pop\", \"mpoly\" FROM \"world_worldborder\" \
             WHERE \"pop\" > $1 AND ST_Intersects(\"mpoly\", $2)",
        )
        .bind(5)
        .bind_geometry(vec![1, 1, 0, 0, 0], 4326);
        // connect_lazy never touches the network
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/world")
            .unwrap();
        let qs = PgQuerySet::new(pool, meta, query);

        assert_eq!(
            "SELECT q.\"name\"::text, q.\"pop\"::bigint, ST_AsBinary(q.\"mpoly\") \
             FROM (SELECT \"name\", \"pop\", \"mpoly\" FROM \"world_worldborder\" \
             WHERE \"pop\" > $1 AND ST_Intersects(\"mpoly\", ST_GeomFromEWKB($2))) AS q",
            qs.rows_sql().unwrap()
        );
    }
}
