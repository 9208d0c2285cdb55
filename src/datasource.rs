//! Renderer datasources built from query sets.
//!
//! A [`PostGisDatasource`] is a live subquery the renderer runs itself, so filtering
//! stays in the database. A [`MemoryDatasource`] pulls every row into this process
//! up front and is only suitable for small result sets.
use crate::config::ConnectionParams;
use crate::geometry::{decode_wkb, Envelope};
use crate::query::{GeometryField, QuerySet, Value};
use crate::sql::{as_subquery, needs_subquery_extent};
use crate::Error;

use std::collections::HashMap;
use std::sync::Arc;

use geo_types::Geometry;
use tracing::debug;

#[derive(Clone, Debug)]
pub enum Datasource {
    PostGis(PostGisDatasource),
    Memory(MemoryDatasource),
}

#[derive(Clone, Debug, PartialEq)]
pub struct PostGisDatasource {
    /// `(<sql>) as <alias>`, used wherever the renderer expects a table.
    pub table: String,
    pub geometry_field: String,
    pub srid: i32,
    /// Compute the extent over the subquery instead of trusting the table estimate.
    pub extent_from_subquery: bool,
    pub persist_connection: bool,
    pub connection: ConnectionParams,
}

impl PostGisDatasource {
    pub fn from_query(
        qs: &dyn QuerySet,
        geometry_field: &GeometryField,
        connection: ConnectionParams,
        persist_connection: bool,
    ) -> Result<PostGisDatasource, Error> {
        let compiled = qs.compile()?;
        let table = as_subquery(&compiled)?;
        let extent_from_subquery = needs_subquery_extent(&table);
        debug!(
            subquery = %table,
            extent_from_subquery,
            "Built PostGIS datasource"
        );

        Ok(PostGisDatasource {
            table,
            geometry_field: geometry_field.name.clone(),
            srid: geometry_field.srid,
            extent_from_subquery,
            persist_connection,
            connection,
        })
    }
}

/// Ordered attribute names shared by every feature of one datasource.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Context {
    names: Vec<String>,
}

impl Context {
    /// Appends a name and returns its slot.
    pub fn push<S: Into<String>>(&mut self, name: S) -> usize {
        self.names.push(name.into());
        self.names.len() - 1
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn slot(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Feature {
    id: u64,
    geometry: Geometry<f64>,
    context: Arc<Context>,
    values: Vec<Value>,
}

impl Feature {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn geometry(&self) -> &Geometry<f64> {
        &self.geometry
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.context.slot(name).and_then(|i| self.values.get(i))
    }

    /// Attribute name to value, for every context slot.
    pub fn attributes(&self) -> HashMap<&str, &Value> {
        self.context
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemoryDatasource {
    context: Arc<Context>,
    features: Vec<Feature>,
}

impl MemoryDatasource {
    /// Pulls every row of the query set into features, in iteration order.
    pub async fn from_query(
        qs: &dyn QuerySet,
        geometry_field: &GeometryField,
    ) -> Result<MemoryDatasource, Error> {
        let meta = qs.meta();
        let geometry_index =
            meta.index_of(&geometry_field.name)
                .ok_or_else(|| Error::FieldNotFound {
                    model: meta.name.clone(),
                    field: geometry_field.name.clone(),
                })?;

        // Column positions are resolved once here rather than per row
        let mut context = Context::default();
        let columns: Vec<(usize, &str)> = meta
            .field_names()
            .enumerate()
            .filter(|(i, _)| *i != geometry_index)
            .collect();
        for (_, name) in &columns {
            context.push(*name);
        }
        let context = Arc::new(context);

        let rows = qs.fetch_rows().await?;
        let mut features = Vec::with_capacity(rows.len());
        for (id, row) in (0u64..).zip(rows.iter()) {
            let missing = |column: &str| Error::MissingColumn {
                row: id,
                column: column.to_string(),
            };

            let geometry = match row.get(geometry_index) {
                Some(Value::Bytes(wkb)) => decode_wkb(wkb)?,
                Some(other) => {
                    return Err(Error::InvalidWkb(format!(
                        "row {} has {} in `{}`",
                        id, other, geometry_field.name
                    )))
                }
                None => return Err(missing(&geometry_field.name)),
            };

            let values = columns
                .iter()
                .map(|&(i, name)| row.get(i).cloned().ok_or_else(|| missing(name)))
                .collect::<Result<Vec<_>, _>>()?;

            features.push(Feature {
                id,
                geometry,
                context: context.clone(),
                values,
            });
        }
        debug!(features = features.len(), "Built memory datasource");

        Ok(MemoryDatasource { context, features })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn envelope(&self) -> Option<Envelope> {
        Envelope::of_all(self.features.iter().map(Feature::geometry))
    }
}
