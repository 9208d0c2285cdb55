//! The query layer the adapters read from.
//!
//! A [`QuerySet`] is anything that can hand over its compiled SQL, iterate its rows
//! and describe the model those rows belong to. Adapters never mutate it.
use crate::geometry::GeometryKind;
use crate::sql::quote_ident;
use crate::Error;

use std::fmt;

use async_trait::async_trait;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    Int,
    Float,
    Text,
    Geometry { kind: GeometryKind, srid: i32 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

impl Field {
    pub fn new<S: Into<String>>(name: S, field_type: FieldType) -> Field {
        Field {
            name: name.into(),
            field_type,
        }
    }

    pub fn geometry<S: Into<String>>(name: S, kind: GeometryKind, srid: i32) -> Field {
        Field::new(name, FieldType::Geometry { kind, srid })
    }

    pub fn is_geometry(&self) -> bool {
        matches!(self.field_type, FieldType::Geometry { .. })
    }
}

/// Schema of the model a query set returns, in declaration order.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelMeta {
    /// Short model name, used when naming rendered graphics.
    pub name: String,
    pub table: String,
    pub fields: Vec<Field>,
}

impl ModelMeta {
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn geometry_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.is_geometry())
    }

    /// `SELECT "table"."field", ... FROM "table"`
    pub fn select_all(&self) -> String {
        let table = quote_ident(&self.table);
        let columns: Vec<String> = self
            .fields
            .iter()
            .map(|f| format!("{}.{}", table, quote_ident(&f.name)))
            .collect();
        format!("SELECT {} FROM {}", columns.join(", "), table)
    }
}

/// The resolved spatial column of a query set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeometryField {
    pub name: String,
    pub kind: GeometryKind,
    pub srid: i32,
}

/// How to pick the geometry column an adapter renders.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum GeometryFieldSelector {
    /// Use the model's only geometry field.
    #[default]
    Infer,
    Explicit(String),
}

impl GeometryFieldSelector {
    pub fn resolve(&self, meta: &ModelMeta) -> Result<GeometryField, Error> {
        let field = match self {
            GeometryFieldSelector::Explicit(name) => {
                meta.field(name).ok_or_else(|| Error::FieldNotFound {
                    model: meta.name.clone(),
                    field: name.clone(),
                })?
            }
            GeometryFieldSelector::Infer => {
                let candidates: Vec<&Field> = meta.geometry_fields().collect();
                match candidates.as_slice() {
                    [] => return Err(Error::NoGeometryField(meta.name.clone())),
                    [only] => *only,
                    many => {
                        let fields: Vec<&str> = many.iter().map(|f| f.name.as_str()).collect();
                        return Err(Error::AmbiguousGeometryField {
                            model: meta.name.clone(),
                            fields: fields.join(", "),
                        });
                    }
                }
            }
        };

        match field.field_type {
            FieldType::Geometry { kind, srid } => Ok(GeometryField {
                name: field.name.clone(),
                kind,
                srid,
            }),
            _ => Err(Error::NotAGeometryField(field.name.clone())),
        }
    }
}

/// A bound query parameter. Geometry parameters are tagged by the query layer so
/// they can be inlined as geometries rather than quoted as strings.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlParam {
    Scalar(Value),
    Geometry { wkb: Vec<u8>, srid: i32 },
}

/// SQL with `$n` placeholders plus the values bound to them.
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl CompiledQuery {
    pub fn new<S: Into<String>>(sql: S) -> CompiledQuery {
        CompiledQuery {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind<V: Into<Value>>(mut self, value: V) -> CompiledQuery {
        self.params.push(SqlParam::Scalar(value.into()));
        self
    }

    pub fn bind_geometry(mut self, wkb: Vec<u8>, srid: i32) -> CompiledQuery {
        self.params.push(SqlParam::Geometry { wkb, srid });
        self
    }
}

/// One row, positionally aligned with [`ModelMeta::fields`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row(pub Vec<Value>);

impl Row {
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }
}

impl<V: Into<Value>> FromIterator<V> for Row {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Row(iter.into_iter().map(Into::into).collect())
    }
}

/// A filterable, iterable collection of rows from a spatial database.
#[async_trait]
pub trait QuerySet: Send + Sync {
    fn meta(&self) -> &ModelMeta;

    /// Alias of the database the query runs against; `None` means the default.
    fn using(&self) -> Option<&str> {
        None
    }

    fn compile(&self) -> Result<CompiledQuery, Error>;

    /// Every row, in the query's natural order.
    async fn fetch_rows(&self) -> Result<Vec<Row>, Error>;
}

/// A query set whose rows are already in memory.
#[derive(Clone, Debug)]
pub struct MemoryQuerySet {
    meta: ModelMeta,
    rows: Vec<Row>,
    query: Option<CompiledQuery>,
    using: Option<String>,
}

impl MemoryQuerySet {
    pub fn new(meta: ModelMeta, rows: Vec<Row>) -> MemoryQuerySet {
        MemoryQuerySet {
            meta,
            rows,
            query: None,
            using: None,
        }
    }

    /// Overrides the SQL reported by [`QuerySet::compile`].
    pub fn with_query(mut self, query: CompiledQuery) -> MemoryQuerySet {
        self.query = Some(query);
        self
    }

    pub fn with_database<S: Into<String>>(mut self, alias: S) -> MemoryQuerySet {
        self.using = Some(alias.into());
        self
    }
}

#[async_trait]
impl QuerySet for MemoryQuerySet {
    fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    fn using(&self) -> Option<&str> {
        self.using.as_deref()
    }

    fn compile(&self) -> Result<CompiledQuery, Error> {
        Ok(self
            .query
            .clone()
            .unwrap_or_else(|| CompiledQuery::new(self.meta.select_all())))
    }

    async fn fetch_rows(&self) -> Result<Vec<Row>, Error> {
        Ok(self.rows.clone())
    }
}
