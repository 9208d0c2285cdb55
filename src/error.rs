#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid YAML in settings.")]
    Settings(#[from] serde_yaml::Error),

    #[error("Unsupported database backend `{0}`; only postgis is supported at this time")]
    UnsupportedBackend(String),

    #[error("No database is configured under `{0}` and there is no default")]
    UnknownDatabase(String),

    #[error("Field `{field}` not found on `{model}`")]
    FieldNotFound { model: String, field: String },

    #[error("Field `{0}` is not a geometry field")]
    NotAGeometryField(String),

    #[error("Geometry field not found on `{0}`")]
    NoGeometryField(String),

    #[error("`{model}` has more than one geometry field ({fields}); name one explicitly")]
    AmbiguousGeometryField { model: String, fields: String },

    #[error("Query references parameter ${index} but only {bound} were bound")]
    MissingParameter { index: usize, bound: usize },

    #[error("Invalid WKB geometry: {0}")]
    InvalidWkb(String),

    #[error("Row {row} has no value for column `{column}`")]
    MissingColumn { row: u64, column: String },

    #[error("SRID {0} is not in the projection database")]
    UnknownSrid(i32),

    #[error("Unsupported projection: {0}")]
    UnsupportedProjection(String),

    #[error("Style `{0}` is not defined on the map")]
    UndefinedStyle(String),

    #[error("Invalid color `{0}`")]
    InvalidColor(String),

    #[error("Invalid option `{0}`")]
    InvalidOption(String),

    #[error("Overriding the default image viewer is not supported on Windows")]
    ViewerOverrideUnsupported,

    #[error("Opening images is not supported on `{0}`")]
    UnsupportedPlatform(String),

    #[error("Unable to launch `{program}`: {source}")]
    Viewer {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
