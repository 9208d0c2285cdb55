//! Hosting application settings: where rendered graphics live and how to reach the
//! spatial database(s).
use crate::Error;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// The only database engine the PostGIS datasource can talk to.
pub const POSTGIS_ENGINE: &str = "postgis";

/// Alias used when a query is not bound to a specific database.
pub const DEFAULT_DATABASE: &str = "default";

#[derive(Clone, Deserialize, Debug)]
pub struct Settings {
    pub media_root: PathBuf,
    #[serde(default = "default_media_url")]
    pub media_url: String,
    #[serde(default)]
    pub databases: HashMap<String, DatabaseSettings>,
}

#[derive(Clone, Deserialize, Debug)]
pub struct DatabaseSettings {
    pub engine: String,
    pub name: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub host: String,
    pub port: Option<u16>,
}

/// Everything the renderer needs to open its own connection to PostGIS.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionParams {
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: Option<u16>,
}

fn default_media_url() -> String {
    String::from("/media/")
}

impl Settings {
    /// Constructs settings from a YAML string
    pub fn from(data: &str) -> Result<Settings, Error> {
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Settings, Error> {
        let data = fs::read_to_string(path)?;
        Settings::from(&data)
    }

    /// Looks up connection parameters for a database alias, falling back to the
    /// default database when the alias is absent or unknown.
    pub fn connection_params(&self, using: Option<&str>) -> Result<ConnectionParams, Error> {
        let db = using
            .and_then(|alias| self.databases.get(alias))
            .or_else(|| self.databases.get(DEFAULT_DATABASE))
            .ok_or_else(|| {
                Error::UnknownDatabase(using.unwrap_or(DEFAULT_DATABASE).to_string())
            })?;

        if db.engine != POSTGIS_ENGINE {
            return Err(Error::UnsupportedBackend(db.engine.clone()));
        }

        Ok(ConnectionParams {
            dbname: db.name.clone(),
            user: db.user.clone(),
            password: db.password.clone(),
            host: db.host.clone(),
            port: db.port,
        })
    }
}
