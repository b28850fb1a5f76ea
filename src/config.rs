//! Config file
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Root folder to place the torrents files
    pub download_dir: String,

    /// Lowest port the client will try to listen on for peer connections.
    pub listen_port_min: u16,

    /// Highest port the client will try to listen on for peer connections.
    pub listen_port_max: u16,

    /// Random per-process key reported to UDP trackers.
    pub key: u32,
}

pub static CONFIG: LazyLock<Config> = LazyLock::new(|| Config::get().unwrap());

impl Config {
    /// Try to load the configuration. Environmental variables have priviledge
    /// over values from the configuration file. If both are not set, it will
    /// try to guess the default values using $HOME.
    pub fn load() -> Result<Self, Error> {
        Self::get()
    }

    fn get() -> Result<Config, Error> {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());

        let download_dir = std::env::var("XDG_DOWNLOAD_DIR")
            .unwrap_or(format!("{home}/Downloads"));

        // config.toml, the .toml part is omitted.
        let config_file = std::env::var("XDG_CONFIG_HOME")
            .map(|v| format!("{v}/corrente/config"))
            .unwrap_or(format!("{home}/.config/corrente/config"));

        let key: u32 = rand::random();

        config::Config::builder()
            .add_source(config::File::with_name(&config_file).required(false))
            .add_source(config::Environment::default())
            .set_default("download_dir", download_dir)?
            .set_default("listen_port_min", 6881_i64)?
            .set_default("listen_port_max", 6889_i64)?
            .set_default("key", key as i64)?
            .build()?
            .try_deserialize::<Config>()
            .map_err(Error::Config)
    }
}
