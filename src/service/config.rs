// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

extern crate config as _;

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    /// Size of the scratch buffer used for each socket read.
    pub read_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 9090,
            max_connection: 1024,
            read_buffer_size: 4 * 1024,
        }
    }
}

/// Per-connection timeouts, all in seconds.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConnectionConfig {
    pub idle_timeout: u64,
    pub request_timeout: u64,
    pub shutdown_timeout: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            idle_timeout: 60,
            request_timeout: 30,
            shutdown_timeout: 5,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TaskConfig {
    pub channel_capacity: usize,
    pub num_workers: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        TaskConfig {
            channel_capacity: 1024,
            num_workers: num_cpus::get(),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub connection: ConnectionConfig,
    pub task: TaskConfig,
}

impl ServerConfig {
    /// Loads the TOML file at `path`, then applies `WIREHUB_`-prefixed
    /// environment overrides such as `WIREHUB_NETWORK__PORT=9000`.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix("WIREHUB")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;

        Ok(server_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let connection = &self.connection;
        if connection.idle_timeout == 0
            || connection.request_timeout == 0
            || connection.shutdown_timeout == 0
        {
            return Err(AppError::InvalidValue(
                "timeouts must be at least one second".to_string(),
            ));
        }
        if self.network.max_connection == 0 {
            return Err(AppError::InvalidValue(
                "max_connection must be positive".to_string(),
            ));
        }
        if self.task.num_workers == 0 || self.task.channel_capacity == 0 {
            return Err(AppError::InvalidValue(
                "task pool needs at least one worker and a non-empty queue".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_load_partial_config() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[network]
port = 7000

[connection]
idle_timeout = 15
"#
        )
        .unwrap();

        let config = ServerConfig::set_up_config(file.path()).unwrap();
        assert_eq!(config.network.port, 7000);
        assert_eq!(config.network.ip, "127.0.0.1");
        assert_eq!(config.connection.idle_timeout, 15);
        assert_eq!(config.connection.request_timeout, 30);
    }

    #[test]
    fn test_reject_zero_timeout() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[connection]\nidle_timeout = 0").unwrap();

        let result = ServerConfig::set_up_config(file.path());
        assert!(matches!(result, Err(AppError::InvalidValue(_))));
    }

    #[test]
    fn test_sample_config_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("conf.toml");
        let config = ServerConfig::set_up_config(path).unwrap();
        let defaults = ServerConfig::default();
        assert_eq!(config.network.port, defaults.network.port);
        assert_eq!(
            config.network.read_buffer_size,
            defaults.network.read_buffer_size
        );
        assert_eq!(
            config.connection.shutdown_timeout,
            defaults.connection.shutdown_timeout
        );
        assert_eq!(config.task.channel_capacity, defaults.task.channel_capacity);
        assert_eq!(config.task.num_workers, 4);
    }

    #[test]
    fn test_missing_file() {
        let result = ServerConfig::set_up_config("/nonexistent/wirehub.toml");
        assert!(matches!(result, Err(AppError::ConfigFileError(_))));
    }
}
