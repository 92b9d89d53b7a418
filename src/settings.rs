/*
 * Copyright (C) 2024-2025 the seqwire authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::channel::OverflowPolicy;
use crate::server;
use crate::session::SessionConfig;
use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;
use std::error::Error;
use std::time::Duration;

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub listen: String,
    pub conns_max: usize,
    pub handler_threads: usize,
    pub pipeline_depth: usize,
    pub body_max: usize,
    pub log_level: String,

    pub max_frame_size: usize,

    // 0 disables keep-alive
    pub ping_interval_secs: u64,
    pub timeout_secs: u64,

    pub incoming_capacity: usize,
    pub outgoing_capacity: usize,

    // "suspend" or "close"
    pub overflow_policy: String,

    pub allow_compression: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: String::from("0.0.0.0:8080"),
            conns_max: 1024,
            handler_threads: 8,
            pipeline_depth: 16,
            body_max: 1_048_576,
            log_level: String::from("info"),
            max_frame_size: 131_072,
            ping_interval_secs: 30,
            timeout_secs: 60,
            incoming_capacity: 16,
            outgoing_capacity: 16,
            overflow_policy: String::from("suspend"),
            allow_compression: true,
        }
    }
}

impl Settings {
    pub fn load_file(path: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::new(path, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    fn overflow_policy(&self) -> Result<OverflowPolicy, Box<dyn Error>> {
        match self.overflow_policy.as_str() {
            "suspend" => Ok(OverflowPolicy::Suspend),
            "close" => Ok(OverflowPolicy::Close),
            other => Err(format!("unknown overflow policy: {}", other).into()),
        }
    }

    pub fn to_server_config(&self) -> Result<server::Config, Box<dyn Error>> {
        let listen = self.listen.parse()?;

        let policy = self.overflow_policy()?;

        let ping_interval = if self.ping_interval_secs > 0 {
            Some(Duration::from_secs(self.ping_interval_secs))
        } else {
            None
        };

        let session = SessionConfig {
            max_frame_size: self.max_frame_size,
            ping_interval,
            timeout: Duration::from_secs(self.timeout_secs),
            incoming_capacity: self.incoming_capacity,
            incoming_policy: policy,
            outgoing_capacity: self.outgoing_capacity,
            outgoing_policy: policy,
            ..Default::default()
        };

        Ok(server::Config {
            listen,
            conns_max: self.conns_max,
            handler_threads: self.handler_threads,
            pipeline_depth: self.pipeline_depth,
            body_max: self.body_max,
            session,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::from_toml("").unwrap();

        assert_eq!(settings, Settings::default());

        let config = settings.to_server_config().unwrap();

        assert_eq!(config.conns_max, 1024);
        assert_eq!(
            config.session.ping_interval,
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_toml(
            "listen = \"127.0.0.1:9000\"\n\
             handler_threads = 2\n\
             ping_interval_secs = 0\n\
             overflow_policy = \"close\"\n",
        )
        .unwrap();

        let config = settings.to_server_config().unwrap();

        assert_eq!(config.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.handler_threads, 2);
        assert_eq!(config.session.ping_interval, None);
        assert_eq!(config.session.incoming_policy, OverflowPolicy::Close);
    }

    #[test]
    fn test_bad_policy() {
        let settings = Settings::from_toml("overflow_policy = \"bogus\"\n").unwrap();

        assert!(settings.to_server_config().is_err());
    }
}
