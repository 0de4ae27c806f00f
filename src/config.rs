// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Board configuration: a TOML file selected on the command line, with
//! a few fields overridable directly from the CLI.

use std::fmt;
use std::fs;

use clap::Parser;
use serde::Deserialize;

use crate::error::{self, ErrorKind};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/axminer.toml";

/// Default timeout for counting chip replies during the bring-up probe
pub const PROBE_TIMEOUT_MS: u64 = 1000;

#[derive(Parser, Debug)]
#[command(name = "axminer", version, about = "BM13xx mining board control firmware")]
pub struct Cli {
    /// Config file path
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    /// Address of the stratum V1 server (HOSTNAME:PORT)
    #[arg(short, long, requires = "user")]
    pub pool: Option<String>,

    /// User and worker name (USERNAME.WORKERNAME)
    #[arg(short, long, requires = "pool")]
    pub user: Option<String>,

    /// Chip frequency in MHz
    #[arg(long)]
    pub frequency: Option<f64>,
}

/// The chip family populated on the board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChipModel {
    Bm1397,
    Bm1366,
    Bm1368,
    Bm1370,
}

impl fmt::Display for ChipModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ChipModel::Bm1397 => "BM1397",
            ChipModel::Bm1366 => "BM1366",
            ChipModel::Bm1368 => "BM1368",
            ChipModel::Bm1370 => "BM1370",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StratumConfig {
    /// Pool address as HOSTNAME:PORT
    pub url: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HashChainConfig {
    pub chip_model: ChipModel,
    #[serde(default = "default_chip_count")]
    pub chip_count: usize,
    /// Target frequency in MHz
    pub frequency: f64,
    /// Share threshold programmed into the chips' ticket mask
    #[serde(default = "default_asic_difficulty")]
    pub asic_difficulty: usize,
    pub serial_port: String,
    pub reset_gpio: u64,
}

fn default_chip_count() -> usize {
    1
}

fn default_asic_difficulty() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub stratum: StratumConfig,
    pub hash_chain: HashChainConfig,
}

impl Config {
    pub fn parse(raw: &str) -> error::Result<Self> {
        let config: Config = toml::from_str(raw)
            .map_err(|e| ErrorKind::Config(format!("malformed config: {}", e)))?;
        if config.hash_chain.chip_count == 0 || config.hash_chain.chip_count > 64 {
            Err(ErrorKind::Config(format!(
                "chip_count {} out of range 1..=64",
                config.hash_chain.chip_count
            )))?;
        }
        Ok(config)
    }

    pub fn load(path: &str) -> error::Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| ErrorKind::Config(format!("cannot read {}: {}", path, e)))?;
        Self::parse(&raw)
    }

    /// Fold command line overrides into the file-based configuration
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(pool) = &cli.pool {
            self.stratum.url = pool.clone();
        }
        if let Some(user) = &cli.user {
            self.stratum.user = user.clone();
        }
        if let Some(frequency) = cli.frequency {
            self.hash_chain.frequency = frequency;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = r#"
        [stratum]
        url = "stratum.example.com:3333"
        user = "worker.one"

        [hash_chain]
        chip_model = "bm1368"
        chip_count = 3
        frequency = 490.0
        serial_port = "/dev/ttyS1"
        reset_gpio = 907
    "#;

    #[test]
    fn test_sample_config() {
        let config = Config::parse(SAMPLE).expect("parse failed");
        assert_eq!(config.stratum.url, "stratum.example.com:3333");
        assert_eq!(config.stratum.password, "");
        assert_eq!(config.hash_chain.chip_model, ChipModel::Bm1368);
        assert_eq!(config.hash_chain.chip_count, 3);
        assert_eq!(config.hash_chain.asic_difficulty, 256);
    }

    #[test]
    fn test_unknown_chip_model() {
        let raw = SAMPLE.replace("bm1368", "bm1399");
        assert!(Config::parse(&raw).is_err());
    }

    #[test]
    fn test_chip_count_bounds() {
        let raw = SAMPLE.replace("chip_count = 3", "chip_count = 0");
        assert!(Config::parse(&raw).is_err());
        let raw = SAMPLE.replace("chip_count = 3", "chip_count = 65");
        assert!(Config::parse(&raw).is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = Config::parse(SAMPLE).unwrap();
        let cli = Cli {
            config: DEFAULT_CONFIG_PATH.to_string(),
            pool: Some("other.example.com:3333".to_string()),
            user: Some("worker.two".to_string()),
            frequency: Some(525.0),
        };
        config.apply_cli(&cli);
        assert_eq!(config.stratum.url, "other.example.com:3333");
        assert_eq!(config.stratum.user, "worker.two");
        assert_eq!(config.hash_chain.frequency, 525.0);
    }
}
