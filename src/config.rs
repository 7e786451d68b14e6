// Burrow - Reverse TCP tunnel relay exposing NAT-hidden services over a minimal framed protocol
// Copyright (C) 2021  rumblefrog

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(rename(deserialize = "General"), default)]
    pub general: General,
}

#[derive(Deserialize, Debug, Clone)]
pub struct General {
    /// Address the control listener and every session listener bind to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port the control endpoint accepts port requests on.
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// Inclusive lower bound of the public session port range.
    #[serde(default = "default_pool_low")]
    pub pool_low: u16,

    /// Inclusive upper bound of the public session port range.
    #[serde(default = "default_pool_high")]
    pub pool_high: u16,

    /// Seconds a session listener waits for its host tunnel to attach
    /// before the port is returned to the pool.
    #[serde(default = "default_host_attach_timeout")]
    pub host_attach_timeout: u32,

    /// Seconds between sweeps for sessions that exited without
    /// returning their port.
    #[serde(default = "default_health_interval")]
    pub health_interval: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: General::default(),
        }
    }
}

impl Default for General {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            control_port: default_control_port(),
            pool_low: default_pool_low(),
            pool_high: default_pool_high(),
            host_attach_timeout: default_host_attach_timeout(),
            health_interval: default_health_interval(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_control_port() -> u16 {
    9000
}

fn default_pool_low() -> u16 {
    9001
}

fn default_pool_high() -> u16 {
    9100
}

fn default_host_attach_timeout() -> u32 {
    300
}

fn default_health_interval() -> u32 {
    60
}
