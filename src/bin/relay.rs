// Burrow - Reverse TCP tunnel relay exposing NAT-hidden services over a minimal framed protocol
// Copyright (C) 2021  rumblefrog
//
// This program is free software: you can redistribute it and/or modify
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

use std::env::var;

use burrow::config::Config;
use burrow::relay::Relay;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config_loc = var("BURROW_CONFIG").unwrap_or("burrow.toml".into());

    // Every key has a default, so a missing file is not an error.
    let config: Config = match std::fs::read(&config_loc) {
        Ok(raw) => toml::from_slice(&raw)?,
        Err(_) => Config::default(),
    };

    let mut relay = Relay::new(config.general).await?;

    relay.up().await?;

    Ok(())
}
