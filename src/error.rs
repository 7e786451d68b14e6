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

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BurrowError {
    #[error("IO error {0}")]
    IoError(#[from] std::io::Error),

    #[error("Frame length {0} exceeds maximum")]
    OversizedFrame(usize),

    #[error("Malformed control reply")]
    MalformedReply,

    #[error("Expected <relay_ip> <control_port> <local_port>")]
    BadArgs,

    #[error("Relay refused request: {0}")]
    Refused(String),

    #[error("Invalid net address {0}")]
    InvalidAddress(#[from] std::net::AddrParseError),

    #[error("Unable to parse int {0}")]
    InvalidInt(#[from] std::num::ParseIntError),
}

pub type BurrowResult<T> = std::result::Result<T, BurrowError>;
