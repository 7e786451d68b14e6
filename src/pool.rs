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

use std::collections::BTreeSet;

use tokio::sync::Mutex;

/// Bounded pool of public session ports.
///
/// Allocates lowest-first. All mutation happens under a single lock.
pub struct PortPool {
    low: u16,
    high: u16,

    /// Ports currently held by a session.
    ///
    /// Invariant: allocated ∪ free == `[low..high]`, no duplicates.
    allocated: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    pub fn new(low: u16, high: u16) -> Self {
        Self {
            low,
            high,
            allocated: Mutex::new(BTreeSet::new()),
        }
    }

    /// Lowest free port in the range, or `None` when the pool is exhausted.
    pub async fn acquire(&self) -> Option<u16> {
        let mut allocated = self.allocated.lock().await;

        for port in self.low..=self.high {
            if !allocated.contains(&port) {
                allocated.insert(port);

                return Some(port);
            }
        }

        None
    }

    /// Return a port to the pool.
    ///
    /// Idempotent; releasing a port that is not held is a no-op. The
    /// return value reports whether the port was actually held, which
    /// lets the health sweeper tell a clean exit from a reclaim.
    pub async fn release(&self, port: u16) -> bool {
        self.allocated.lock().await.remove(&port)
    }

    /// Number of ports currently held.
    pub async fn in_use(&self) -> usize {
        self.allocated.lock().await.len()
    }

    pub fn capacity(&self) -> usize {
        (self.high as usize + 1).saturating_sub(self.low as usize)
    }
}
