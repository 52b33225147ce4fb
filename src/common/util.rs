// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::time::Duration;

const BYTE_UNITS: [&str; 6] = ["B", "kB", "MB", "GB", "TB", "PB"];

/// Render a byte count with the largest unit that keeps the value at or above one.
///
/// Values below 1kB are printed exactly, so `1200` renders as `1.17kB` and `1000` as `1000B`.
pub fn succinct_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{}B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < BYTE_UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2}{}", value, BYTE_UNITS[unit])
}

pub fn succinct_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos < 1_000 {
        format!("{}ns", nanos)
    } else if nanos < 1_000_000 {
        format!("{:.2}us", nanos as f64 / 1e3)
    } else if nanos < 1_000_000_000 {
        format!("{:.2}ms", nanos as f64 / 1e6)
    } else if nanos < 60_000_000_000 {
        format!("{:.2}s", nanos as f64 / 1e9)
    } else {
        format!("{:.2}m", nanos as f64 / 6e10)
    }
}

/// Apply a fraction to a byte count, clamping at zero and saturating at `u64::MAX`.
pub fn fraction_of(bytes: u64, fraction: f64) -> u64 {
    let value = bytes as f64 * fraction;
    if value <= 0.0 {
        0
    } else if value >= u64::MAX as f64 {
        u64::MAX
    } else {
        value as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succinct_bytes() {
        assert_eq!(succinct_bytes(0), "0B");
        assert_eq!(succinct_bytes(1000), "1000B");
        assert_eq!(succinct_bytes(1200), "1.17kB");
        assert_eq!(succinct_bytes(3 * 1024 * 1024 * 1024), "3.00GB");
    }

    #[test]
    fn test_fraction_of() {
        assert_eq!(fraction_of(1000, 0.9), 900);
        assert_eq!(fraction_of(1000, -1.0), 0);
        assert_eq!(fraction_of(u64::MAX, 2.0), u64::MAX);
    }

    #[test]
    fn test_succinct_duration() {
        assert_eq!(succinct_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(succinct_duration(Duration::from_nanos(10)), "10ns");
    }
}
