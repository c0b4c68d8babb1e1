/*
 *
 *  *
 *  *      Copyright (c) 2018-2025, SnackCloud All rights reserved.
 *  *
 *  *   Redistribution and use in source and binary forms, with or without
 *  *   modification, are permitted provided that the following conditions are met:
 *  *
 *  *   Redistributions of source code must retain the above copyright notice,
 *  *   this list of conditions and the following disclaimer.
 *  *   Redistributions in binary form must reproduce the above copyright
 *  *   notice, this list of conditions and the following disclaimer in the
 *  *   documentation and/or other materials provided with the distribution.
 *  *   Neither the name of the www.snackcloud.cn developer nor the names of its
 *  *   contributors may be used to endorse or promote products derived from
 *  *   this software without specific prior written permission.
 *  *   Author: SnackCloud
 *  *
 *
 */
use std::time::Duration;
use uuid::Uuid;

/// Fresh per-acquisition token, written as the slot key's value and
/// required for safe release and extension.
pub fn lock_token() -> String {
    Uuid::new_v4().to_string()
}

pub fn num_milliseconds(duration: &Duration) -> u64 {
    duration.as_millis() as u64
}

/// Safety margin shaved off the validity window to compensate clock drift.
pub fn calculate_drift(validity: Duration, drift_factor: f64) -> Duration {
    let drift_ms = (validity.as_millis() as f64 * drift_factor).ceil() as u64;
    Duration::from_millis(drift_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique() {
        assert_ne!(lock_token(), lock_token());
    }

    #[test]
    fn drift_rounds_up() {
        assert_eq!(
            calculate_drift(Duration::from_secs(5), 0.01),
            Duration::from_millis(50)
        );
        assert_eq!(
            calculate_drift(Duration::from_millis(150), 0.01),
            Duration::from_millis(2)
        );
    }

    #[test]
    fn millis_truncate() {
        assert_eq!(num_milliseconds(&Duration::from_micros(2500)), 2);
    }
}
