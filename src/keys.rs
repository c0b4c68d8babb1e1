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

/// Slot key of a lock: `<prefix>:<slot>:<name>`.
///
/// The slot field never contains the separator and the name is the
/// unparsed tail, so the mapping is injective in `(name, slot)`.
pub fn keyname(prefix: &str, name: &str, slot: u32) -> String {
    format!("{prefix}:{slot}:{name}")
}

/// Inverse of [`keyname`]: split a slot key back into `(name, slot)`.
///
/// Returns `None` for keys that do not carry the expected prefix or shape.
pub fn parse_key<'a>(prefix: &str, key: &'a str) -> Option<(&'a str, u32)> {
    let rest = key.strip_prefix(prefix)?.strip_prefix(':')?;
    let (slot, name) = rest.split_once(':')?;
    Some((name, slot.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plain_names() {
        let key = keyname("quorumlock", "orders", 2);
        assert_eq!(key, "quorumlock:2:orders");
        assert_eq!(parse_key("quorumlock", &key), Some(("orders", 2)));
    }

    #[test]
    fn name_may_contain_separator() {
        let key = keyname("quorumlock", "tenant:42:refresh", 0);
        assert_eq!(parse_key("quorumlock", &key), Some(("tenant:42:refresh", 0)));
    }

    #[test]
    fn distinct_locks_never_collide() {
        let a = keyname("lk", "a:1", 0);
        let b = keyname("lk", "1", 0);
        let c = keyname("lk", "a", 1);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn rejects_foreign_keys() {
        assert_eq!(parse_key("quorumlock", "other:0:name"), None);
        assert_eq!(parse_key("quorumlock", "quorumlock"), None);
        assert_eq!(parse_key("quorumlock", "quorumlock:x:name"), None);
        assert_eq!(parse_key("quorumlock", "quorumlock:7"), None);
    }
}
