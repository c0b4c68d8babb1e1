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

use redis::RedisError;
use thiserror::Error;

pub type LockerResult<T> = std::result::Result<T, LockerError>;

#[derive(Error, Debug)]
pub enum LockerError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("No redis servers provided")]
    NoServer,

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The single-shot acquisition did not obtain a slot majority.
    #[error("Lock majority was not obtained")]
    NotLocked,

    /// The locker was closed, either before or during the operation.
    #[error("Locker is closed")]
    LockerClosed,

    /// The caller's cancel token fired while the operation was pending.
    #[error("Operation canceled by caller")]
    Canceled,
}

impl LockerError {
    pub fn is_not_locked(&self) -> bool {
        matches!(self, LockerError::NotLocked)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, LockerError::LockerClosed)
    }
}
