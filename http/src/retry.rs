// RestKit
// Copyright 2023 Julio Merino
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.

//! Round-tripper that retries requests that fail transiently.

use crate::transport::{RoundTripper, TransportRequest, TransportResponse, TransportResult};
use async_trait::async_trait;
use http::StatusCode;
use log::{debug, warn};
use rand::Rng;
use restkit_core::clocks::{Clock, SystemClock, sleep_or_cancel};
use restkit_core::context::{Context, ContextResult};
use restkit_core::env::get_optional_var;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Response codes that are retried by default.
pub const TRANSIENT_STATUSES: &[StatusCode] = &[
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
    StatusCode::INSUFFICIENT_STORAGE,
];

/// Decides whether a failed request deserves another attempt.
#[async_trait]
pub trait RetryStrategy: Send + Sync {
    /// Returns whether to try again after `failures` failed attempts.
    ///
    /// Waits as necessary before returning true.  Fails if `ctx` is done before the wait is over.
    async fn should_try(&self, ctx: &Context, failures: usize) -> ContextResult<bool>;
}

/// Returns true if the retry that follows `failures` failures fits within `max_retries` and within
/// `timeout`, given that the `n`-th retry waits for `delay(n)`.
fn within_budget<F: Fn(usize) -> Duration>(
    failures: usize,
    max_retries: usize,
    timeout: Option<Duration>,
    delay: F,
) -> bool {
    if failures > max_retries {
        return false;
    }
    match timeout {
        Some(timeout) => {
            let projected =
                (1..=failures).map(delay).fold(Duration::ZERO, |total, d| total.saturating_add(d));
            projected <= timeout
        }
        None => true,
    }
}

/// Strategy that doubles the delay after every failure.
///
/// The `n`-th retry, counting from zero, waits for `base * 2^n`.
pub struct ExponentialBackoff {
    /// Delay before the first retry.
    base: Duration,

    /// Maximum number of retries.
    max_retries: usize,

    /// Maximum total time to spend waiting across retries.
    timeout: Option<Duration>,

    /// Clock to wait on.
    clock: Arc<dyn Clock + Send + Sync>,
}

impl ExponentialBackoff {
    /// Creates a new strategy that waits on `clock`.
    pub fn new(
        clock: Arc<dyn Clock + Send + Sync>,
        base: Duration,
        max_retries: usize,
        timeout: Option<Duration>,
    ) -> Self {
        Self { base, max_retries, timeout, clock }
    }

    /// Computes the delay before the retry that follows `failures` failures.
    fn delay(&self, failures: usize) -> Duration {
        let exponent = u32::try_from(failures.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(2u32.saturating_pow(exponent))
    }
}

#[async_trait]
impl RetryStrategy for ExponentialBackoff {
    async fn should_try(&self, ctx: &Context, failures: usize) -> ContextResult<bool> {
        if !within_budget(failures, self.max_retries, self.timeout, |n| self.delay(n)) {
            return Ok(false);
        }
        sleep_or_cancel(self.clock.as_ref(), ctx, self.delay(failures)).await?;
        Ok(true)
    }
}

/// Strategy that waits the same amount of time after every failure.
pub struct FixedDelay {
    /// Delay before every retry.
    delay: Duration,

    /// Maximum number of retries.
    max_retries: usize,

    /// Maximum total time to spend waiting across retries.
    timeout: Option<Duration>,

    /// Clock to wait on.
    clock: Arc<dyn Clock + Send + Sync>,
}

impl FixedDelay {
    /// Creates a new strategy that waits on `clock`.
    pub fn new(
        clock: Arc<dyn Clock + Send + Sync>,
        delay: Duration,
        max_retries: usize,
        timeout: Option<Duration>,
    ) -> Self {
        Self { delay, max_retries, timeout, clock }
    }
}

#[async_trait]
impl RetryStrategy for FixedDelay {
    async fn should_try(&self, ctx: &Context, failures: usize) -> ContextResult<bool> {
        if !within_budget(failures, self.max_retries, self.timeout, |_| self.delay) {
            return Ok(false);
        }
        sleep_or_cancel(self.clock.as_ref(), ctx, self.delay).await?;
        Ok(true)
    }
}

/// Strategy that waits a random amount of time in `[0, max_wait]` after every failure.
///
/// The timeout is checked against the worst case, which assumes that every wait is `max_wait`.
pub struct Jitter {
    /// Upper bound of every delay.
    max_wait: Duration,

    /// Maximum number of retries.
    max_retries: usize,

    /// Maximum total time to spend waiting across retries.
    timeout: Option<Duration>,

    /// Clock to wait on.
    clock: Arc<dyn Clock + Send + Sync>,
}

impl Jitter {
    /// Creates a new strategy that waits on `clock`.
    pub fn new(
        clock: Arc<dyn Clock + Send + Sync>,
        max_wait: Duration,
        max_retries: usize,
        timeout: Option<Duration>,
    ) -> Self {
        Self { max_wait, max_retries, timeout, clock }
    }
}

#[async_trait]
impl RetryStrategy for Jitter {
    async fn should_try(&self, ctx: &Context, failures: usize) -> ContextResult<bool> {
        if !within_budget(failures, self.max_retries, self.timeout, |_| self.max_wait) {
            return Ok(false);
        }
        let delay = rand::rng().random_range(Duration::ZERO..=self.max_wait);
        sleep_or_cancel(self.clock.as_ref(), ctx, delay).await?;
        Ok(true)
    }
}

/// Names of the available retry strategies.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StrategyKind {
    /// Selects `ExponentialBackoff`.
    Exponential,

    /// Selects `FixedDelay`.
    Fixed,

    /// Selects `Jitter`.
    Jitter,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exponential" => Ok(StrategyKind::Exponential),
            "fixed" => Ok(StrategyKind::Fixed),
            "jitter" => Ok(StrategyKind::Jitter),
            _ => Err(format!("Unknown retry strategy '{}'", s)),
        }
    }
}

/// Configuration options for retries.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryOptions {
    /// Strategy to use.
    pub strategy: StrategyKind,

    /// Base delay of the strategy.  This is the maximum wait for `Jitter`.
    pub delay: Duration,

    /// Maximum number of retries after the first attempt.
    pub max_retries: usize,

    /// Maximum total time to spend waiting across retries.
    pub timeout: Option<Duration>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Exponential,
            delay: Duration::from_millis(100),
            max_retries: 3,
            timeout: None,
        }
    }
}

impl RetryOptions {
    /// Creates a new set of options from environment variables whose name is prefixed with the
    /// given `prefix`.
    ///
    /// This will use variables such as `<prefix>_STRATEGY`, `<prefix>_DELAY`,
    /// `<prefix>_MAX_RETRIES` and `<prefix>_TIMEOUT`.
    pub fn from_env(prefix: &str) -> Result<Self, String> {
        let defaults = Self::default();
        let strategy = match get_optional_var::<String>(prefix, "STRATEGY")? {
            Some(name) => name.parse::<StrategyKind>()?,
            None => defaults.strategy,
        };
        Ok(Self {
            strategy,
            delay: get_optional_var::<Duration>(prefix, "DELAY")?.unwrap_or(defaults.delay),
            max_retries: get_optional_var::<usize>(prefix, "MAX_RETRIES")?
                .unwrap_or(defaults.max_retries),
            timeout: get_optional_var::<Duration>(prefix, "TIMEOUT")?,
        })
    }

    /// Instantiates the strategy described by these options that waits on `clock`.
    pub fn into_strategy(self, clock: Arc<dyn Clock + Send + Sync>) -> Arc<dyn RetryStrategy> {
        match self.strategy {
            StrategyKind::Exponential => {
                Arc::new(ExponentialBackoff::new(clock, self.delay, self.max_retries, self.timeout))
            }
            StrategyKind::Fixed => {
                Arc::new(FixedDelay::new(clock, self.delay, self.max_retries, self.timeout))
            }
            StrategyKind::Jitter => {
                Arc::new(Jitter::new(clock, self.delay, self.max_retries, self.timeout))
            }
        }
    }
}

/// Copies `request` so that it can be sent again.
fn replay(request: &TransportRequest) -> TransportRequest {
    let mut copy = http::Request::new(request.body().clone());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}

/// Round-tripper that repeats requests that fail transiently.
///
/// A request is repeated if the inner round-tripper reports a transient error or if the response
/// status is one of `TRANSIENT_STATUSES`, subject to per-status overrides.  Context errors are
/// never retried.
pub struct RetryTransport<T> {
    /// Round-tripper that sends every attempt.
    inner: T,

    /// Strategy that paces the attempts.
    strategy: Arc<dyn RetryStrategy>,

    /// Whether to retry specific statuses, taking precedence over `TRANSIENT_STATUSES`.
    overrides: HashMap<StatusCode, bool>,
}

impl<T: RoundTripper> RetryTransport<T> {
    /// Wraps `inner` so that its requests are retried as decided by `strategy`.
    pub fn new(inner: T, strategy: Arc<dyn RetryStrategy>) -> Self {
        Self { inner, strategy, overrides: HashMap::default() }
    }

    /// Wraps `inner` with the strategy configured in `opts` using the system clock.
    pub fn from_options(inner: T, opts: RetryOptions) -> Self {
        Self::new(inner, opts.into_strategy(Arc::new(SystemClock::default())))
    }

    /// Forces responses with `status` to be retried, or not, depending on `retry`.
    pub fn with_status_override(mut self, status: StatusCode, retry: bool) -> Self {
        self.overrides.insert(status, retry);
        self
    }

    /// Returns true if responses with `status` should be retried.
    fn is_transient_status(&self, status: StatusCode) -> bool {
        match self.overrides.get(&status) {
            Some(retry) => *retry,
            None => TRANSIENT_STATUSES.contains(&status),
        }
    }
}

#[async_trait]
impl<T: RoundTripper> RoundTripper for RetryTransport<T> {
    async fn round_trip(
        &self,
        ctx: &Context,
        request: TransportRequest,
    ) -> TransportResult<TransportResponse> {
        let mut failures = 0;
        loop {
            if let Some(e) = ctx.err() {
                return Err(e.into());
            }

            let result = self.inner.round_trip(ctx, replay(&request)).await;
            let cause = match &result {
                Ok(response) if self.is_transient_status(response.status()) => {
                    Some(format!("status {}", response.status()))
                }
                Err(e) if e.is_transient() => Some(e.to_string()),
                _ => None,
            };
            let Some(cause) = cause else {
                return result;
            };

            failures += 1;
            if !self.strategy.should_try(ctx, failures).await? {
                warn!(
                    "Giving up on {} {} after {} attempts: {}",
                    request.method(),
                    request.uri(),
                    failures,
                    cause
                );
                return result;
            }
            debug!("Retrying {} {} after {}", request.method(), request.uri(), cause);
        }
    }
}
