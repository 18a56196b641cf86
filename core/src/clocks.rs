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

//! Collection of clock implementations.

use crate::context::{Context, ContextResult};
use async_trait::async_trait;
use std::time::Duration;

/// Generic definition of a clock.
#[async_trait]
pub trait Clock {
    /// Pauses execution of the current task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Clock implementation that uses the system clock.
#[derive(Clone, Debug, Default)]
pub struct SystemClock {}

#[async_trait]
impl Clock for SystemClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Sleeps on `clock` for `duration` unless `ctx` is cancelled or expires first, in which case
/// the sleep is abandoned and the reason is returned.
pub async fn sleep_or_cancel<C>(clock: &C, ctx: &Context, duration: Duration) -> ContextResult<()>
where
    C: Clock + Send + Sync + ?Sized,
{
    if let Some(e) = ctx.err() {
        return Err(e);
    }

    tokio::select! {
        e = ctx.done() => Err(e),
        () = clock.sleep(duration) => Ok(()),
    }
}

/// Test utilities.
#[cfg(any(test, feature = "testutils"))]
pub mod testutils {
    use super::*;
    use std::sync::Mutex;

    /// A clock that never blocks and that remembers every sleep that was requested.
    ///
    /// This makes it possible to test waiting strategies without slowing tests down.
    #[derive(Default)]
    pub struct FakeClock {
        /// Durations passed to `sleep`, in call order.
        sleeps: Mutex<Vec<Duration>>,
    }

    impl FakeClock {
        /// Returns the durations of all sleeps issued so far.
        pub fn sleeps(&self) -> Vec<Duration> {
            self.sleeps.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Clock for FakeClock {
        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().unwrap().push(duration);
            tokio::task::yield_now().await;
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_fakeclock_sleep_records() {
            let clock = FakeClock::default();
            // Sleep for an unreasonable period to ensure we don't block for long.
            clock.sleep(Duration::from_secs(3600)).await;
            clock.sleep(Duration::from_millis(5)).await;
            assert_eq!(vec![Duration::from_secs(3600), Duration::from_millis(5)], clock.sleeps());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutils::FakeClock;
    use super::*;
    use crate::context::ContextError;

    #[tokio::test]
    async fn test_sleep_or_cancel_sleeps() {
        let clock = FakeClock::default();
        sleep_or_cancel(&clock, &Context::background(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(vec![Duration::from_secs(1)], clock.sleeps());
    }

    #[tokio::test]
    async fn test_sleep_or_cancel_already_cancelled() {
        let clock = FakeClock::default();
        let (ctx, handle) = Context::background().with_cancel();
        handle.cancel();
        assert_eq!(
            ContextError::Canceled,
            sleep_or_cancel(&clock, &ctx, Duration::from_secs(1)).await.unwrap_err()
        );
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_sleep_or_cancel_interrupted() {
        let clock = SystemClock::default();
        let (ctx, handle) = Context::background().with_cancel();
        let sleeper = tokio::spawn(async move {
            sleep_or_cancel(&clock, &ctx, Duration::from_secs(3600)).await
        });
        tokio::task::yield_now().await;
        handle.cancel();
        assert_eq!(ContextError::Canceled, sleeper.await.unwrap().unwrap_err());
    }
}
