use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
}

impl GeoPosition {
    pub fn new(latitude: f64, longitude: f64, accuracy: f64) -> Option<Self> {
        let valid = (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude)
            && accuracy.is_finite()
            && accuracy >= 0.0;
        valid.then_some(Self {
            latitude,
            longitude,
            accuracy,
        })
    }
}

impl fmt::Display for GeoPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.6}, {:.6} (±{:.0} m)",
            self.latitude, self.longitude, self.accuracy
        )
    }
}

/// Shared flag checked between attempts and while waiting.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeoError {
    PermissionDenied,
    Unsupported,
    Unavailable(String),
    Timeout(Duration),
    Cancelled,
    Exhausted { attempts: u32, last: Box<GeoError> },
}

impl GeoError {
    fn is_retryable(&self) -> bool {
        matches!(self, GeoError::Unavailable(_) | GeoError::Timeout(_))
    }

    /// Message shown to the person filling the form.
    pub fn user_message(&self) -> String {
        match self {
            GeoError::PermissionDenied => {
                "Permissão de localização negada. Habilite o acesso à localização.".to_string()
            }
            GeoError::Unsupported => "Geolocalização não suportada neste dispositivo.".to_string(),
            GeoError::Unavailable(_) => "Localização indisponível no momento.".to_string(),
            GeoError::Timeout(_) => "Tempo esgotado ao obter a localização.".to_string(),
            GeoError::Cancelled => "Obtenção de localização cancelada.".to_string(),
            GeoError::Exhausted { attempts, last } => format!(
                "Não foi possível obter a localização após {} tentativas. {}",
                attempts,
                last.user_message()
            ),
        }
    }
}

impl fmt::Display for GeoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeoError::PermissionDenied => write!(f, "location permission denied"),
            GeoError::Unsupported => write!(f, "geolocation unsupported"),
            GeoError::Unavailable(message) => write!(f, "position unavailable: {}", message),
            GeoError::Timeout(limit) => write!(f, "position timed out after {:?}", limit),
            GeoError::Cancelled => write!(f, "position request cancelled"),
            GeoError::Exhausted { attempts, last } => {
                write!(f, "gave up after {} attempts: {}", attempts, last)
            }
        }
    }
}

impl std::error::Error for GeoError {}

pub trait LocationProvider {
    fn locate(&mut self, timeout: Duration, cancel: &CancelToken)
    -> Result<GeoPosition, GeoError>;
}

pub trait Sleeper {
    /// Returns false when the wait was interrupted by cancellation.
    fn sleep(&mut self, duration: Duration, cancel: &CancelToken) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration, cancel: &CancelToken) -> bool {
        let slice = Duration::from_millis(25);
        let mut remaining = duration;
        while !remaining.is_zero() {
            if cancel.is_cancelled() {
                return false;
            }
            let step = remaining.min(slice);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        !cancel.is_cancelled()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Wait after the given 1-based failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

pub fn acquire_position(
    provider: &mut dyn LocationProvider,
    policy: &RetryPolicy,
    sleeper: &mut dyn Sleeper,
    cancel: &CancelToken,
) -> Result<GeoPosition, GeoError> {
    let attempts = policy.max_retries.max(1);
    let mut last = GeoError::Unavailable("no attempt made".to_string());

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(GeoError::Cancelled);
        }
        match provider.locate(policy.attempt_timeout, cancel) {
            Ok(position) => {
                tracing::debug!(attempt, "geolocation acquired");
                return Ok(position);
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                tracing::warn!(attempt, error = %err, "geolocation attempt failed");
                last = err;
            }
        }
        if attempt < attempts && !sleeper.sleep(policy.delay_after(attempt), cancel) {
            return Err(GeoError::Cancelled);
        }
    }

    Err(GeoError::Exhausted {
        attempts,
        last: Box::new(last),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedProvider {
        outcomes: VecDeque<Result<GeoPosition, GeoError>>,
        calls: u32,
    }

    impl ScriptedProvider {
        fn new(outcomes: Vec<Result<GeoPosition, GeoError>>) -> Self {
            Self {
                outcomes: outcomes.into(),
                calls: 0,
            }
        }
    }

    impl LocationProvider for ScriptedProvider {
        fn locate(
            &mut self,
            _timeout: Duration,
            _cancel: &CancelToken,
        ) -> Result<GeoPosition, GeoError> {
            self.calls += 1;
            self.outcomes
                .pop_front()
                .unwrap_or(Err(GeoError::Unavailable("script exhausted".into())))
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        waits: Vec<Duration>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&mut self, duration: Duration, cancel: &CancelToken) -> bool {
            self.waits.push(duration);
            !cancel.is_cancelled()
        }
    }

    fn position() -> GeoPosition {
        GeoPosition::new(-23.55052, -46.633308, 12.0).unwrap()
    }

    #[test]
    fn two_failures_then_success_waits_with_growing_delay() {
        let mut provider = ScriptedProvider::new(vec![
            Err(GeoError::Timeout(Duration::from_secs(10))),
            Err(GeoError::Unavailable("no fix".into())),
            Ok(position()),
        ]);
        let mut sleeper = RecordingSleeper::default();
        let policy = RetryPolicy {
            max_retries: 3,
            ..RetryPolicy::default()
        };

        let got = acquire_position(&mut provider, &policy, &mut sleeper, &CancelToken::new())
            .expect("third attempt succeeds");

        assert_eq!(got, position());
        assert_eq!(provider.calls, 3);
        assert_eq!(
            sleeper.waits,
            vec![Duration::from_millis(1000), Duration::from_millis(2000)]
        );
    }

    #[test]
    fn exhausted_error_carries_last_cause() {
        let mut provider = ScriptedProvider::new(vec![
            Err(GeoError::Unavailable("a".into())),
            Err(GeoError::Unavailable("b".into())),
            Err(GeoError::Timeout(Duration::from_secs(1))),
        ]);
        let mut sleeper = RecordingSleeper::default();
        let err = acquire_position(
            &mut provider,
            &RetryPolicy::default(),
            &mut sleeper,
            &CancelToken::new(),
        )
        .unwrap_err();

        match err {
            GeoError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(*last, GeoError::Timeout(Duration::from_secs(1)));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(sleeper.waits.len(), 2);
    }

    #[test]
    fn permission_denied_is_not_retried() {
        let mut provider = ScriptedProvider::new(vec![Err(GeoError::PermissionDenied)]);
        let mut sleeper = RecordingSleeper::default();
        let err = acquire_position(
            &mut provider,
            &RetryPolicy::default(),
            &mut sleeper,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(err, GeoError::PermissionDenied);
        assert_eq!(provider.calls, 1);
        assert!(sleeper.waits.is_empty());
        assert!(err.user_message().contains("negada"));
    }

    #[test]
    fn cancellation_during_backoff_stops_retrying() {
        let cancel = CancelToken::new();
        let mut provider = ScriptedProvider::new(vec![
            Err(GeoError::Unavailable("a".into())),
            Ok(position()),
        ]);
        struct CancellingSleeper(CancelToken);
        impl Sleeper for CancellingSleeper {
            fn sleep(&mut self, _duration: Duration, _cancel: &CancelToken) -> bool {
                self.0.cancel();
                false
            }
        }
        let mut sleeper = CancellingSleeper(cancel.clone());
        let err = acquire_position(&mut provider, &RetryPolicy::default(), &mut sleeper, &cancel)
            .unwrap_err();
        assert_eq!(err, GeoError::Cancelled);
        assert_eq!(provider.calls, 1);
    }

    #[test]
    fn out_of_range_coordinates_are_rejected() {
        assert!(GeoPosition::new(91.0, 0.0, 1.0).is_none());
        assert!(GeoPosition::new(0.0, 181.0, 1.0).is_none());
        assert!(GeoPosition::new(0.0, 0.0, -1.0).is_none());
    }
}
