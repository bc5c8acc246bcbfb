use std::future::Future;
use std::time::Instant;

/// State of the [`MeasureGuard`].
#[derive(Clone, Copy, Debug)]
enum MeasureState {
    /// The future is not ready.
    Pending,
    /// The future has terminated with a status.
    Done(&'static str),
}

/// A guard to [`measure`] the execution of futures.
struct MeasureGuard<'a> {
    state: MeasureState,
    metric_name: &'a str,
    creation_time: Instant,
}

impl<'a> MeasureGuard<'a> {
    fn new(metric_name: &'a str) -> Self {
        Self {
            state: MeasureState::Pending,
            metric_name,
            creation_time: Instant::now(),
        }
    }

    fn done(mut self, status: &'static str) {
        self.state = MeasureState::Done(status);
    }
}

impl Drop for MeasureGuard<'_> {
    fn drop(&mut self) {
        let status = match self.state {
            MeasureState::Pending => "canceled",
            MeasureState::Done(status) => status,
        };

        metric!(
            timer(self.metric_name) = self.creation_time.elapsed(),
            "status" => status,
        );
    }
}

/// Measures the timing of a future and reports it as a timer metric called `metric_name`.
///
/// The metric is tagged with a status derived with the `get_status` function, or `"canceled"` if
/// the future is dropped before completion. See the [`m`] module for status helpers.
pub fn measure<'a, S, F>(
    metric_name: &'a str,
    get_status: S,
    f: F,
) -> impl Future<Output = F::Output> + 'a
where
    F: 'a + Future,
    S: 'a + FnOnce(&F::Output) -> &'static str,
{
    let guard = MeasureGuard::new(metric_name);

    async move {
        let output = f.await;
        guard.done(get_status(&output));
        output
    }
}

/// Status helpers for [`measure`].
pub mod m {
    use crate::error::LoadError;

    /// Creates a status derived from the future's result for [`measure`](super::measure).
    ///
    ///  - `"ok"` if the future resolves to `Ok(_)`
    ///  - `"err"` if the future resolves to `Err(_)`
    pub fn result<T, E>(result: &Result<T, E>) -> &'static str {
        match result {
            Ok(_) => "ok",
            Err(_) => "err",
        }
    }

    /// Like [`result`], but tags failed loads with their error kind.
    pub fn load_result<T>(result: &Result<T, LoadError>) -> &'static str {
        match result {
            Ok(_) => "ok",
            Err(err) => err.metrics_tag(),
        }
    }
}
