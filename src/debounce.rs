//! Debouncing: collapse rapid repeated calls into one.
//!
//! A small timer-reset primitive on tokio. Calls arriving within the quiet
//! period replace the pending arguments; the wrapped action runs once with
//! the arguments of the last call after the quiet period elapses with no
//! further calls. Used to keep a double-clicked like/unlike toggle from
//! issuing two network writes.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

/// Handle to a debounced action. Cheap to clone; all clones feed the same
/// timer. Dropping every handle still runs a pending call once its quiet
/// period elapses, then the background task exits.
#[derive(Clone)]
pub struct Debouncer<A: Send + 'static> {
  tx: mpsc::UnboundedSender<A>,
}

impl<A: Send + 'static> Debouncer<A> {
  /// Wrap `action` so that repeated [`call`](Self::call)s within
  /// `quiet_period` collapse into a single invocation with the last
  /// arguments.
  pub fn new<F, Fut>(quiet_period: Duration, action: F) -> Self
  where
    F: Fn(A) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let (tx, mut rx) = mpsc::unbounded_channel::<A>();

    tokio::spawn(async move {
      let mut pending: Option<A> = None;
      loop {
        match pending.take() {
          None => match rx.recv().await {
            Some(args) => pending = Some(args),
            None => break,
          },
          Some(args) => {
            tokio::select! {
              next = rx.recv() => match next {
                // A newer call within the quiet period wins.
                Some(newer) => pending = Some(newer),
                None => {
                  // Every handle is gone; the pending call still waits out
                  // the quiet period before it runs.
                  tokio::time::sleep(quiet_period).await;
                  action(args).await;
                  break;
                }
              },
              _ = tokio::time::sleep(quiet_period) => {
                action(args).await;
              }
            }
          }
        }
      }
    });

    Self { tx }
  }

  /// Record an invocation. The action runs with these arguments unless a
  /// newer call arrives within the quiet period.
  pub fn call(&self, args: A) {
    let _ = self.tx.send(args);
  }
}
