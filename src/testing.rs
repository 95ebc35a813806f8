//! Test doubles shared by the unit tests.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::queue::PendingOperation;
use crate::remote::{RemoteError, SubmitReceipt, SubmitRemote};

/// Submit collaborator that replays scripted results, then a fallback.
pub struct ScriptedSubmitter {
  script: Mutex<VecDeque<Result<SubmitReceipt, RemoteError>>>,
  failing: AtomicBool,
  delay: Option<Duration>,
  calls: Mutex<Vec<PendingOperation>>,
}

impl ScriptedSubmitter {
  /// Succeeds unless a scripted result says otherwise.
  pub fn new() -> Self {
    Self {
      script: Mutex::new(VecDeque::new()),
      failing: AtomicBool::new(false),
      delay: None,
      calls: Mutex::new(Vec::new()),
    }
  }

  /// Rejects every call with a server error.
  pub fn always_failing() -> Self {
    let submitter = Self::new();
    submitter.failing.store(true, Ordering::SeqCst);
    submitter
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  /// Queue a result for the next unscripted call.
  pub fn push(&self, result: Result<SubmitReceipt, RemoteError>) {
    self.script.lock().unwrap().push_back(result);
  }

  pub fn succeed_from_now(&self) {
    self.failing.store(false, Ordering::SeqCst);
  }

  /// Ids of every submitted operation, in call order.
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().iter().map(|op| op.id.clone()).collect()
  }

  fn next_result(&self, operation: &PendingOperation) -> Result<SubmitReceipt, RemoteError> {
    if let Some(result) = self.script.lock().unwrap().pop_front() {
      return result;
    }
    if self.failing.load(Ordering::SeqCst) {
      return Err(RemoteError::Rejected {
        status: 500,
        message: "internal error".to_string(),
      });
    }
    Ok(receipt(&format!("remote-{}", operation.id)))
  }
}

impl SubmitRemote for ScriptedSubmitter {
  fn submit<'a>(
    &'a self,
    operation: &'a PendingOperation,
  ) -> BoxFuture<'a, Result<SubmitReceipt, RemoteError>> {
    async move {
      self.calls.lock().unwrap().push(operation.clone());
      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }
      self.next_result(operation)
    }
    .boxed()
  }
}

pub fn receipt(id: &str) -> SubmitReceipt {
  SubmitReceipt {
    id: id.to_string(),
    extra: serde_json::Map::new(),
  }
}
