//! Scripted device doubles for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{StreamExt, stream};

use vmon_transport::{
    CommandError, CommandRunner, PushConnector, PushStream, ResponseBody, TransportError,
};

/// One connection delivering scripted frames, then idling; later attempts fail.
#[derive(Clone)]
pub struct ScriptedPush {
    pub frames: Arc<Mutex<Option<Vec<String>>>>,
}

impl ScriptedPush {
    pub fn new(frames: &[&str]) -> Self {
        Self {
            frames: Arc::new(Mutex::new(Some(
                frames.iter().map(|f| f.to_string()).collect(),
            ))),
        }
    }

    /// Every attempt is refused.
    pub fn refusing() -> Self {
        Self {
            frames: Arc::new(Mutex::new(None)),
        }
    }
}

impl PushConnector for ScriptedPush {
    async fn connect(&self) -> Result<PushStream, TransportError> {
        match self.frames.lock().expect("lock").take() {
            Some(frames) => Ok(Box::pin(
                stream::iter(frames.into_iter().map(Ok::<_, TransportError>))
                    .chain(stream::pending()),
            )),
            None => Err(TransportError::Unavailable("refused".into())),
        }
    }
}

/// Answers every command with `"<command>: ok\n"` after `delay_secs`.
/// Commands starting with `bad` are rejected with HTTP 400, commands
/// starting with `stall` never produce output.
#[derive(Clone, Default)]
pub struct EchoRunner {
    pub calls: Arc<Mutex<VecDeque<String>>>,
    pub count: Arc<AtomicUsize>,
    pub delay_secs: u64,
}

impl EchoRunner {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock").iter().cloned().collect()
    }
}

impl CommandRunner for EchoRunner {
    async fn open(&self, command: &str) -> Result<ResponseBody, CommandError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.calls
            .lock()
            .expect("lock")
            .push_back(command.to_string());
        if command.starts_with("bad") {
            return Err(CommandError::Status {
                status: 400,
                body: "Unrecognised command\n".into(),
            });
        }
        if command.starts_with("stall") {
            return Ok(Box::pin(stream::pending::<Result<Bytes, CommandError>>()));
        }
        let delay = Duration::from_secs(self.delay_secs);
        let text = format!("{command}: ok\n");
        Ok(Box::pin(stream::once(async move {
            tokio::time::sleep(delay).await;
            Ok::<_, CommandError>(Bytes::from(text))
        })))
    }
}
