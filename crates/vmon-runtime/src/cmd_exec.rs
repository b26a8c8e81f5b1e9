//! `vmon exec` — run one command and stream its output to stdout.

use std::future::Future;
use std::time::Duration;

use vmon_core::RegionId;
use vmon_transport::{
    CommandError, CommandRunner, CommandStreamExecutor, HttpCommandRunner, RunOptions, RunOutcome,
    SharedRegion, shared_region,
};

use crate::cli::ExecOpts;
use crate::config::Settings;
use crate::regions::StdoutRegion;

pub const EXIT_FAILED: i32 = 1;
pub const EXIT_TIMEOUT: i32 = 2;

/// Entry point for `vmon exec`. Returns the process exit code.
pub async fn cmd_exec(settings: &Settings, host: &str, opts: &ExecOpts) -> anyhow::Result<i32> {
    let runner = HttpCommandRunner::new(&format!("http://{host}"))?;
    let executor = CommandStreamExecutor::new(runner, settings.timeout_policy()?);
    let region = shared_region(StdoutRegion::stdout());
    let idle = opts.idle_timeout.map(Duration::from_secs);

    let interrupt = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let result = run_exec(&executor, &opts.command_line(), idle, region, interrupt).await;
    Ok(exit_code(&result))
}

/// Stream `command` into `region`; `interrupt` completing cancels the run.
pub async fn run_exec<R: CommandRunner>(
    executor: &CommandStreamExecutor<R>,
    command: &str,
    idle_timeout: Option<Duration>,
    region: SharedRegion,
    interrupt: impl Future<Output = ()>,
) -> Result<RunOutcome, CommandError> {
    let options = RunOptions {
        idle_timeout,
        ..RunOptions::replace()
    };
    let handle = executor.execute(command, RegionId::from("exec"), region.clone(), options);
    let cancel = handle.cancel_token();
    let wait = handle.wait();
    tokio::pin!(wait, interrupt);

    let result = tokio::select! {
        result = &mut wait => result,
        () = &mut interrupt => {
            tracing::debug!(command, "interrupted");
            cancel.cancel();
            wait.await
        }
    };

    // leave the shell prompt on a line of its own
    let mut r = region.lock().await;
    let text = r.text();
    if !text.is_empty() && !text.ends_with('\n') {
        r.append_escaped("\n");
    }
    result
}

pub fn exit_code(result: &Result<RunOutcome, CommandError>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) if e.is_timeout() => EXIT_TIMEOUT,
        Err(_) => EXIT_FAILED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;

    use vmon_core::{BufferRegion, DisplayRegion, TimeoutPolicy};

    use crate::fakes::EchoRunner;

    fn executor() -> CommandStreamExecutor<EchoRunner> {
        CommandStreamExecutor::new(EchoRunner::default(), TimeoutPolicy::default())
    }

    #[tokio::test]
    async fn success_streams_output() {
        let region = shared_region(BufferRegion::new());
        let result = run_exec(&executor(), "stat", None, region.clone(), pending()).await;
        assert_eq!(exit_code(&result), 0);
        assert_eq!(region.lock().await.text(), "stat: ok\n");
    }

    #[tokio::test]
    async fn rejected_command_exits_one() {
        let region = shared_region(BufferRegion::new());
        let result = run_exec(&executor(), "bad", None, region.clone(), pending()).await;
        assert_eq!(exit_code(&result), EXIT_FAILED);
        assert_eq!(region.lock().await.text(), "Unrecognised command\n");
    }

    #[tokio::test(start_paused = true)]
    async fn stall_exits_two() {
        let region = shared_region(BufferRegion::new());
        let result = run_exec(
            &executor(),
            "stall",
            Some(Duration::from_secs(3)),
            region.clone(),
            pending(),
        )
        .await;
        assert_eq!(exit_code(&result), EXIT_TIMEOUT);
        assert_eq!(
            region.lock().await.text(),
            "Error: no output for 3s, command aborted\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_cancels_run() {
        let region = shared_region(BufferRegion::new());
        let interrupt = tokio::time::sleep(Duration::from_secs(1));
        let result = run_exec(&executor(), "stall", None, region, interrupt).await;
        assert!(matches!(result, Err(CommandError::Cancelled)));
        assert_eq!(exit_code(&result), EXIT_FAILED);
    }
}
