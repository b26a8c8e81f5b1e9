//! `vmon console` — interactive shell on the device.
//!
//! Each line runs as a user command in append mode against the console
//! region, so earlier output stays visible. Input is not read while a command
//! runs; Ctrl-C cancels the running command, or clears the line at the prompt.

use std::io::{self, Write};

use anyhow::{anyhow, bail};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vmon_core::{OutputMode, RegionId, ShellHistory};
use vmon_transport::{HttpCommandRunner, SharedRegion, WsConnector, shared_region};

use crate::cli::ConsoleOpts;
use crate::client_loop::{ClientParts, UserCommand, Watch, drive, observers};
use crate::config::Settings;
use crate::regions::StdoutRegion;

pub const CONSOLE_REGION: &str = "console";
const PROMPT: &str = "vmon> ";

/// Entry point for `vmon console`.
pub async fn cmd_console(settings: &Settings, host: &str, opts: &ConsoleOpts) -> anyhow::Result<()> {
    let region_id = RegionId::from(CONSOLE_REGION);
    let console = shared_region(StdoutRegion::stdout());
    let regions = [(region_id.clone(), console.clone())];

    let (interrupt_tx, mut interrupts) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if interrupt_tx.send(()).is_err() {
                break;
            }
        }
    });

    let (commands_tx, mut commands) = mpsc::channel(1);
    let session = ConsoleSession::new(
        ShellHistory::new(opts.history),
        commands_tx,
        region_id,
        console,
        io::stdout(),
    );
    let parts = ClientParts {
        settings,
        connector: WsConnector::for_host(host),
        runner: HttpCommandRunner::new(&format!("http://{host}"))?,
        regions: &regions,
        observers: observers(),
        force_prime: false,
    };

    // The session owns the command sender; when it ends the client loop sees
    // the channel close and stops.
    let (client, session) = tokio::join!(
        drive(parts, &mut commands, CancellationToken::new()),
        session.run(BufReader::new(tokio::io::stdin()), &mut interrupts),
    );
    session?;
    client
}

/// What one input line asks for.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Empty,
    Exit,
    /// Text for the operator, not sent to the device.
    Message(String),
    Run { command: String, watch: Option<Watch> },
}

pub struct ConsoleSession<W> {
    history: ShellHistory,
    commands: mpsc::Sender<UserCommand>,
    region_id: RegionId,
    region: SharedRegion,
    out: W,
}

impl<W: Write> ConsoleSession<W> {
    pub fn new(
        history: ShellHistory,
        commands: mpsc::Sender<UserCommand>,
        region_id: RegionId,
        region: SharedRegion,
        out: W,
    ) -> Self {
        Self {
            history,
            commands,
            region_id,
            region,
            out,
        }
    }

    /// Read and run lines until `exit`, EOF, or the client loop going away.
    pub async fn run<I: AsyncBufRead + Unpin>(
        mut self,
        input: I,
        interrupts: &mut mpsc::UnboundedReceiver<()>,
    ) -> anyhow::Result<()> {
        let mut lines = input.lines();
        loop {
            write!(self.out, "{PROMPT}")?;
            self.out.flush()?;

            let line = tokio::select! {
                line = lines.next_line() => line?,
                Some(()) = interrupts.recv() => {
                    writeln!(self.out)?;
                    continue;
                }
            };
            let Some(line) = line else {
                writeln!(self.out)?;
                return Ok(());
            };

            match self.interpret(&line) {
                Input::Empty => {}
                Input::Exit => return Ok(()),
                Input::Message(text) => writeln!(self.out, "{text}")?,
                Input::Run { command, watch } => self.execute(command, watch, interrupts).await?,
            }
        }
    }

    fn interpret(&mut self, line: &str) -> Input {
        let line = line.trim();
        if line.is_empty() {
            return Input::Empty;
        }
        if matches!(line, "exit" | "quit") {
            return Input::Exit;
        }
        let Some(line) = self.history.expand(line) else {
            return Input::Message(format!("{line}: event not found"));
        };
        self.history.push(&line);

        if line == "history" {
            let listing: Vec<String> = self
                .history
                .entries()
                .enumerate()
                .map(|(i, entry)| format!("{:>5}  {entry}", i + 1))
                .collect();
            return Input::Message(listing.join("\n"));
        }
        if let Some(rest) = line.strip_prefix("watch ") {
            return match rest.trim().split_once(' ') {
                Some((count, command)) if count.parse::<u32>().is_ok() => Input::Run {
                    command: command.trim().to_string(),
                    watch: count.parse().ok().map(Watch::new),
                },
                _ => Input::Message("usage: watch <count> <command>".to_string()),
            };
        }
        Input::Run {
            command: line,
            watch: None,
        }
    }

    async fn execute(
        &mut self,
        command: String,
        watch: Option<Watch>,
        interrupts: &mut mpsc::UnboundedReceiver<()>,
    ) -> anyhow::Result<()> {
        let (mut cmd, done) = UserCommand::new(command, self.region_id.clone(), OutputMode::Append);
        if let Some(watch) = watch {
            cmd = cmd.with_watch(watch);
        }
        let cancel = cmd.cancel.clone();
        self.commands
            .send(cmd)
            .await
            .map_err(|_| anyhow!("client stopped"))?;

        tokio::pin!(done);
        let result = loop {
            tokio::select! {
                result = &mut done => break result,
                Some(()) = interrupts.recv() => cancel.cancel(),
            }
        };
        match result {
            Ok(Ok(outcome)) => tracing::debug!(chunks = outcome.chunks, "console command finished"),
            // already shown in the console region
            Ok(Err(e)) => tracing::debug!("console command failed: {e}"),
            Err(_) => bail!("client stopped before the command finished"),
        }

        let mut region = self.region.lock().await;
        let text = region.text();
        if !text.is_empty() && !text.ends_with('\n') {
            region.append_escaped("\n");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use vmon_core::BufferRegion;

    use crate::client_loop::ClientLoop;
    use crate::fakes::{EchoRunner, ScriptedPush};

    fn session<W: Write>(
        region: SharedRegion,
        out: W,
    ) -> (ConsoleSession<W>, mpsc::Receiver<UserCommand>) {
        let (tx, rx) = mpsc::channel(1);
        let s = ConsoleSession::new(
            ShellHistory::default(),
            tx,
            RegionId::from(CONSOLE_REGION),
            region,
            out,
        );
        (s, rx)
    }

    /// Output sink readable after the session consumed its writer.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn interpret_builtins() {
        let (mut s, _rx) = session(shared_region(BufferRegion::new()), Vec::new());
        assert_eq!(s.interpret("   "), Input::Empty);
        assert_eq!(s.interpret("quit"), Input::Exit);
        assert_eq!(
            s.interpret("!!"),
            Input::Message("!!: event not found".into())
        );
        assert_eq!(
            s.interpret("stat"),
            Input::Run {
                command: "stat".into(),
                watch: None
            }
        );
        assert_eq!(
            s.interpret("watch 5 charge start"),
            Input::Run {
                command: "charge start".into(),
                watch: Some(Watch::new(5))
            }
        );
        assert!(matches!(s.interpret("watch many stat"), Input::Message(_)));
        assert_eq!(
            s.interpret("history"),
            Input::Message(
                "    1  stat\n    2  watch 5 charge start\n    3  watch many stat\n    4  history"
                    .into()
            )
        );
    }

    async fn run_console(
        runner: EchoRunner,
        input: &'static str,
        interrupt_after: Option<Duration>,
    ) -> (String, String) {
        let region = shared_region(BufferRegion::new());
        let settings = Settings::default();
        let mut client = ClientLoop::new(
            &settings,
            ScriptedPush::new(&[]),
            runner,
            [(RegionId::from(CONSOLE_REGION), region.clone())],
            observers(),
        )
        .expect("client");

        let out = SharedBuf::default();
        let (s, mut rx) = session(region.clone(), out.clone());
        let (int_tx, mut interrupts) = mpsc::unbounded_channel();
        if let Some(after) = interrupt_after {
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = int_tx.send(());
            });
        }

        let (_, result) = tokio::join!(
            client.run(&mut rx, CancellationToken::new()),
            s.run(input.as_bytes(), &mut interrupts),
        );
        result.expect("session");

        let text = region.lock().await.text();
        let out = String::from_utf8(out.0.lock().expect("lock").clone()).expect("utf8");
        (text, out)
    }

    #[tokio::test(start_paused = true)]
    async fn commands_append_with_history_recall() {
        let runner = EchoRunner::default();
        let (text, out) = run_console(runner.clone(), "stat\n!!\nbad\n!9\nhistory\nexit\n", None).await;

        assert_eq!(runner.calls(), vec!["stat", "stat", "bad"]);
        assert_eq!(
            text,
            "$ stat\nstat: ok\n$ stat\nstat: ok\n$ bad\nUnrecognised command\n"
        );
        assert!(out.contains("!9: event not found"), "{out}");
        assert!(out.contains("    1  stat\n    2  bad\n    3  history"), "{out}");
        assert!(out.starts_with(PROMPT));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_cancels_running_command() {
        let runner = EchoRunner::default();
        let (text, _) = run_console(runner, "stall forever\nexit\n", Some(Duration::from_secs(1))).await;
        assert_eq!(text, "$ stall forever\nError: command cancelled\n");
    }

    #[tokio::test(start_paused = true)]
    async fn eof_ends_session() {
        let (text, out) = run_console(EchoRunner::default(), "", None).await;
        assert_eq!(text, "");
        assert_eq!(out, format!("{PROMPT}\n"));
    }
}
