//! Process supervisor for one external engine invocation.
//!
//! The engine's stdout and stderr share a single pipe. One reader thread
//! pushes completed lines into a bounded queue; the supervisor loop pops
//! without blocking, classifies each line, and drives the liveness
//! [`Countdown`]. When the countdown reaches zero the whole process tree is
//! killed. The supervisor always returns, and no process group it started
//! outlives the call.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::core::countdown::{Countdown, GracePolicy};
use crate::core::sentinel::Sentinels;
use crate::core::types::{LineSignal, Termination};
use crate::errors::ConfigError;
use crate::io::config::SupervisorConfig;
use crate::io::process_tree::{spawn_as_group_leader, terminate_tree};

/// Tuning for a supervised run.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub tick: Duration,
    pub grace: GracePolicy,
    pub queue_capacity: usize,
    pub sentinels: Sentinels,
}

impl SupervisorSettings {
    pub fn from_config(cfg: &SupervisorConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            tick: cfg.tick(),
            grace: cfg.grace_policy(),
            queue_capacity: cfg.queue_capacity,
            sentinels: cfg.sentinels()?,
        })
    }
}

/// An output line that matched a sentinel pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlaggedLine {
    pub signal: LineSignal,
    pub line: String,
}

/// Everything observed while supervising one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisedRun {
    pub termination: Termination,
    /// All output lines, in emission order.
    pub lines: Vec<String>,
    /// The subset of `lines` that matched a sentinel, in emission order.
    pub flagged: Vec<FlaggedLine>,
    /// Descendants kept the output stream open after the engine exited and were killed.
    pub orphans_terminated: bool,
}

impl SupervisedRun {
    pub fn has_flagged_lines(&self) -> bool {
        !self.flagged.is_empty()
    }
}

/// Run `cmd` to completion or forced termination.
///
/// Any stdio configuration on `cmd` is replaced. Returns `Err` only when the
/// process cannot be started or polled; a hung or failing engine is reported
/// through [`SupervisedRun::termination`].
#[instrument(skip_all, fields(label = %label))]
pub fn supervise(mut cmd: Command, settings: &SupervisorSettings, label: &str) -> Result<SupervisedRun> {
    let (reader, writer) = std::io::pipe().context("create engine output pipe")?;
    let writer_err = writer.try_clone().context("clone engine output pipe")?;
    cmd.stdin(Stdio::null()).stdout(writer).stderr(writer_err);
    spawn_as_group_leader(&mut cmd);

    debug!(program = ?cmd.get_program(), "spawning engine");
    let mut child = cmd.spawn().context("spawn engine")?;
    // The command still holds the parent's write ends; the reader only sees
    // end-of-stream once they are closed.
    drop(cmd);

    let (tx, rx) = mpsc::sync_channel(settings.queue_capacity);
    let reader_thread = thread::Builder::new()
        .name(format!("{label}-output"))
        .spawn(move || pump_lines(reader, tx));
    let reader_thread = match reader_thread {
        Ok(handle) => handle,
        Err(err) => {
            terminate_tree(&mut child);
            let _ = child.wait();
            return Err(err).context("spawn engine output reader");
        }
    };

    let watched = watch(&mut child, &rx, settings, label);
    let mut run = match watched {
        Ok(run) => run,
        Err(err) => {
            terminate_tree(&mut child);
            let _ = child.wait();
            return Err(err);
        }
    };

    // Lines queued between the last pop and termination. Bounded, since a
    // surviving writer could otherwise keep the queue full forever.
    for line in rx.try_iter().take(settings.queue_capacity) {
        record_line(&mut run, line, settings, label, None);
    }

    if reader_thread.is_finished() {
        match reader_thread.join() {
            Ok(Ok(count)) => debug!(count, "engine output reader finished"),
            Ok(Err(err)) => warn!(err = %format!("{err:#}"), "engine output reader failed"),
            Err(_) => warn!("engine output reader panicked"),
        }
    }

    info!(
        termination = ?run.termination,
        lines = run.lines.len(),
        flagged = run.flagged.len(),
        "engine finished"
    );
    Ok(run)
}

fn watch(
    child: &mut Child,
    rx: &Receiver<String>,
    settings: &SupervisorSettings,
    label: &str,
) -> Result<SupervisedRun> {
    let mut run = SupervisedRun {
        termination: Termination::Forced,
        lines: Vec::new(),
        flagged: Vec::new(),
        orphans_terminated: false,
    };
    let mut countdown = Countdown::new(settings.grace);
    let mut exit_status: Option<ExitStatus> = None;
    let mut stream_closed = false;
    let mut last_tick = Instant::now();

    loop {
        let mut received = 0;
        while received < settings.queue_capacity.max(1) {
            match rx.try_recv() {
                Ok(line) => {
                    record_line(&mut run, line, settings, label, Some(&mut countdown));
                    received += 1;
                }
                Err(TryRecvError::Disconnected) => {
                    stream_closed = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        if exit_status.is_none() {
            exit_status = child.try_wait().context("poll engine process")?;
            if exit_status.is_some() && !stream_closed {
                debug!("engine exited with its output still open, draining");
                countdown.begin_drain();
                last_tick = Instant::now();
            }
        }
        if let Some(status) = exit_status
            && stream_closed
        {
            run.termination = Termination::Exited {
                code: status.code(),
            };
            return Ok(run);
        }

        if countdown.expired() {
            match exit_status {
                None => {
                    error!(
                        pid = child.id(),
                        "no engine output within the liveness window, terminating process tree"
                    );
                    terminate_tree(child);
                    child.wait().context("reap terminated engine")?;
                    run.termination = Termination::Forced;
                }
                Some(status) => {
                    warn!(
                        pid = child.id(),
                        "engine exited but descendants hold its output open, terminating them"
                    );
                    terminate_tree(child);
                    run.orphans_terminated = true;
                    run.termination = Termination::Exited {
                        code: status.code(),
                    };
                }
            }
            return Ok(run);
        }

        // Output is consumed without sleeping. While draining, the budget
        // still shrinks once per elapsed tick so a chatty orphan cannot hold
        // the run open.
        if received > 0 {
            if countdown.is_draining() && last_tick.elapsed() >= settings.tick {
                countdown.tick();
                last_tick = Instant::now();
            }
            continue;
        }
        thread::sleep(settings.tick);
        last_tick = Instant::now();
        let remaining = countdown.tick();
        if remaining < 10 {
            debug!(remaining, "liveness countdown");
        }
    }
}

fn record_line(
    run: &mut SupervisedRun,
    line: String,
    settings: &SupervisorSettings,
    label: &str,
    countdown: Option<&mut Countdown>,
) {
    let signal = settings.sentinels.classify(&line);
    if let Some(countdown) = countdown {
        countdown.observe(signal);
    }
    match signal {
        LineSignal::Plain => debug!(line = %line, "engine output"),
        LineSignal::Error => warn!(label, line = %line, "engine reported an error"),
        LineSignal::Abort => warn!(label, line = %line, "engine is stopping execution"),
        LineSignal::Prompt => error!(
            label,
            line = %line,
            "engine is waiting for interactive input but no operator is present"
        ),
    }
    if signal.is_flagged() {
        run.flagged.push(FlaggedLine {
            signal,
            line: line.clone(),
        });
    }
    run.lines.push(line);
}

/// Reader thread body: forward complete lines until the stream closes or the
/// supervisor stops listening.
fn pump_lines<R: Read>(reader: R, tx: SyncSender<String>) -> Result<u64> {
    let mut reader = BufReader::new(reader);
    let mut count = 0u64;
    loop {
        let mut raw = Vec::new();
        let n = reader
            .read_until(b'\n', &mut raw)
            .context("read engine output")?;
        if n == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&raw)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        if tx.send(line).is_err() {
            break;
        }
        count += 1;
    }
    Ok(count)
}
