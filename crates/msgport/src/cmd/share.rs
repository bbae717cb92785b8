use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

use msgport_channel::{CallbackError, Context, MessagePort, SharedArrayBuffer, Value, Worker};
use msgport_loop::{EventLoop, RunOutcome};
use serde::Serialize;

use crate::cmd::{parse_duration, ShareArgs};
use crate::exit::{port_error, timed_out, CliError, CliResult, FAILURE, SUCCESS};
use crate::output::{print_report, OutputFormat, Report};

/// Byte offset of the counter word in the shared region.
const COUNTER: usize = 0;

#[derive(Debug, Serialize)]
struct ShareReport {
    schema_id: &'static str,
    workers: u32,
    iterations: u32,
    expected: u64,
    total: u64,
    consistent: bool,
    elapsed_ms: u128,
}

impl Report for ShareReport {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("workers", self.workers.to_string()),
            ("iterations", self.iterations.to_string()),
            ("expected", self.expected.to_string()),
            ("total", self.total.to_string()),
            ("consistent", self.consistent.to_string()),
            ("elapsed_ms", self.elapsed_ms.to_string()),
        ]
    }
}

pub fn run(args: ShareArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let expected = validate(&args)?;

    let event_loop = EventLoop::new();
    let context = Context::new(&event_loop);
    let counter = SharedArrayBuffer::new(4);
    let finished = Rc::new(Cell::new(0u32));
    let task = Value::object([
        ("counter", Value::SharedArrayBuffer(counter.clone())),
        ("iterations", Value::from(f64::from(args.iterations))),
    ]);

    let started = Instant::now();
    let mut workers = Vec::new();
    for n in 0..args.workers {
        let worker = Worker::spawn(&context, format!("msgport-share-{n}"), |_, port| {
            install_incrementer(port)
        })
        .map_err(|err| port_error("worker spawn failed", err))?;

        let done = Rc::clone(&finished);
        let stopper = event_loop.clone();
        let total_workers = args.workers;
        worker.port().on_message(move |_| {
            done.set(done.get() + 1);
            if done.get() == total_workers {
                stopper.stop();
            }
            Ok(())
        });
        let posted = worker
            .port()
            .start()
            .and_then(|()| worker.port().post_message(&task, &[]));
        workers.push(worker);
        if let Err(err) = posted {
            shut_down(workers)?;
            return Err(port_error("dispatch failed", err));
        }
    }
    tracing::debug!(workers = args.workers, holders = counter.holders(), "dispatched counter");

    let outcome = event_loop.run_timeout(timeout);
    let elapsed = started.elapsed();
    shut_down(workers)?;
    match outcome {
        RunOutcome::Stopped => {}
        RunOutcome::TimedOut => return Err(timed_out("share", timeout)),
        RunOutcome::Idle => {
            return Err(CliError::new(
                FAILURE,
                format!(
                    "only {} of {} workers reported back",
                    finished.get(),
                    args.workers
                ),
            ))
        }
    }

    let total = counter.load_u32(COUNTER).map(u64::from).unwrap_or(0);
    let report = ShareReport {
        schema_id: "https://schemas.3leaps.dev/msgport/cli/v1/share-report.schema.json",
        workers: args.workers,
        iterations: args.iterations,
        expected,
        total,
        consistent: total == expected,
        elapsed_ms: elapsed.as_millis(),
    };
    print_report(&report, format);

    Ok(if report.consistent { SUCCESS } else { FAILURE })
}

/// Expected final count; it has to fit the 32-bit counter.
fn validate(args: &ShareArgs) -> CliResult<u64> {
    if args.workers == 0 {
        return Err(CliError::usage("--workers must be greater than zero"));
    }
    let expected = u64::from(args.workers) * u64::from(args.iterations);
    if expected > u64::from(u32::MAX) {
        return Err(CliError::usage(format!(
            "workers * iterations ({expected}) exceeds the 32-bit counter"
        )));
    }
    Ok(expected)
}

/// Worker side: bump the shared counter as often as the task says, then report.
fn install_incrementer(port: &MessagePort) {
    let reply = port.clone();
    port.on_message(move |event| {
        let task = event
            .data
            .as_object()
            .ok_or_else(|| CallbackError::new("task must be an object"))?;
        let counter = task
            .get("counter")
            .and_then(|v| v.as_shared_array_buffer().cloned())
            .ok_or_else(|| CallbackError::new("task is missing the shared counter"))?;
        let iterations = task
            .get("iterations")
            .and_then(|v| v.as_number())
            .ok_or_else(|| CallbackError::new("task is missing iterations"))?;

        for _ in 0..iterations as u64 {
            counter
                .fetch_add_u32(COUNTER, 1)
                .ok_or_else(|| CallbackError::new("counter is out of bounds"))?;
        }
        reply
            .post_message(&Value::from("done"), &[])
            .map_err(|err| CallbackError::new(err.to_string()))
    });
    if let Err(err) = port.start() {
        tracing::warn!(port = port.id(), error = %err, "share worker could not start its port");
    }
}

fn shut_down(workers: Vec<Worker>) -> CliResult<()> {
    for worker in &workers {
        worker.port().close();
    }
    for worker in workers {
        worker
            .join()
            .map_err(|err| port_error("worker join failed", err))?;
    }
    Ok(())
}
