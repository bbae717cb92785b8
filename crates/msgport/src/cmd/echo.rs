use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use msgport_channel::{ArrayBuffer, CallbackError, Context, MessagePort, Value, Worker};
use msgport_loop::{EventLoop, RunOutcome};
use serde::Serialize;

use crate::cmd::{parse_duration, EchoArgs};
use crate::exit::{port_error, timed_out, CliError, CliResult, DATA_INVALID, FAILURE, SUCCESS};
use crate::output::{print_report, OutputFormat, Report};

#[derive(Debug, Default)]
struct Tally {
    received: u32,
    bytes: u64,
    out_of_order: u32,
    damaged: u32,
    last_body: Option<Value>,
}

#[derive(Debug, Serialize)]
struct EchoReport {
    schema_id: &'static str,
    sent: u32,
    received: u32,
    bytes_received: u64,
    buffer_size: usize,
    transfer: bool,
    in_order: bool,
    body_intact: bool,
    body: serde_json::Value,
    elapsed_ms: u128,
}

impl Report for EchoReport {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("sent", self.sent.to_string()),
            ("received", self.received.to_string()),
            ("bytes_received", self.bytes_received.to_string()),
            ("buffer_size", self.buffer_size.to_string()),
            ("transfer", self.transfer.to_string()),
            ("in_order", self.in_order.to_string()),
            ("body_intact", self.body_intact.to_string()),
            ("body", self.body.to_string()),
            ("elapsed_ms", self.elapsed_ms.to_string()),
        ]
    }
}

pub fn run(args: EchoArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let body = parse_body(args.json.as_deref())?;
    let event_loop = EventLoop::new();
    let context = Context::new(&event_loop);

    let transfer = args.transfer;
    let worker = Worker::spawn(&context, "msgport-echo", move |_, port| {
        install_echo(port, transfer)
    })
    .map_err(|err| port_error("worker spawn failed", err))?;

    let tally = Rc::new(RefCell::new(Tally::default()));
    let sink = Rc::clone(&tally);
    let stopper = event_loop.clone();
    let expected = args.count;
    let sent_body = body.clone();
    worker.port().on_message(move |event| {
        let mut tally = sink.borrow_mut();
        let reply = event.data.as_object();
        let seq = reply
            .and_then(|reply| reply.get("seq"))
            .and_then(|seq| seq.as_number());
        if seq != Some(f64::from(tally.received)) {
            tally.out_of_order += 1;
        }
        let echoed = reply.and_then(|reply| reply.get("body"));
        if echoed.as_ref() != Some(&sent_body) {
            tally.damaged += 1;
        }
        tally.last_body = echoed;
        tally.received += 1;
        tally.bytes += payload_len(&event.data) as u64;
        if tally.received == expected {
            stopper.stop();
        }
        Ok(())
    });
    worker
        .port()
        .start()
        .map_err(|err| port_error("port start failed", err))?;

    let started = Instant::now();
    for seq in 0..args.count {
        let payload = Value::ArrayBuffer(ArrayBuffer::new(args.buffer_size));
        let message = Value::object([
            ("seq", Value::from(f64::from(seq))),
            ("body", body.clone()),
            ("payload", payload.clone()),
        ]);
        let transfer_list = if args.transfer { vec![payload] } else { Vec::new() };
        worker
            .port()
            .post_message(&message, &transfer_list)
            .map_err(|err| port_error("post failed", err))?;
    }
    tracing::debug!(count = args.count, transfer = args.transfer, "posted echo messages");

    let outcome = if args.count == 0 {
        RunOutcome::Stopped
    } else {
        event_loop.run_timeout(timeout)
    };
    let elapsed = started.elapsed();

    shut_down(worker)?;
    match outcome {
        RunOutcome::Stopped => {}
        RunOutcome::TimedOut => return Err(timed_out("echo", timeout)),
        RunOutcome::Idle => {
            return Err(CliError::new(
                FAILURE,
                "echo worker closed its port before replying",
            ))
        }
    }

    let tally = tally.borrow();
    let report = EchoReport {
        schema_id: "https://schemas.3leaps.dev/msgport/cli/v1/echo-report.schema.json",
        sent: args.count,
        received: tally.received,
        bytes_received: tally.bytes,
        buffer_size: args.buffer_size,
        transfer: args.transfer,
        in_order: tally.out_of_order == 0,
        body_intact: tally.damaged == 0,
        body: tally
            .last_body
            .as_ref()
            .map_or(serde_json::Value::Null, Value::to_json),
        elapsed_ms: elapsed.as_millis(),
    };
    print_report(&report, format);

    Ok(if report.in_order && report.body_intact {
        SUCCESS
    } else {
        FAILURE
    })
}

/// Worker side: post every message straight back, moving its buffer when asked.
fn install_echo(port: &MessagePort, transfer: bool) {
    let reply = port.clone();
    port.on_message(move |event| {
        let payload = event.data.as_object().and_then(|m| m.get("payload"));
        let transfer_list = match payload {
            Some(payload @ Value::ArrayBuffer(_)) if transfer => vec![payload],
            _ => Vec::new(),
        };
        reply
            .post_message(&event.data, &transfer_list)
            .map_err(|err| CallbackError::new(err.to_string()))
    });
    if let Err(err) = port.start() {
        tracing::warn!(port = port.id(), error = %err, "echo worker could not start its port");
    }
}

/// Message body from `--json`; `null` when absent.
fn parse_body(json: Option<&str>) -> CliResult<Value> {
    let Some(json) = json else {
        return Ok(Value::Null);
    };
    let document: serde_json::Value = serde_json::from_str(json)
        .map_err(|err| CliError::new(DATA_INVALID, format!("invalid --json body: {err}")))?;
    Ok(Value::from_json(&document))
}

fn payload_len(data: &Value) -> usize {
    data.as_object()
        .and_then(|message| message.get("payload"))
        .and_then(|payload| payload.as_array_buffer().map(ArrayBuffer::len))
        .unwrap_or(0)
}

fn shut_down(worker: Worker) -> CliResult<()> {
    worker.port().close();
    worker
        .terminate()
        .map_err(|err| port_error("worker terminate failed", err))?;
    worker
        .join()
        .map_err(|err| port_error("worker join failed", err))
}
