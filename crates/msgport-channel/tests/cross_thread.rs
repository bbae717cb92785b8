use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use msgport_channel::{
    create_channel, ArrayBuffer, CallbackError, Context, MessagePort, SharedArrayBuffer, Value,
    Worker,
};
use msgport_loop::{EventLoop, RunOutcome};

const TIMEOUT: Duration = Duration::from_secs(5);

fn reply_error(err: msgport_channel::PortError) -> CallbackError {
    CallbackError::new(err.to_string())
}

/// Collect every delivered value and stop the loop after `expected` of them.
fn collect(port: &MessagePort, event_loop: &EventLoop, expected: usize) -> Rc<RefCell<Vec<Value>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let event_loop = event_loop.clone();
    port.on_message(move |event| {
        sink.borrow_mut().push(event.data);
        if sink.borrow().len() == expected {
            event_loop.stop();
        }
        Ok(())
    });
    port.start().expect("port should start");
    seen
}

fn spawn_echo(context: &Context) -> Worker {
    Worker::spawn(context, "echo", |_, port| {
        let reply = port.clone();
        port.on_message(move |event| reply.post_message(&event.data, &[]).map_err(reply_error));
        port.start().expect("worker port should start");
    })
    .expect("worker should spawn")
}

#[test]
fn echo_preserves_order() {
    let event_loop = EventLoop::new();
    let context = Context::new(&event_loop);
    let worker = spawn_echo(&context);
    let seen = collect(worker.port(), &event_loop, 50);

    for n in 0..50 {
        let value = Value::object([("n", Value::from(n)), ("tag", "echo".into())]);
        worker.port().post_message(&value, &[]).unwrap();
    }

    assert_eq!(event_loop.run_timeout(TIMEOUT), RunOutcome::Stopped);
    let seen = seen.borrow();
    for (n, value) in seen.iter().enumerate() {
        let object = value.as_object().expect("echo should return an object");
        assert_eq!(object.get("n"), Some(Value::from(n as i32)));
    }

    worker.port().close();
    worker.join().expect("worker should exit");
}

#[test]
fn transferred_buffer_moves_between_threads() {
    let event_loop = EventLoop::new();
    let context = Context::new(&event_loop);
    let worker = Worker::spawn(&context, "bounce", |_, port| {
        let reply = port.clone();
        port.on_message(move |event| {
            let buf = event
                .data
                .as_array_buffer()
                .cloned()
                .ok_or_else(|| CallbackError::new("expected a buffer"))?;
            buf.with_bytes_mut(|bytes| bytes.iter_mut().for_each(|b| *b += 1));
            let value = Value::ArrayBuffer(buf);
            reply
                .post_message(&value, std::slice::from_ref(&value))
                .map_err(reply_error)
        });
        port.start().expect("worker port should start");
    })
    .unwrap();
    let seen = collect(worker.port(), &event_loop, 1);

    let buf = ArrayBuffer::from_vec(vec![1, 2, 3]);
    let value = Value::ArrayBuffer(buf.clone());
    worker.port().post_message(&value, &[value.clone()]).unwrap();
    assert_eq!(buf.len(), 0, "sender's buffer is neutered immediately");
    assert!(buf.is_detached());

    assert_eq!(event_loop.run_timeout(TIMEOUT), RunOutcome::Stopped);
    let returned = seen.borrow()[0].as_array_buffer().unwrap().to_vec();
    assert_eq!(returned, vec![2, 3, 4]);

    worker.port().close();
    worker.join().unwrap();
}

#[test]
fn shared_buffer_aliases_across_messages_and_threads() {
    let event_loop = EventLoop::new();
    let context = Context::new(&event_loop);
    let worker = Worker::spawn(&context, "alias", |_, port| {
        let reply = port.clone();
        let handles = RefCell::new(Vec::<SharedArrayBuffer>::new());
        port.on_message(move |event| {
            let shared = event
                .data
                .as_shared_array_buffer()
                .cloned()
                .ok_or_else(|| CallbackError::new("expected a shared buffer"))?;
            let mut handles = handles.borrow_mut();
            handles.push(shared);
            if handles.len() < 2 {
                return Ok(());
            }
            handles[0].store(0, 42);
            let result = Value::object([
                ("seen", Value::from(i32::from(handles[1].load(0).unwrap_or(0)))),
                ("same", Value::Bool(handles[0].same_memory(&handles[1]))),
            ]);
            reply.post_message(&result, &[]).map_err(reply_error)
        });
        port.start().expect("worker port should start");
    })
    .unwrap();
    let seen = collect(worker.port(), &event_loop, 1);

    let shared = SharedArrayBuffer::new(16);
    for _ in 0..2 {
        worker
            .port()
            .post_message(&Value::SharedArrayBuffer(shared.clone()), &[])
            .unwrap();
    }

    assert_eq!(event_loop.run_timeout(TIMEOUT), RunOutcome::Stopped);
    let reply = seen.borrow()[0].as_object().unwrap().clone();
    assert_eq!(reply.get("seen"), Some(Value::from(42)));
    assert_eq!(reply.get("same"), Some(Value::Bool(true)));
    assert_eq!(shared.load(0), Some(42), "writes are visible to the sender");

    worker.port().close();
    worker.join().unwrap();
}

#[test]
fn transferred_port_drains_messages_queued_in_transit() {
    let event_loop = EventLoop::new();
    let context = Context::new(&event_loop);
    let worker = Worker::spawn(&context, "adopt", |_, port| {
        port.on_message(|event| {
            let moved = event
                .ports
                .first()
                .cloned()
                .ok_or_else(|| CallbackError::new("expected a port"))?;
            let echo = moved.clone();
            moved.on_message(move |event| {
                echo.post_message(&event.data, &[]).map_err(reply_error)
            });
            moved.start().map_err(reply_error)
        });
        port.start().expect("worker port should start");
    })
    .unwrap();

    let (near, far) = create_channel(&context).unwrap();
    let seen = collect(&near, &event_loop, 2);
    near.post_message(&Value::from("queued before transfer"), &[])
        .unwrap();

    let far_value = Value::Port(far.clone());
    worker
        .port()
        .post_message(&far_value, &[far_value.clone()])
        .unwrap();
    assert!(far.is_closed());
    near.post_message(&Value::from("sent after transfer"), &[])
        .unwrap();

    assert_eq!(event_loop.run_timeout(TIMEOUT), RunOutcome::Stopped);
    assert_eq!(
        *seen.borrow(),
        vec![
            Value::from("queued before transfer"),
            Value::from("sent after transfer"),
        ]
    );

    near.close();
    worker.port().close();
    worker.join().unwrap();
}

#[test]
fn closing_main_port_lets_worker_finish() {
    let event_loop = EventLoop::new();
    let context = Context::new(&event_loop);
    let worker = spawn_echo(&context);

    worker.port().post_message(&Value::from(1), &[]).unwrap();
    worker.port().close();
    worker.join().expect("worker should exit once its peer closed");
}

#[test]
fn stop_event_loop_from_worker_side() {
    let event_loop = EventLoop::new();
    let context = Context::new(&event_loop);
    let worker = Worker::spawn(&context, "stopper", |_, port| {
        port.start().expect("worker port should start");
        port.stop_event_loop().expect("stop request should succeed");
    })
    .unwrap();

    // The worker's loop stops on its first drain even though its port is open.
    worker.join().unwrap();
    assert_eq!(event_loop.run_timeout(TIMEOUT), RunOutcome::Idle);
}
