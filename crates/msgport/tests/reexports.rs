use msgport::channel::{create_channel, Context, PortState, Value};
use msgport::event_loop::EventLoop;

#[test]
fn umbrella_exposes_both_layers() {
    let event_loop = EventLoop::new();
    let context = Context::new(&event_loop);
    let (a, b) = create_channel(&context).expect("channel should open");

    b.start().expect("port should start");
    a.post_message(&Value::from("ping"), &[])
        .expect("post should succeed");
    assert_eq!(b.state(), PortState::Active { receiving: true });

    a.close();
    event_loop.run_until_idle();
    assert!(b.is_closed());
}
