//! End-to-end scenarios driven through a single in-process `Context`,
//! exercising the same code path a real two-process ensemble would use.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshline::codec::{MessageBuilder, Packet, Value};
use meshline::context::Context;
use meshline::process::ProcessName;
use meshline::{Tap, TapMode};

fn local_process(port: u16) -> ProcessName {
    ProcessName::new(0x7f000001, 0x7f000001, port)
}

#[test]
fn basic_offer_and_ping_reaches_handler() {
    let mut ctx = Context::new(local_process(9000), "rehearsal").unwrap();
    ctx.offer_service("echo").unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();
    ctx.add_handler(
        "echo",
        &["ping"],
        Box::new(move |_addr, msg| {
            received2.lock().unwrap().push(msg.args.clone());
        }),
    )
    .unwrap();

    let msg = MessageBuilder::start("/echo/ping").add_int32(7).finish(0.0, true);
    ctx.send("/echo/ping", msg).unwrap();
    ctx.poll(Some(Duration::from_millis(10))).unwrap();

    let calls = received.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], vec![Value::Int32(7)]);
}

#[test]
fn pattern_dispatch_reaches_every_matching_instance() {
    let mut ctx = Context::new(local_process(9001), "rehearsal").unwrap();
    ctx.offer_service("synth").unwrap();

    let hits = Arc::new(Mutex::new(Vec::new()));
    for voice in ["1", "2", "3"] {
        let hits2 = hits.clone();
        let voice_owned = voice.to_string();
        ctx.add_handler(
            "synth",
            &[voice, "freq"],
            Box::new(move |_addr, _msg| {
                hits2.lock().unwrap().push(voice_owned.clone());
            }),
        )
        .unwrap();
    }

    let msg = MessageBuilder::start("/synth/*/freq")
        .add_float(440.0)
        .finish(0.0, true);
    ctx.send("/synth/*/freq", msg).unwrap();
    ctx.poll(Some(Duration::from_millis(10))).unwrap();

    let mut hits = hits.lock().unwrap().clone();
    hits.sort();
    assert_eq!(hits, vec!["1", "2", "3"]);
}

#[test]
fn tap_fan_out_delivers_to_subscriber_with_rewritten_address() {
    let mut ctx = Context::new(local_process(9002), "rehearsal").unwrap();
    ctx.offer_service("synth").unwrap();
    ctx.offer_service("recorder").unwrap();

    let recorded = Arc::new(Mutex::new(Vec::new()));
    let recorded2 = recorded.clone();
    ctx.add_handler(
        "recorder",
        &["1", "freq"],
        Box::new(move |addr, _msg| recorded2.lock().unwrap().push(addr.to_string())),
    )
    .unwrap();
    ctx.add_handler("synth", &["1", "freq"], Box::new(|_addr, _msg| {}))
        .unwrap();

    ctx.tap("synth", "recorder", TapMode::Keep).unwrap();

    let msg = MessageBuilder::start("/synth/1/freq")
        .add_float(220.0)
        .finish(0.0, true);
    ctx.send("/synth/1/freq", msg).unwrap();
    ctx.poll(Some(Duration::from_millis(10))).unwrap();

    assert_eq!(recorded.lock().unwrap().as_slice(), ["/recorder/1/freq"]);
}

#[test]
fn timed_delivery_withholds_until_due_then_fires() {
    let mut ctx = Context::new(local_process(9003), "rehearsal").unwrap();
    ctx.offer_service("metronome").unwrap();

    let ticks = Arc::new(Mutex::new(0));
    let ticks2 = ticks.clone();
    ctx.add_handler(
        "metronome",
        &["tick"],
        Box::new(move |_addr, _msg| {
            *ticks2.lock().unwrap() += 1;
        }),
    )
    .unwrap();

    let far_future = ctx.local_time() + 3600.0;
    let msg = MessageBuilder::start("/metronome/tick").finish(far_future, true);
    ctx.schedule_local(far_future, Packet::Message(msg)).unwrap();

    ctx.poll(Some(Duration::from_millis(5))).unwrap();
    assert_eq!(*ticks.lock().unwrap(), 0, "message scheduled far in the future must not fire early");
}

#[test]
fn bundle_dispatches_every_nested_message_in_order() {
    let mut ctx = Context::new(local_process(9004), "rehearsal").unwrap();
    ctx.offer_service("seq").unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    for step in ["a", "b"] {
        let order2 = order.clone();
        let step_owned = step.to_string();
        ctx.add_handler(
            "seq",
            &[step],
            Box::new(move |_addr, _msg| order2.lock().unwrap().push(step_owned.clone())),
        )
        .unwrap();
    }

    let bundle = Packet::Bundle(meshline::Bundle {
        timestamp: 0.0,
        elements: vec![
            Packet::Message(MessageBuilder::start("/seq/a").finish(0.0, true)),
            Packet::Message(MessageBuilder::start("/seq/b").finish(0.0, true)),
        ],
    });
    ctx.schedule_local(0.0, bundle).unwrap();
    ctx.poll(Some(Duration::from_millis(10))).unwrap();

    assert_eq!(order.lock().unwrap().as_slice(), ["a", "b"]);
}

#[test]
fn coercion_accepts_requested_numeric_widening_on_read() {
    use meshline::codec::MessageReader;

    let msg = MessageBuilder::start("/x").add_int32(3).finish(0.0, true);
    let mut reader = MessageReader::start(&msg);
    let widened = reader.get_next('d').unwrap();
    assert_eq!(widened, Value::Double(3.0));
}
