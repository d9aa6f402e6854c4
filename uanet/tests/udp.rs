use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uanet::{
    ConnectionId, ConnectionManager, ConnectionState, EventLoop, Params, UdpConnectionManager,
    Value,
};

fn setup() -> (Arc<EventLoop>, Arc<UdpConnectionManager>) {
    let el = EventLoop::new();
    let udp = UdpConnectionManager::new("udp");
    el.register_event_source(udp.clone()).unwrap();
    el.start().unwrap();
    (el, udp)
}

fn run_until(el: &Arc<EventLoop>, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        el.run(Duration::from_millis(20)).unwrap();
        if done() {
            return true;
        }
    }
    false
}

#[test]
fn send_connections_defer_their_open_notification() {
    let (el, udp) = setup();

    // A bound receive socket on an OS-picked port
    let listen_port = Arc::new(Mutex::new(0u16));
    let probe = listen_port.clone();
    udp.open_connection(
        &Params::new()
            .with("listen-port", Value::U16(0))
            .with("listen-hostnames", Value::StringArray(vec!["127.0.0.1".to_owned()])),
        Box::new(move |_cm, _id, state, params, _payload| {
            assert_eq!(state, ConnectionState::Established);
            if let Some(p) = params.get_u16("listen-port") {
                *probe.lock().unwrap() = p;
            }
        }),
    )
    .unwrap();
    let port = *listen_port.lock().unwrap();
    assert!(port != 0);

    // The send connection signals Established only from inside the loop
    let established = Arc::new(Mutex::new(false));
    let est_probe = established.clone();
    udp.open_connection(
        &Params::new()
            .with("hostname", Value::String("127.0.0.1".to_owned()))
            .with("port", Value::U16(port)),
        Box::new(move |_cm, _id, state, _params, _payload| {
            if state == ConnectionState::Established {
                *est_probe.lock().unwrap() = true;
            }
        }),
    )
    .unwrap();
    assert!(!*established.lock().unwrap());

    assert!(run_until(&el, Duration::from_secs(1), || *established.lock().unwrap()));
}

#[test]
fn datagrams_arrive_on_the_bound_socket() {
    let (el, udp) = setup();

    let listen_port = Arc::new(Mutex::new(0u16));
    let received = Arc::new(Mutex::new(Vec::new()));
    let probe = listen_port.clone();
    let sink = received.clone();
    udp.open_connection(
        &Params::new()
            .with("listen-port", Value::U16(0))
            .with("listen-hostnames", Value::StringArray(vec!["127.0.0.1".to_owned()])),
        Box::new(move |_cm, _id, _state, params, payload| {
            if let Some(p) = params.get_u16("listen-port") {
                *probe.lock().unwrap() = p;
            }
            sink.lock().unwrap().extend_from_slice(payload);
        }),
    )
    .unwrap();
    let port = *listen_port.lock().unwrap();

    let sender: Arc<Mutex<Option<ConnectionId>>> = Arc::new(Mutex::new(None));
    let sender_probe = sender.clone();
    udp.open_connection(
        &Params::new()
            .with("hostname", Value::String("127.0.0.1".to_owned()))
            .with("port", Value::U16(port)),
        Box::new(move |cm, id, state, _params, _payload| {
            if state == ConnectionState::Established && sender_probe.lock().unwrap().is_none() {
                *sender_probe.lock().unwrap() = Some(id);
                let mut buf = cm.alloc_network_buffer(id, 4).unwrap();
                buf.extend_from_slice(&[9, 8, 7, 6]);
                cm.send_with_connection(id, buf).unwrap();
            }
        }),
    )
    .unwrap();

    assert!(run_until(&el, Duration::from_secs(2), || {
        received.lock().unwrap().as_slice() == [9, 8, 7, 6]
    }));
}
