use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uanet::{
    ConnectionId, ConnectionManager, ConnectionState, Error, EventLoop, Params,
    TcpConnectionManager, Value,
};

fn setup() -> (Arc<EventLoop>, Arc<TcpConnectionManager>) {
    let el = EventLoop::new();
    let tcp = TcpConnectionManager::new("tcp");
    el.register_event_source(tcp.clone()).unwrap();
    el.start().unwrap();
    (el, tcp)
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
fn opening_a_connection_on_a_stopped_manager_fails() {
    let el = EventLoop::new();
    let tcp = TcpConnectionManager::new("tcp");
    el.register_event_source(tcp.clone()).unwrap();

    let params = Params::new().with("listen-port", Value::U16(0));
    match tcp.open_connection(&params, Box::new(|_, _, _, _, _| {})) {
        Err(Error::BadState(_)) => (),
        v => panic!("Unexpected = {:?}", v),
    }
}

#[test]
fn listen_on_port_zero_reports_the_actual_port() {
    let (el, tcp) = setup();

    let port = Arc::new(Mutex::new(0u16));
    let probe = port.clone();
    tcp.open_connection(
        &Params::new()
            .with("listen-port", Value::U16(0))
            .with("listen-hostnames", Value::StringArray(vec!["127.0.0.1".to_owned()])),
        Box::new(move |_cm, _id, state, params, _payload| {
            if state == ConnectionState::Established {
                if let Some(p) = params.get_u16("listen-port") {
                    *probe.lock().unwrap() = p;
                }
            }
        }),
    )
    .unwrap();

    // The listen notification is synchronous
    let port = *port.lock().unwrap();
    assert!(port != 0);

    el.stop();
    assert!(run_until(&el, Duration::from_secs(1), || {
        el.state() == uanet::EventLoopState::Stopped
    }));
}

#[test]
fn accept_and_echo_on_the_loopback_interface() {
    let (el, tcp) = setup();

    // Accept side: send [1, 2, 3] to every connection accepted on the
    // listen socket
    let listen_port = Arc::new(Mutex::new(0u16));
    let probe = listen_port.clone();
    tcp.open_connection(
        &Params::new()
            .with("listen-port", Value::U16(0))
            .with("listen-hostnames", Value::StringArray(vec!["127.0.0.1".to_owned()])),
        Box::new(move |cm, id, state, params, _payload| {
            assert_eq!(state, ConnectionState::Established);
            if let Some(p) = params.get_u16("listen-port") {
                *probe.lock().unwrap() = p;
            }
            if params.get_str("remote-hostname").is_some() {
                let mut buf = cm.alloc_network_buffer(id, 3).unwrap();
                buf.extend_from_slice(&[1, 2, 3]);
                cm.send_with_connection(id, buf).unwrap();
            }
        }),
    )
    .unwrap();
    let port = *listen_port.lock().unwrap();

    // Active side: collect whatever arrives
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    tcp.open_connection(
        &Params::new()
            .with("hostname", Value::String("127.0.0.1".to_owned()))
            .with("port", Value::U16(port)),
        Box::new(move |_cm, _id, state, _params, payload| {
            if state == ConnectionState::Established {
                sink.lock().unwrap().extend_from_slice(payload);
            }
        }),
    )
    .unwrap();

    // The reads may arrive in pieces; their concatenation is the message
    assert!(run_until(&el, Duration::from_secs(2), || {
        received.lock().unwrap().as_slice() == [1, 2, 3]
    }));
}

#[test]
fn closing_a_connection_is_delayed_and_observable() {
    let (el, tcp) = setup();

    let listen_port = Arc::new(Mutex::new(0u16));
    let probe = listen_port.clone();
    tcp.open_connection(
        &Params::new()
            .with("listen-port", Value::U16(0))
            .with("listen-hostnames", Value::StringArray(vec!["127.0.0.1".to_owned()])),
        Box::new(move |_cm, _id, _state, params, _payload| {
            if let Some(p) = params.get_u16("listen-port") {
                *probe.lock().unwrap() = p;
            }
        }),
    )
    .unwrap();
    let port = *listen_port.lock().unwrap();

    let client_id: Arc<Mutex<Option<ConnectionId>>> = Arc::new(Mutex::new(None));
    let closing_seen = Arc::new(Mutex::new(false));
    let id_probe = client_id.clone();
    let closing_probe = closing_seen.clone();
    tcp.open_connection(
        &Params::new()
            .with("hostname", Value::String("127.0.0.1".to_owned()))
            .with("port", Value::U16(port)),
        Box::new(move |_cm, id, state, _params, _payload| match state {
            ConnectionState::Opening | ConnectionState::Established => {
                *id_probe.lock().unwrap() = Some(id);
            }
            ConnectionState::Closing => {
                *closing_probe.lock().unwrap() = true;
            }
            _ => {}
        }),
    )
    .unwrap();

    let id = client_id.lock().unwrap().expect("the open is signaled synchronously");

    // Let the connect complete, then close
    for _ in 0..5 {
        el.run(Duration::from_millis(20)).unwrap();
    }
    tcp.close_connection(id).unwrap();

    // Within two iterations the Closing callback has fired and the
    // connection is gone
    el.run(Duration::from_millis(20)).unwrap();
    el.run(Duration::from_millis(20)).unwrap();
    assert!(*closing_seen.lock().unwrap());
    match tcp.close_connection(id) {
        Err(Error::NotFound) => (),
        v => panic!("Unexpected = {:?}", v),
    }
}

#[test]
fn stopping_the_manager_closes_every_connection() {
    let (el, tcp) = setup();

    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    tcp.open_connection(
        &Params::new()
            .with("listen-port", Value::U16(0))
            .with("listen-hostnames", Value::StringArray(vec!["127.0.0.1".to_owned()])),
        Box::new(move |_cm, _id, state, _params, _payload| {
            sink.lock().unwrap().push(state);
        }),
    )
    .unwrap();

    el.stop();
    assert!(run_until(&el, Duration::from_secs(1), || {
        el.state() == uanet::EventLoopState::Stopped
    }));
    assert!(states.lock().unwrap().contains(&ConnectionState::Closing));
}
