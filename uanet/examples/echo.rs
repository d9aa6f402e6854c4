//! A TCP echo pair on the loopback interface. One event loop drives the
//! listen socket, the accepted connection and the active connection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use uanet::{ConnectionManager, ConnectionState, EventLoop, Params, TcpConnectionManager, Value};

fn main() {
    pretty_env_logger::init();

    let el = EventLoop::new();
    let tcp = TcpConnectionManager::new("tcp");
    el.register_event_source(tcp.clone()).unwrap();
    el.start().unwrap();

    // Listen on an OS-picked port; echo whatever the accepted connections
    // receive
    let listen_port = Arc::new(Mutex::new(0u16));
    let port_probe = listen_port.clone();
    tcp.open_connection(
        &Params::new().with("listen-port", Value::U16(0)),
        Box::new(move |cm, id, state, params, payload| {
            if let Some(port) = params.get_u16("listen-port") {
                *port_probe.lock().unwrap() = port;
            }
            if state == ConnectionState::Established && !payload.is_empty() {
                let mut buf = cm.alloc_network_buffer(id, payload.len()).unwrap();
                buf.extend_from_slice(payload);
                cm.send_with_connection(id, buf).unwrap();
            }
        }),
    )
    .unwrap();

    let port = *listen_port.lock().unwrap();
    println!("echo server on 127.0.0.1:{}", port);

    tcp.open_connection(
        &Params::new()
            .with("hostname", Value::String("127.0.0.1".to_owned()))
            .with("port", Value::U16(port)),
        Box::new(move |cm, id, state, _params, payload| match state {
            ConnectionState::Established if payload.is_empty() => {
                let mut buf = cm.alloc_network_buffer(id, 16).unwrap();
                buf.extend_from_slice(b"hello event loop");
                cm.send_with_connection(id, buf).unwrap();
            }
            ConnectionState::Established => {
                println!("echoed back: {}", String::from_utf8_lossy(payload));
            }
            state => println!("connection {} is now {:?}", id, state),
        }),
    )
    .unwrap();

    for _ in 0..20 {
        el.run(Duration::from_millis(50)).unwrap();
    }
}
