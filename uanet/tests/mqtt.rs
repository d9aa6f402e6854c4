use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use crossbeam_channel::{unbounded, Receiver, Sender};
use mqttbytes::{
    mqtt_read, ConnAck, ConnectReturnCode, Packet, QoS, SubAck, SubscribeReturnCodes, UnsubAck,
};
use uanet::{
    ConnectionId, ConnectionManager, ConnectionState, Error, EventLoop, MqttConnectionManager,
    Params, TcpConnectionManager, Value,
};

#[derive(Debug, Clone, PartialEq)]
enum BrokerEvent {
    Connected,
    Subscribed(String),
    Unsubscribed(String),
    Published(String, Vec<u8>),
    Pinged,
    Disconnected,
}

/// A scripted broker: accepts connections, answers the handshake packets
/// and echoes every publish back to the client it came from.
fn broker() -> (u16, Receiver<BrokerEvent>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = unbounded();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };
            let tx = tx.clone();
            thread::spawn(move || serve(stream, tx));
        }
    });

    (port, rx)
}

fn serve(mut stream: TcpStream, events: Sender<BrokerEvent>) {
    stream.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    let mut rx = BytesMut::new();
    let mut buf = [0u8; 4096];

    loop {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => rx.extend_from_slice(&buf[..n]),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => return,
        }

        loop {
            let packet = match mqtt_read(&mut rx, 1 << 20) {
                Ok(packet) => packet,
                Err(mqttbytes::Error::InsufficientBytes(_)) => break,
                Err(_) => return,
            };
            if !handle(&mut stream, packet, &events) {
                return;
            }
        }
    }
}

fn handle(stream: &mut TcpStream, packet: Packet, events: &Sender<BrokerEvent>) -> bool {
    let mut out = BytesMut::new();
    match packet {
        Packet::Connect(_) => {
            ConnAck::new(ConnectReturnCode::Accepted, false).write(&mut out).unwrap();
            let _ = events.send(BrokerEvent::Connected);
        }
        Packet::Subscribe(subscribe) => {
            let codes = vec![SubscribeReturnCodes::Success(QoS::AtMostOnce); subscribe.topics.len()];
            SubAck::new(subscribe.pkid, codes).write(&mut out).unwrap();
            for topic in subscribe.topics {
                let _ = events.send(BrokerEvent::Subscribed(topic.topic_path));
            }
        }
        Packet::Unsubscribe(unsubscribe) => {
            UnsubAck::new(unsubscribe.pkid).write(&mut out).unwrap();
            for topic in unsubscribe.topics {
                let _ = events.send(BrokerEvent::Unsubscribed(topic));
            }
        }
        Packet::Publish(publish) => {
            let _ = events.send(BrokerEvent::Published(
                publish.topic.clone(),
                publish.payload.to_vec(),
            ));
            // Echo to the same client; good enough for a loopback fixture
            publish.write(&mut out).unwrap();
        }
        Packet::PingReq => {
            out.extend_from_slice(&[0xD0, 0x00]);
            let _ = events.send(BrokerEvent::Pinged);
        }
        Packet::Disconnect => {
            let _ = events.send(BrokerEvent::Disconnected);
            return false;
        }
        _ => {}
    }

    if !out.is_empty() && stream.write_all(&out).is_err() {
        return false;
    }
    true
}

fn setup() -> (Arc<EventLoop>, Arc<MqttConnectionManager>) {
    let el = EventLoop::new();
    let tcp = TcpConnectionManager::new("tcp");
    let mqtt = MqttConnectionManager::new("mqtt");
    el.register_event_source(tcp).unwrap();
    el.register_event_source(mqtt.clone()).unwrap();
    el.start().unwrap();
    (el, mqtt)
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

fn broker_params(port: u16) -> Params {
    Params::new()
        .with("address", Value::String("127.0.0.1".to_owned()))
        .with("port", Value::U16(port))
}

#[test]
fn starting_without_a_tcp_manager_fails() {
    let el = EventLoop::new();
    let mqtt = MqttConnectionManager::new("mqtt");
    match el.register_event_source(mqtt).and_then(|_| el.start()) {
        Err(Error::BadState(_)) => (),
        v => panic!("Unexpected = {:?}", v),
    }
}

#[test]
fn topic_connections_share_one_broker_connection() {
    let (port, events) = broker();
    let (el, mqtt) = setup();

    mqtt.open_connection(
        &broker_params(port).with("topic", Value::String("t1".to_owned())),
        Box::new(|_, _, _, _, _| {}),
    )
    .unwrap();

    let publisher_up = Arc::new(Mutex::new(false));
    let probe = publisher_up.clone();
    mqtt.open_connection(
        &broker_params(port)
            .with("topic", Value::String("t2".to_owned()))
            .with("subscribe", Value::Bool(false)),
        Box::new(move |_cm, _id, state, _params, _payload| {
            if state == ConnectionState::Established {
                *probe.lock().unwrap() = true;
            }
        }),
    )
    .unwrap();

    assert!(run_until(&el, Duration::from_secs(2), || *publisher_up.lock().unwrap()));

    let seen: Vec<BrokerEvent> = events.try_iter().collect();
    let connects = seen.iter().filter(|e| **e == BrokerEvent::Connected).count();
    assert_eq!(connects, 1, "events = {:?}", seen);
    assert!(seen.contains(&BrokerEvent::Subscribed("t1".to_owned())));
}

#[test]
fn a_publish_reaches_the_subscriber_after_a_single_established() {
    let (port, _events) = broker();
    let (el, mqtt) = setup();

    // (state, payload) sequence observed by the subscriber
    let observed: Arc<Mutex<Vec<(ConnectionState, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    mqtt.open_connection(
        &broker_params(port).with("topic", Value::String("t1".to_owned())),
        Box::new(move |_cm, _id, state, _params, payload| {
            sink.lock().unwrap().push((state, payload.to_vec()));
        }),
    )
    .unwrap();

    let publisher: Arc<Mutex<Option<ConnectionId>>> = Arc::new(Mutex::new(None));
    let probe = publisher.clone();
    mqtt.open_connection(
        &broker_params(port)
            .with("topic", Value::String("t1".to_owned()))
            .with("subscribe", Value::Bool(false)),
        Box::new(move |_cm, id, state, _params, _payload| {
            if state == ConnectionState::Established {
                *probe.lock().unwrap() = Some(id);
            }
        }),
    )
    .unwrap();

    assert!(run_until(&el, Duration::from_secs(2), || publisher.lock().unwrap().is_some()));
    let publisher_id = publisher.lock().unwrap().unwrap();

    let mut buf = mqtt.alloc_network_buffer(publisher_id, 4).unwrap();
    buf.extend_from_slice(b"ping");
    mqtt.send_with_connection(publisher_id, buf).unwrap();

    assert!(run_until(&el, Duration::from_secs(2), || {
        observed.lock().unwrap().iter().any(|(_, payload)| payload == b"ping")
    }));

    // The subscription signals Established exactly once, right before the
    // first message
    let observed = observed.lock().unwrap();
    let established: Vec<&(ConnectionState, Vec<u8>)> = observed
        .iter()
        .filter(|(state, _)| *state == ConnectionState::Established)
        .collect();
    assert_eq!(established.len(), 2, "observed = {:?}", observed);
    assert_eq!(established[0].1, b"");
    assert_eq!(established[1].1, b"ping");
}

#[test]
fn keep_alive_pings_are_sent_without_traffic() {
    let (port, events) = broker();
    let (el, mqtt) = setup();

    mqtt.open_connection(
        &broker_params(port)
            .with("keep-alive", Value::U16(2))
            .with("topic", Value::String("t1".to_owned())),
        Box::new(|_, _, _, _, _| {}),
    )
    .unwrap();

    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        el.run(Duration::from_millis(50)).unwrap();
    }

    let seen: Vec<BrokerEvent> = events.try_iter().collect();
    let pings = seen.iter().filter(|e| **e == BrokerEvent::Pinged).count();
    let disconnects = seen.iter().filter(|e| **e == BrokerEvent::Disconnected).count();
    assert!(pings >= 1, "events = {:?}", seen);
    assert_eq!(disconnects, 0, "events = {:?}", seen);
}

#[test]
fn closing_the_last_topic_disconnects_the_broker() {
    let (port, events) = broker();
    let (el, mqtt) = setup();

    let subscriber: Arc<Mutex<Option<ConnectionId>>> = Arc::new(Mutex::new(None));
    let closing = Arc::new(Mutex::new(false));
    let received = Arc::new(Mutex::new(false));
    let id_probe = subscriber.clone();
    let closing_probe = closing.clone();
    let received_probe = received.clone();
    mqtt.open_connection(
        &broker_params(port).with("topic", Value::String("t1".to_owned())),
        Box::new(move |_cm, id, state, _params, payload| {
            *id_probe.lock().unwrap() = Some(id);
            if state == ConnectionState::Established && !payload.is_empty() {
                *received_probe.lock().unwrap() = true;
            }
            if state == ConnectionState::Closing {
                *closing_probe.lock().unwrap() = true;
            }
        }),
    )
    .unwrap();

    let publisher: Arc<Mutex<Option<ConnectionId>>> = Arc::new(Mutex::new(None));
    let probe = publisher.clone();
    mqtt.open_connection(
        &broker_params(port)
            .with("topic", Value::String("t1".to_owned()))
            .with("subscribe", Value::Bool(false)),
        Box::new(move |_cm, id, state, _params, _payload| {
            if state == ConnectionState::Established {
                *probe.lock().unwrap() = Some(id);
            }
        }),
    )
    .unwrap();

    // Publish once so the subscription is established end to end
    assert!(run_until(&el, Duration::from_secs(2), || publisher.lock().unwrap().is_some()));
    let publisher_id = publisher.lock().unwrap().unwrap();
    let mut buf = mqtt.alloc_network_buffer(publisher_id, 2).unwrap();
    buf.extend_from_slice(b"up");
    mqtt.send_with_connection(publisher_id, buf).unwrap();
    assert!(run_until(&el, Duration::from_secs(2), || *received.lock().unwrap()));

    // Closing the subscriber sends UNSUBSCRIBE; the publisher keeps the
    // broker connection alive
    let subscriber_id = subscriber.lock().unwrap().unwrap();
    mqtt.close_connection(subscriber_id).unwrap();
    assert!(run_until(&el, Duration::from_secs(2), || *closing.lock().unwrap()));

    // Closing the last topic shuts the broker connection down with an
    // orderly DISCONNECT
    mqtt.close_connection(publisher_id).unwrap();
    let mut seen = Vec::new();
    assert!(run_until(&el, Duration::from_secs(2), || {
        seen.extend(events.try_iter());
        seen.contains(&BrokerEvent::Disconnected)
    }));
    assert!(seen.contains(&BrokerEvent::Unsubscribed("t1".to_owned())), "events = {:?}", seen);
}
