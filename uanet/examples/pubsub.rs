//! Publish and subscribe over one shared broker connection. Expects an
//! MQTT broker on localhost:1883.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use uanet::{
    ConnectionManager, ConnectionState, EventLoop, MqttConnectionManager, Params,
    TcpConnectionManager, TimerPolicy, Value,
};

fn main() {
    pretty_env_logger::init();

    let el = EventLoop::new();
    let tcp = TcpConnectionManager::new("tcp");
    let mqtt = MqttConnectionManager::new("mqtt");
    el.register_event_source(tcp).unwrap();
    el.register_event_source(mqtt.clone()).unwrap();
    el.start().unwrap();

    let broker = Params::new()
        .with("address", Value::String("localhost".to_owned()))
        .with("port", Value::U16(1883));

    // Subscribe side. Both topic connections share the TCP connection to
    // the broker because the broker parameters match.
    mqtt.open_connection(
        &broker.clone().with("topic", Value::String("hello/uanet".to_owned())),
        Box::new(|_cm, id, state, _params, payload| {
            if state == ConnectionState::Established && !payload.is_empty() {
                println!("{} received: {}", id, String::from_utf8_lossy(payload));
            }
        }),
    )
    .unwrap();

    // Publish side; remember the id once the connection is up
    let publisher = Arc::new(Mutex::new(None));
    let probe = publisher.clone();
    mqtt.open_connection(
        &broker
            .with("topic", Value::String("hello/uanet".to_owned()))
            .with("subscribe", Value::Bool(false)),
        Box::new(move |_cm, id, state, _params, _payload| {
            if state == ConnectionState::Established {
                *probe.lock().unwrap() = Some(id);
            }
        }),
    )
    .unwrap();

    // Publish a message every second
    let mqtt_timer = mqtt.clone();
    let mut counter = 0u32;
    el.add_cyclic_callback(
        move || {
            if let Some(id) = *publisher.lock().unwrap() {
                counter += 1;
                let payload = format!("hello {}", counter);
                let mut buf = mqtt_timer.alloc_network_buffer(id, payload.len()).unwrap();
                buf.extend_from_slice(payload.as_bytes());
                let _ = mqtt_timer.send_with_connection(id, buf);
            }
        },
        Duration::from_secs(1),
        None,
        TimerPolicy::CurrentTime,
    )
    .unwrap();

    loop {
        el.run(Duration::from_millis(100)).unwrap();
    }
}
