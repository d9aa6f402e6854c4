//! The MQTT connection manager.
//!
//! Externally visible connections are bound to a single topic and
//! direction. Internally, topic connections with the same broker
//! fingerprint (address, port, keep-alive, username, password) share one
//! stateful connection to the broker, multiplexed over the first TCP
//! connection manager found in the event loop. The manager performs the
//! CONNECT/SUBSCRIBE/PUBLISH framing itself via the `mqttbytes` codec and
//! keeps the session alive with a cyclic PINGREQ timer per broker.
//!
//! The framer does not surface SUBACK. The first message received on a
//! subscribed topic is therefore the only observable sign that the
//! subscription is live, and it is preceded by the one-time `Established`
//! notification for that topic connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, info, warn};
use mqttbytes::{Connect, ConnectReturnCode, Packet, Publish, QoS, Subscribe, Unsubscribe};

use crate::error::Error;
use crate::eventloop::EventLoop;
use crate::params::{Params, Value};
use crate::source::{
    ConnectionCallback, ConnectionId, ConnectionManager, ConnectionState, EventSource,
    EventSourceState, SourceId,
};
use crate::timer::{now_monotonic, TimerId, TimerPolicy};

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_KEEP_ALIVE: u16 = 400;
/// Keep-alive announced in CONNECT; the cyclic ping timer runs at the
/// configured per-broker rate
const FRAMER_KEEP_ALIVE: u16 = 400;
const MAX_PACKET_SIZE: usize = 1 << 20;
const INITIAL_BUFFER_SIZE: usize = 1024;
/// Topic connection ids are broker id * 1000 + a per-broker sequence
const TOPICS_PER_BROKER: u64 = 1000;

/// Incremental framer state per broker connection
struct Framer {
    rx: BytesMut,
    tx: BytesMut,
    pkid: u16,
    /// Remaining bytes of an oversized inbound packet. They are discarded
    /// as they arrive instead of being buffered, so the stream stays in
    /// sync without the receive buffer ever growing past one packet cap.
    skip: usize,
}

impl Framer {
    fn new() -> Framer {
        Framer {
            rx: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            tx: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            pkid: 0,
            skip: 0,
        }
    }

    fn next_pkid(&mut self) -> u16 {
        self.pkid = self.pkid.wrapping_add(1);
        if self.pkid == 0 {
            self.pkid = 1;
        }
        self.pkid
    }

    fn encode(&mut self, packet: &Packet) -> Result<(), Error> {
        mqttbytes::mqtt_write(packet, &mut self.tx)
            .map(|_| ())
            .map_err(|_| Error::Internal("mqtt packet encoding failed"))
    }

    /// Appends received bytes, finishing the discard of an oversized
    /// packet first
    fn feed(&mut self, mut data: &[u8]) {
        if self.skip > 0 {
            let n = self.skip.min(data.len());
            self.skip -= n;
            data = &data[n..];
        }
        if !data.is_empty() {
            self.rx.extend_from_slice(data);
        }
    }

    /// The next complete packet in the receive buffer. Packets announcing
    /// more than the maximum size are dropped without acknowledgement:
    /// the buffered part is consumed right away and the rest is
    /// skip-counted by `feed`.
    fn next_packet(&mut self) -> Result<Option<Packet>, mqttbytes::Error> {
        loop {
            if let Ok(header) = mqttbytes::parse_fixed_header(&self.rx) {
                if header.remaining_len > MAX_PACKET_SIZE {
                    debug!("MQTT | discarding an oversized packet of {} bytes", header.remaining_len);
                    let buffered = self.rx.len().min(header.frame_length());
                    self.rx.advance(buffered);
                    self.skip = header.frame_length() - buffered;
                    continue;
                }
            }
            match mqttbytes::mqtt_read(&mut self.rx, MAX_PACKET_SIZE) {
                Ok(packet) => return Ok(Some(packet)),
                Err(mqttbytes::Error::InsufficientBytes(_)) => return Ok(None),
                Err(mqttbytes::Error::PayloadSizeLimitExceeded(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

struct TopicConnection {
    id: ConnectionId,
    state: ConnectionState,
    topic: String,
    subscribe: bool,
    /// Guards against a second delayed removal
    closing: bool,
    callback: Arc<Mutex<ConnectionCallback>>,
}

/// A stateful connection to one broker, shared by the topic connections
/// with a matching fingerprint. Not exposed through the public interface.
struct BrokerConnection {
    tcp_connection_id: Option<ConnectionId>,
    tcp_state: ConnectionState,
    framer: Option<Framer>,
    last_send_time: u64,
    /// Seconds between keep-alive pings
    keep_alive: u16,
    keep_alive_timer: Option<TimerId>,
    topics: HashMap<ConnectionId, TopicConnection>,
    topic_seq: u64,
    /// Frozen copy of the broker-scope open parameters, for deduplication
    fingerprint: Params,
}

struct MqttInner {
    state: EventSourceState,
    el: Weak<EventLoop>,
    tcp_cm: Option<Arc<dyn ConnectionManager>>,
    brokers: HashMap<u64, BrokerConnection>,
    broker_id_counter: u64,
}

pub struct MqttConnectionManager {
    name: String,
    weak_self: Weak<MqttConnectionManager>,
    inner: Mutex<MqttInner>,
}

/// The broker-scope subset of the open parameters, with defaults applied
fn broker_fingerprint(params: &Params) -> Params {
    let mut fp = Params::new()
        .with("address", Value::String(params.get_str("address").unwrap_or("").to_owned()))
        .with("port", Value::U16(params.get_u16("port").unwrap_or(DEFAULT_PORT)))
        .with("keep-alive", Value::U16(params.get_u16("keep-alive").unwrap_or(DEFAULT_KEEP_ALIVE)));
    if let Some(username) = params.get_str("username") {
        fp.insert("username", Value::String(username.to_owned()));
    }
    if let Some(password) = params.get_str("password") {
        fp.insert("password", Value::String(password.to_owned()));
    }
    fp
}

/// Presence and type check over the recognized parameters
fn validate_params(params: &Params) -> Result<(), Error> {
    if params.get_str("address").map_or(true, |a| a.is_empty()) {
        return Err(Error::ConnectionRejected("the address parameter is required"));
    }
    if params.get_str("topic").map_or(true, |t| t.is_empty()) {
        return Err(Error::ConnectionRejected("the topic parameter is required"));
    }
    for &name in &["port", "keep-alive"] {
        if params.contains(name) && params.get_u16(name).is_none() {
            return Err(Error::ConnectionRejected("parameter has the wrong type"));
        }
    }
    for &name in &["username", "password"] {
        if params.contains(name) && params.get_str(name).is_none() {
            return Err(Error::ConnectionRejected("parameter has the wrong type"));
        }
    }
    for &name in &["validate", "subscribe"] {
        if params.contains(name) && params.get_bool(name).is_none() {
            return Err(Error::ConnectionRejected("parameter has the wrong type"));
        }
    }
    Ok(())
}

fn topic_params(topic: &str, subscribe: bool) -> Params {
    Params::new()
        .with("topic", Value::String(topic.to_owned()))
        .with("subscribe", Value::Bool(subscribe))
}

impl MqttConnectionManager {
    pub fn new(name: &str) -> Arc<MqttConnectionManager> {
        Arc::new_cyclic(|weak_self| MqttConnectionManager {
            name: name.to_owned(),
            weak_self: weak_self.clone(),
            inner: Mutex::new(MqttInner {
                state: EventSourceState::Fresh,
                el: Weak::new(),
                tcp_cm: None,
                brokers: HashMap::new(),
                broker_id_counter: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MqttInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tcp_cm(&self) -> Result<Arc<dyn ConnectionManager>, Error> {
        self.lock().tcp_cm.clone().ok_or(Error::BadState("the connection manager is not started"))
    }

    /// A broker connection with a matching fingerprint, if one exists
    fn find_broker_by_fingerprint(&self, fingerprint: &Params) -> Option<u64> {
        let inner = self.lock();
        inner
            .brokers
            .iter()
            .find(|(_, bc)| bc.fingerprint == *fingerprint)
            .map(|(&id, _)| id)
    }

    /// Creates the broker record, opens the underlying TCP connection and
    /// registers the keep-alive timer
    fn create_broker_connection(&self, params: &Params) -> Result<u64, Error> {
        let tcp_cm = self.tcp_cm()?;
        let el = self
            .lock()
            .el
            .upgrade()
            .ok_or(Error::BadState("not registered in an event loop"))?;

        let fingerprint = broker_fingerprint(params);
        let address = params.get_str("address").unwrap_or("").to_owned();
        let port = params.get_u16("port").unwrap_or(DEFAULT_PORT);
        let keep_alive = match params.get_u16("keep-alive") {
            Some(ka) if ka > 0 => ka,
            _ => DEFAULT_KEEP_ALIVE,
        };

        let broker_id = {
            let mut inner = self.lock();
            inner.broker_id_counter += 1;
            let broker_id = inner.broker_id_counter;
            inner.brokers.insert(
                broker_id,
                BrokerConnection {
                    tcp_connection_id: None,
                    tcp_state: ConnectionState::Closed,
                    framer: None,
                    last_send_time: now_monotonic(),
                    keep_alive,
                    keep_alive_timer: None,
                    topics: HashMap::new(),
                    topic_seq: 0,
                    fingerprint,
                },
            );
            broker_id
        };

        // Open the TCP connection. The callback fires synchronously with
        // Opening, which stores the TCP connection id in the record.
        let tcp_params = Params::new()
            .with("hostname", Value::String(address))
            .with("port", Value::U16(port));
        let weak = self.weak_self.clone();
        let tcp_callback: ConnectionCallback =
            Box::new(move |_cm, tcp_id, state, _params, payload| {
                if let Some(cm) = weak.upgrade() {
                    cm.tcp_event(broker_id, tcp_id, state, payload);
                }
            });

        if let Err(e) = tcp_cm.open_connection(&tcp_params, tcp_callback) {
            self.lock().brokers.remove(&broker_id);
            return Err(e);
        }

        let weak = self.weak_self.clone();
        let timer = el.add_cyclic_callback(
            move || {
                if let Some(cm) = weak.upgrade() {
                    cm.keep_alive_tick(broker_id);
                }
            },
            Duration::from_secs(keep_alive as u64),
            None,
            TimerPolicy::CurrentTime,
        )?;
        if let Some(bc) = self.lock().brokers.get_mut(&broker_id) {
            bc.keep_alive_timer = Some(timer);
        }

        debug!("MQTT | created broker connection {}", broker_id);
        Ok(broker_id)
    }

    /// Creates the externally visible per-topic connection on a broker
    fn create_topic_connection(
        &self,
        broker_id: u64,
        params: &Params,
        callback: ConnectionCallback,
    ) -> Result<(), Error> {
        let subscribe = params.get_bool("subscribe").unwrap_or(true);
        let topic = params.get_str("topic").unwrap_or("").to_owned();
        let callback = Arc::new(Mutex::new(callback));

        let (id, broker_established) = {
            let mut inner = self.lock();
            let bc = inner.brokers.get_mut(&broker_id).ok_or(Error::NotFound)?;
            if bc.topic_seq + 1 >= TOPICS_PER_BROKER {
                return Err(Error::ConnectionRejected("too many topic connections on the broker"));
            }
            bc.topic_seq += 1;
            let id = broker_id * TOPICS_PER_BROKER + bc.topic_seq;
            let broker_established = bc.tcp_state == ConnectionState::Established;

            // Publishers on an established broker are immediately up.
            // Subscribers stay Opening until the first received message.
            let state = if broker_established && !subscribe {
                ConnectionState::Established
            } else {
                ConnectionState::Opening
            };
            bc.topics.insert(
                id,
                TopicConnection {
                    id,
                    state,
                    topic: topic.clone(),
                    subscribe,
                    closing: false,
                    callback: callback.clone(),
                },
            );
            (id, broker_established)
        };

        if broker_established {
            if subscribe {
                if let Err(e) = self.send_subscribe(broker_id, &topic) {
                    if let Some(bc) = self.lock().brokers.get_mut(&broker_id) {
                        bc.topics.remove(&id);
                    }
                    return Err(e);
                }
                info!("MQTT {} | created connection subscribed on topic \"{}\"", id, topic);
            } else {
                info!("MQTT {} | created connection publishing on topic \"{}\"", id, topic);
            }
        }

        // Signal the initial state. If the broker connection is still
        // opening, the state is signaled again once it resolves.
        let state = match self.lock().brokers.get(&broker_id).and_then(|bc| bc.topics.get(&id)) {
            Some(tc) => tc.state,
            None => return Err(Error::Internal("the topic connection vanished")),
        };
        let mut cb = callback.lock().unwrap_or_else(PoisonError::into_inner);
        (cb)(self, id, state, &Params::new(), &[]);
        Ok(())
    }

    fn send_subscribe(&self, broker_id: u64, topic: &str) -> Result<(), Error> {
        {
            let mut inner = self.lock();
            let bc = inner.brokers.get_mut(&broker_id).ok_or(Error::NotFound)?;
            let framer = bc.framer.as_mut().ok_or(Error::BadState("the mqtt session is not up"))?;
            let pkid = framer.next_pkid();
            let subscribe = Packet::Subscribe(Subscribe::new(pkid, topic, QoS::AtMostOnce));
            framer.encode(&subscribe)?;
        }
        self.flush_broker(broker_id)
    }

    /// Sends everything queued in the broker's transmit buffer over the
    /// underlying TCP connection
    fn flush_broker(&self, broker_id: u64) -> Result<(), Error> {
        let (tcp_cm, tcp_id, data) = {
            let mut inner = self.lock();
            let tcp_cm = inner.tcp_cm.clone().ok_or(Error::BadState("not started"))?;
            let bc = inner.brokers.get_mut(&broker_id).ok_or(Error::NotFound)?;
            if bc.tcp_state != ConnectionState::Established {
                return Err(Error::ConnectionRejected("the broker connection is not established"));
            }
            let tcp_id = bc.tcp_connection_id.ok_or(Error::Internal("no tcp connection id"))?;
            let framer = bc.framer.as_mut().ok_or(Error::BadState("the mqtt session is not up"))?;
            if framer.tx.is_empty() {
                return Ok(());
            }
            (tcp_cm, tcp_id, framer.tx.split())
        };

        let mut buf = tcp_cm.alloc_network_buffer(tcp_id, data.len())?;
        buf.put_slice(&data);
        tcp_cm.send_with_connection(tcp_id, buf)?;

        if let Some(bc) = self.lock().brokers.get_mut(&broker_id) {
            bc.last_send_time = now_monotonic();
        }
        Ok(())
    }

    /// State changes and data of the underlying TCP connection
    fn tcp_event(
        &self,
        broker_id: u64,
        tcp_id: ConnectionId,
        state: ConnectionState,
        payload: &[u8],
    ) {
        let old_state = {
            let mut inner = self.lock();
            let bc = match inner.brokers.get_mut(&broker_id) {
                Some(bc) => bc,
                None => return,
            };
            let old_state = bc.tcp_state;
            bc.tcp_state = state;
            if bc.tcp_connection_id.is_none() {
                bc.tcp_connection_id = Some(tcp_id);
            }
            old_state
        };

        debug!("MQTT-TCP {} | network callback ({:?})", tcp_id, state);

        // The TCP connection is going away. All the topic connections go
        // with it; reconnecting is up to the application.
        if state == ConnectionState::Closing || state == ConnectionState::Closed {
            self.remove_broker_connection(broker_id);
            return;
        }

        // Fully opened for the first time: connect the MQTT session
        if state == ConnectionState::Established && old_state != ConnectionState::Established {
            if let Err(e) = self.connect_session(broker_id) {
                warn!("MQTT-TCP {} | could not connect the mqtt session: {}", tcp_id, e);
                // The session never came up, don't send a DISCONNECT
                if let Some(bc) = self.lock().brokers.get_mut(&broker_id) {
                    bc.tcp_state = ConnectionState::Opening;
                }
                self.shutdown_broker(broker_id);
                return;
            }
            self.drain_pending_topics(broker_id);
        }

        if payload.is_empty() {
            return;
        }

        // Append to the framer's receive buffer and process every packet
        // that completed
        let mut protocol_error = false;
        let packets = {
            let mut inner = self.lock();
            let bc = match inner.brokers.get_mut(&broker_id) {
                Some(bc) => bc,
                None => return,
            };
            let framer = match bc.framer.as_mut() {
                Some(framer) => framer,
                None => return,
            };
            framer.feed(payload);

            let mut packets = Vec::new();
            loop {
                match framer.next_packet() {
                    Ok(Some(packet)) => packets.push(packet),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("MQTT-TCP {} | protocol error ({}), closing", tcp_id, e);
                        protocol_error = true;
                        break;
                    }
                }
            }
            packets
        };
        if protocol_error {
            self.shutdown_broker(broker_id);
            return;
        }

        for packet in packets {
            match packet {
                Packet::Publish(publish) => self.deliver_publish(broker_id, publish),
                Packet::ConnAck(connack) => {
                    if connack.code != ConnectReturnCode::Accepted {
                        warn!("MQTT-TCP {} | the broker rejected the connection ({:?})",
                              tcp_id, connack.code);
                        self.shutdown_broker(broker_id);
                        return;
                    }
                    debug!("MQTT-TCP {} | session accepted by the broker", tcp_id);
                }
                Packet::PingResp => debug!("MQTT-TCP {} | pingresp", tcp_id),
                // SUBACK/UNSUBACK are not surfaced; see the module notes
                other => debug!("MQTT-TCP {} | ignoring {:?}", tcp_id, other),
            }
        }
    }

    /// Initializes the framer and queues the CONNECT packet
    fn connect_session(&self, broker_id: u64) -> Result<(), Error> {
        {
            let mut inner = self.lock();
            let bc = inner.brokers.get_mut(&broker_id).ok_or(Error::NotFound)?;
            let mut framer = Framer::new();

            let mut connect = Connect::new("");
            connect.keep_alive = FRAMER_KEEP_ALIVE;
            connect.clean_session = true;
            connect.username = bc.fingerprint.get_str("username").map(str::to_owned);
            connect.password = bc.fingerprint.get_str("password").map(str::to_owned);
            framer.encode(&Packet::Connect(connect))?;

            bc.framer = Some(framer);
        }
        self.flush_broker(broker_id)
    }

    /// Handles the topic connections that were registered while the broker
    /// connection was still opening
    fn drain_pending_topics(&self, broker_id: u64) {
        let pending: Vec<(ConnectionId, String, bool, Arc<Mutex<ConnectionCallback>>)> = {
            let inner = self.lock();
            let bc = match inner.brokers.get(&broker_id) {
                Some(bc) => bc,
                None => return,
            };
            bc.topics
                .values()
                .filter(|tc| !tc.closing)
                .map(|tc| (tc.id, tc.topic.clone(), tc.subscribe, tc.callback.clone()))
                .collect()
        };

        for (id, topic, subscribe, callback) in pending {
            if subscribe {
                // Subscribers wait for their first message before they
                // signal that they successfully opened
                match self.send_subscribe(broker_id, &topic) {
                    Ok(()) => {
                        info!("MQTT {} | created connection subscribed on topic \"{}\"", id, topic)
                    }
                    Err(e) => {
                        warn!("MQTT {} | subscribe failed ({}), closing", id, e);
                        self.remove_topic_connection(id);
                    }
                }
            } else {
                info!("MQTT {} | created connection publishing on topic \"{}\"", id, topic);
                if let Some(bc) = self.lock().brokers.get_mut(&broker_id) {
                    if let Some(tc) = bc.topics.get_mut(&id) {
                        tc.state = ConnectionState::Established;
                    }
                }
                let mut cb = callback.lock().unwrap_or_else(PoisonError::into_inner);
                (cb)(self, id, ConnectionState::Established, &Params::new(), &[]);
            }
        }
    }

    /// Forwards an incoming PUBLISH to every subscribed topic connection
    /// with an exact topic match
    fn deliver_publish(&self, broker_id: u64, publish: Publish) {
        let subscribers: Vec<(ConnectionId, bool, Arc<Mutex<ConnectionCallback>>)> = {
            let mut inner = self.lock();
            let bc = match inner.brokers.get_mut(&broker_id) {
                Some(bc) => bc,
                None => return,
            };
            bc.topics
                .values_mut()
                .filter(|tc| tc.subscribe && !tc.closing && tc.topic == publish.topic)
                .map(|tc| {
                    // Receiving the first message is the only observable
                    // signal that the subscription is live
                    let first = tc.state != ConnectionState::Established;
                    if first {
                        tc.state = ConnectionState::Established;
                    }
                    (tc.id, first, tc.callback.clone())
                })
                .collect()
        };

        let params = topic_params(&publish.topic, true);
        for (id, first, callback) in subscribers {
            debug!("MQTT {} | received a message of {} bytes", id, publish.payload.len());
            let mut cb = callback.lock().unwrap_or_else(PoisonError::into_inner);
            if first {
                (cb)(self, id, ConnectionState::Established, &params, &[]);
            }
            (cb)(self, id, ConnectionState::Established, &params, &publish.payload);
        }
    }

    /// PINGREQ when nothing was sent for a full keep-alive interval
    fn keep_alive_tick(&self, broker_id: u64) {
        let due = {
            let inner = self.lock();
            match inner.brokers.get(&broker_id) {
                Some(bc) => {
                    bc.tcp_state == ConnectionState::Established
                        && now_monotonic()
                            >= bc.last_send_time + (bc.keep_alive as u64) * 1_000_000_000
                }
                None => return,
            }
        };
        if !due {
            return;
        }

        let encoded = {
            let mut inner = self.lock();
            inner
                .brokers
                .get_mut(&broker_id)
                .and_then(|bc| bc.framer.as_mut())
                .map(|framer| framer.encode(&Packet::PingReq))
        };
        if let Some(Ok(())) = encoded {
            if let Err(e) = self.flush_broker(broker_id) {
                warn!("MQTT | keep-alive ping failed ({})", e);
            }
        }
    }

    /// Closes the broker connection: DISCONNECT if the session is up, then
    /// the TCP close (which calls back and removes the record)
    fn shutdown_broker(&self, broker_id: u64) {
        let (established, tcp_id, tcp_cm) = {
            let inner = self.lock();
            let bc = match inner.brokers.get(&broker_id) {
                Some(bc) => bc,
                None => return,
            };
            if bc.tcp_state == ConnectionState::Closed || bc.tcp_state == ConnectionState::Closing {
                return;
            }
            (
                bc.tcp_state == ConnectionState::Established,
                bc.tcp_connection_id,
                inner.tcp_cm.clone(),
            )
        };

        debug!("MQTT | closing the broker connection {}", broker_id);

        if established {
            let encoded = {
                let mut inner = self.lock();
                inner
                    .brokers
                    .get_mut(&broker_id)
                    .and_then(|bc| bc.framer.as_mut())
                    .map(|framer| framer.encode(&Packet::Disconnect))
            };
            if let Some(Ok(())) = encoded {
                if let Err(e) = self.flush_broker(broker_id) {
                    debug!("MQTT | could not send DISCONNECT ({})", e);
                }
            }
        }

        if let Some(bc) = self.lock().brokers.get_mut(&broker_id) {
            bc.tcp_state = ConnectionState::Closing;
        }

        match (tcp_cm, tcp_id) {
            (Some(tcp_cm), Some(tcp_id)) => {
                // The close calls back in the next loop iteration
                let _ = tcp_cm.close_connection(tcp_id);
            }
            // No TCP connection ever came up
            _ => self.remove_broker_connection(broker_id),
        }
    }

    /// Drops the broker record, its keep-alive timer, and every topic
    /// connection hanging off it
    fn remove_broker_connection(&self, broker_id: u64) {
        let (bc, el) = {
            let mut inner = self.lock();
            let bc = match inner.brokers.remove(&broker_id) {
                Some(bc) => bc,
                None => return,
            };
            (bc, inner.el.upgrade())
        };

        debug!("MQTT | removing the broker connection {}", broker_id);

        if let (Some(timer), Some(el)) = (bc.keep_alive_timer, el) {
            let _ = el.remove_cyclic_callback(timer);
        }

        for tc in bc.topics.values() {
            info!("MQTT {} | closing the connection", tc.id);
            let params = topic_params(&tc.topic, tc.subscribe);
            let mut cb = tc.callback.lock().unwrap_or_else(PoisonError::into_inner);
            (cb)(self, tc.id, ConnectionState::Closing, &params, &[]);
        }

        self.check_stopped();
    }

    /// The delayed half of a topic connection close
    fn remove_topic_connection(&self, id: ConnectionId) {
        let broker_id = id / TOPICS_PER_BROKER;
        let (tc, unsubscribe, last_topic) = {
            let mut inner = self.lock();
            let bc = match inner.brokers.get_mut(&broker_id) {
                Some(bc) => bc,
                None => return,
            };
            let tc = match bc.topics.remove(&id) {
                Some(tc) => tc,
                None => return,
            };
            let unsubscribe = tc.subscribe
                && tc.state == ConnectionState::Established
                && bc.tcp_state == ConnectionState::Established;
            (tc, unsubscribe, bc.topics.is_empty())
        };

        info!("MQTT {} | closing the connection", id);

        if unsubscribe {
            let encoded = {
                let mut inner = self.lock();
                inner.brokers.get_mut(&broker_id).and_then(|bc| bc.framer.as_mut()).map(|framer| {
                    let pkid = framer.next_pkid();
                    framer.encode(&Packet::Unsubscribe(Unsubscribe::new(pkid, tc.topic.as_str())))
                })
            };
            if let Some(Ok(())) = encoded {
                if let Err(e) = self.flush_broker(broker_id) {
                    debug!("MQTT {} | could not send UNSUBSCRIBE ({})", id, e);
                }
            }
        }

        {
            let params = topic_params(&tc.topic, tc.subscribe);
            let mut cb = tc.callback.lock().unwrap_or_else(PoisonError::into_inner);
            (cb)(self, id, ConnectionState::Closing, &params, &[]);
        }

        // The last topic connection keeps the broker connection alive
        if last_topic {
            self.shutdown_broker(broker_id);
        }
    }

    fn find_topic_connection(&self, id: ConnectionId) -> Option<(u64, String, ConnectionState)> {
        let broker_id = id / TOPICS_PER_BROKER;
        let inner = self.lock();
        let bc = inner.brokers.get(&broker_id)?;
        let tc = bc.topics.get(&id)?;
        Some((broker_id, tc.topic.clone(), bc.tcp_state))
    }

    fn check_stopped(&self) {
        let mut inner = self.lock();
        if inner.state == EventSourceState::Stopping && inner.brokers.is_empty() {
            debug!("MQTT | all broker connections closed, the connection manager has stopped");
            inner.state = EventSourceState::Stopped;
        }
    }
}

impl EventSource for MqttConnectionManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> EventSourceState {
        self.lock().state
    }

    fn attach(&self, el: Weak<EventLoop>, _id: SourceId) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.state != EventSourceState::Fresh {
            return Err(Error::BadState("the connection manager is already registered"));
        }
        inner.el = el;
        inner.state = EventSourceState::Stopped;
        Ok(())
    }

    fn detach(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.state != EventSourceState::Stopped {
            return Err(Error::BadState("the connection manager has to be stopped first"));
        }
        inner.el = Weak::new();
        inner.tcp_cm = None;
        inner.state = EventSourceState::Fresh;
        Ok(())
    }

    /// Binds to the first TCP connection manager registered in the same
    /// event loop. Fails if there is none.
    fn start(&self) -> Result<(), Error> {
        let el = {
            let inner = self.lock();
            if inner.state != EventSourceState::Stopped {
                return Err(Error::BadState(
                    "to start, the connection manager has to be registered in an event loop and not started yet",
                ));
            }
            inner.el.upgrade().ok_or(Error::BadState("not registered in an event loop"))?
        };

        let tcp_cm = el
            .find_connection_manager("tcp")
            .ok_or(Error::BadState("no tcp connection manager in the event loop"))?;

        let mut inner = self.lock();
        inner.tcp_cm = Some(tcp_cm);
        inner.state = EventSourceState::Started;
        Ok(())
    }

    fn stop(&self) {
        let broker_ids: Vec<u64> = {
            let mut inner = self.lock();
            match inner.state {
                EventSourceState::Stopping | EventSourceState::Stopped => return,
                _ => {}
            }
            info!("MQTT | shutting down the connection manager");
            if inner.brokers.is_empty() {
                inner.state = EventSourceState::Stopped;
                return;
            }
            inner.state = EventSourceState::Stopping;
            inner.brokers.keys().copied().collect()
        };

        for broker_id in broker_ids {
            self.shutdown_broker(broker_id);
        }
    }

    fn as_connection_manager(self: Arc<Self>) -> Option<Arc<dyn ConnectionManager>> {
        Some(self)
    }
}

impl ConnectionManager for MqttConnectionManager {
    fn protocol(&self) -> &str {
        "mqtt"
    }

    fn open_connection(&self, params: &Params, callback: ConnectionCallback) -> Result<(), Error> {
        if self.state() != EventSourceState::Started {
            return Err(Error::BadState("the connection manager is not started"));
        }

        validate_params(params)?;

        // A dry run validates the parameters and the address, then stops
        if params.get_bool("validate").unwrap_or(false) {
            let tcp_cm = self.tcp_cm()?;
            let tcp_params = Params::new()
                .with("hostname", Value::String(params.get_str("address").unwrap_or("").to_owned()))
                .with("port", Value::U16(params.get_u16("port").unwrap_or(DEFAULT_PORT)))
                .with("validate", Value::Bool(true));
            return tcp_cm.open_connection(&tcp_params, Box::new(|_, _, _, _, _| {}));
        }

        // Reuse an existing broker connection when the fingerprint
        // matches, otherwise open a new one
        let fingerprint = broker_fingerprint(params);
        let broker_id = match self.find_broker_by_fingerprint(&fingerprint) {
            Some(broker_id) => broker_id,
            None => self.create_broker_connection(params)?,
        };

        if let Err(e) = self.create_topic_connection(broker_id, params, callback) {
            // A broker connection without topic connections is useless
            let empty = self
                .lock()
                .brokers
                .get(&broker_id)
                .map_or(false, |bc| bc.topics.is_empty());
            if empty {
                self.shutdown_broker(broker_id);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Publishes the buffer on the connection's topic
    fn send_with_connection(&self, id: ConnectionId, buf: BytesMut) -> Result<(), Error> {
        let (broker_id, topic, tcp_state) = match self.find_topic_connection(id) {
            Some(found) => found,
            None => {
                warn!("MQTT | cannot send via connection {} - not found", id);
                return Err(Error::NotFound);
            }
        };

        if tcp_state != ConnectionState::Established {
            return Err(Error::ConnectionRejected("the broker connection is not established"));
        }

        debug!("MQTT {} | publishing a message with {} bytes on topic \"{}\"", id, buf.len(), topic);

        {
            let mut inner = self.lock();
            let framer = inner
                .brokers
                .get_mut(&broker_id)
                .and_then(|bc| bc.framer.as_mut())
                .ok_or(Error::BadState("the mqtt session is not up"))?;
            let publish = Publish::new(topic, QoS::AtMostOnce, buf.freeze());
            framer.encode(&Packet::Publish(publish))?;
        }
        self.flush_broker(broker_id)
    }

    fn close_connection(&self, id: ConnectionId) -> Result<(), Error> {
        let broker_id = id / TOPICS_PER_BROKER;
        let el = {
            let mut inner = self.lock();
            let el = inner.el.upgrade();
            let bc = inner.brokers.get_mut(&broker_id).ok_or(Error::NotFound)?;
            let tc = bc.topics.get_mut(&id).ok_or(Error::NotFound)?;
            if tc.closing {
                return Ok(());
            }
            tc.closing = true;
            el
        };

        debug!("MQTT {} | shutdown called", id);

        // Remove in the next iteration
        let weak = self.weak_self.clone();
        match el {
            Some(el) => el.add_delayed_callback(move || {
                if let Some(cm) = weak.upgrade() {
                    cm.remove_topic_connection(id);
                }
            }),
            None => self.remove_topic_connection(id),
        }
        Ok(())
    }

    fn alloc_network_buffer(&self, id: ConnectionId, size: usize) -> Result<BytesMut, Error> {
        match self.lock().tcp_cm.clone() {
            Some(tcp_cm) => tcp_cm.alloc_network_buffer(id, size),
            None => Ok(BytesMut::with_capacity(size)),
        }
    }

    fn free_network_buffer(&self, id: ConnectionId, buf: BytesMut) {
        match self.lock().tcp_cm.clone() {
            Some(tcp_cm) => tcp_cm.free_network_buffer(id, buf),
            None => drop(buf),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fingerprints_apply_the_defaults() {
        let explicit = Params::new()
            .with("address", Value::String("broker".to_owned()))
            .with("port", Value::U16(1883))
            .with("keep-alive", Value::U16(400))
            .with("topic", Value::String("t1".to_owned()));
        let defaulted = Params::new()
            .with("address", Value::String("broker".to_owned()))
            .with("topic", Value::String("t2".to_owned()));

        assert_eq!(broker_fingerprint(&explicit), broker_fingerprint(&defaulted));

        let other = Params::new()
            .with("address", Value::String("broker".to_owned()))
            .with("username", Value::String("user".to_owned()))
            .with("topic", Value::String("t3".to_owned()));
        assert_ne!(broker_fingerprint(&explicit), broker_fingerprint(&other));
    }

    #[test]
    fn parameter_validation_requires_address_and_topic() {
        let params = Params::new().with("topic", Value::String("t".to_owned()));
        assert!(validate_params(&params).is_err());

        let params = Params::new().with("address", Value::String("broker".to_owned()));
        assert!(validate_params(&params).is_err());

        let params = Params::new()
            .with("address", Value::String("broker".to_owned()))
            .with("topic", Value::String("t".to_owned()));
        assert!(validate_params(&params).is_ok());

        // Present but mistyped parameters are rejected
        let params = Params::new()
            .with("address", Value::String("broker".to_owned()))
            .with("topic", Value::String("t".to_owned()))
            .with("port", Value::String("1883".to_owned()));
        assert!(validate_params(&params).is_err());
    }

    #[test]
    fn framer_recovers_after_an_oversized_packet() {
        let mut stream = BytesMut::new();
        let oversized = Publish::new("big", QoS::AtMostOnce, vec![0u8; MAX_PACKET_SIZE + 1]);
        oversized.write(&mut stream).unwrap();
        mqttbytes::mqtt_write(&Packet::PingReq, &mut stream).unwrap();

        // Feed in two chunks so the discard spans multiple reads
        let mut framer = Framer::new();
        let half = stream.len() / 2;
        framer.feed(&stream[..half]);
        assert!(framer.next_packet().unwrap().is_none());
        assert!(framer.skip > 0);
        assert!(framer.rx.is_empty());

        // The trailing pingreq survives the discarded publish
        framer.feed(&stream[half..]);
        assert_eq!(framer.next_packet().unwrap(), Some(Packet::PingReq));
        assert_eq!(framer.next_packet().unwrap(), None);
        assert_eq!(framer.skip, 0);
        assert!(framer.rx.is_empty());
    }
}
