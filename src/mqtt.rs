use crate::snapshot::Message;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tracing::{debug, info, trace};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not queue a message for publishing")]
    Publish(#[source] rumqttc::ClientError),
    #[error("could not queue the disconnect request")]
    Disconnect(#[source] rumqttc::ClientError),
    #[error("connection to the MQTT broker failed")]
    Connection(#[source] rumqttc::ConnectionError),
    #[error(
        "the broker acknowledged only {acknowledged} of {total} messages within {}",
        humantime::format_duration(*.timeout)
    )]
    Timeout { acknowledged: usize, total: usize, timeout: Duration },
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "mqtt::Args")]
pub struct Args {
    /// Host name or address of the MQTT broker.
    #[arg(long, short = 'b', default_value = "127.0.0.1")]
    mqtt_host: String,

    #[arg(long, default_value = "1883")]
    mqtt_port: u16,

    #[arg(long, default_value = "swegon-modbus-tools")]
    mqtt_client_id: String,

    /// Prefix for the published topics (`{topic}/{category}/{field}`.)
    #[arg(long, short = 't', default_value = "swegon")]
    topic: String,

    /// Ask the broker to retain the published values.
    #[arg(long)]
    retain: bool,

    /// Give up if the broker hasn't acknowledged every message in this amount of time.
    #[arg(long, default_value = "5s")]
    publish_timeout: humantime::Duration,
}

impl Args {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Publish all the messages and wait for the broker to acknowledge each of them.
pub async fn publish(args: &Args, messages: &[Message]) -> Result<(), Error> {
    let mut options = MqttOptions::new(&args.mqtt_client_id, &args.mqtt_host, args.mqtt_port);
    options.set_keep_alive(Duration::from_secs(5));
    // Room for every publish and the final disconnect, so queueing never blocks.
    let (client, mut eventloop) = AsyncClient::new(options, messages.len() + 1);
    for message in messages {
        trace!(message = "queueing", topic = %message.topic, payload = %message.payload);
        client
            .try_publish(&message.topic, QoS::AtLeastOnce, args.retain, message.payload.clone())
            .map_err(Error::Publish)?;
    }
    info!(message = "publishing", host = %args.mqtt_host, count = messages.len());

    let total = messages.len();
    let mut acknowledged = 0;
    let timeout = *args.publish_timeout;
    let run = drive(&client, &mut eventloop, total, &mut acknowledged);
    let outcome = tokio::time::timeout(timeout, run).await;
    match outcome {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout { acknowledged, total, timeout }),
    }
}

/// Poll the event loop until `total` publishes are acknowledged and the disconnect is sent out.
async fn drive(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    total: usize,
    acknowledged: &mut usize,
) -> Result<(), Error> {
    let mut disconnecting = false;
    loop {
        let event = eventloop.poll().await.map_err(Error::Connection)?;
        trace!(message = "mqtt event", ?event);
        match event {
            Event::Incoming(Packet::ConnAck(_)) => debug!(message = "connected to the broker"),
            Event::Incoming(Packet::PubAck(_)) => *acknowledged += 1,
            Event::Outgoing(Outgoing::Disconnect) => return Ok(()),
            _ => {}
        }
        if *acknowledged == total && !disconnecting {
            disconnecting = true;
            client.try_disconnect().map_err(Error::Disconnect)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::{TcpListener, TcpStream};

    const CONNECT: u8 = 1;
    const PUBLISH: u8 = 3;
    const DISCONNECT: u8 = 14;

    /// Read one MQTT control packet, returning its type and the bytes after the fixed header.
    async fn read_packet(socket: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let header = socket.read_u8().await.ok()?;
        let mut length = 0usize;
        for shift in (0..28).step_by(7) {
            let byte = socket.read_u8().await.ok()?;
            length |= usize::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                break;
            }
        }
        let mut body = vec![0; length];
        socket.read_exact(&mut body).await.ok()?;
        Some((header >> 4, body))
    }

    /// A broker that accepts a single client, optionally acknowledging its publishes.
    ///
    /// Returns the published topics and the type of the last packet received.
    async fn broker(listener: TcpListener, acknowledge: bool) -> (Vec<String>, Option<u8>) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut topics = Vec::new();
        let mut last = None;
        while let Some((kind, body)) = read_packet(&mut socket).await {
            last = Some(kind);
            match kind {
                CONNECT => socket.write_all(&[0x20, 2, 0, 0]).await.unwrap(),
                PUBLISH => {
                    let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
                    let topic = String::from_utf8(body[2..][..topic_len].to_vec()).unwrap();
                    topics.push(topic);
                    if acknowledge {
                        let id = &body[2 + topic_len..][..2];
                        socket.write_all(&[0x40, 2, id[0], id[1]]).await.unwrap();
                    }
                }
                DISCONNECT => break,
                _ => {}
            }
        }
        (topics, last)
    }

    type Broker = tokio::task::JoinHandle<(Vec<String>, Option<u8>)>;

    async fn start(acknowledge: bool, publish_timeout: Duration) -> (Args, Broker) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let args = Args {
            mqtt_host: "127.0.0.1".into(),
            mqtt_port: port,
            mqtt_client_id: "swegon-modbus-tools-test".into(),
            topic: "swegon".into(),
            retain: false,
            publish_timeout: publish_timeout.into(),
        };
        (args, tokio::spawn(broker(listener, acknowledge)))
    }

    fn messages() -> Vec<Message> {
        ["temperatures/room", "unit_state/state", "fans/supply_fan_rpm"]
            .into_iter()
            .zip(["21.5", "Normal", "1800"])
            .map(|(topic, payload)| Message {
                topic: format!("swegon/{topic}"),
                payload: payload.into(),
            })
            .collect()
    }

    #[tokio::test]
    async fn publishes_and_disconnects_once_acknowledged() {
        let (args, broker) = start(true, Duration::from_secs(5)).await;
        publish(&args, &messages()).await.unwrap();
        let (topics, last) = broker.await.unwrap();
        assert_eq!(
            topics,
            ["swegon/temperatures/room", "swegon/unit_state/state", "swegon/fans/supply_fan_rpm"]
        );
        assert_eq!(last, Some(DISCONNECT));
    }

    #[tokio::test]
    async fn unacknowledged_publishes_time_out() {
        let (args, broker) = start(false, Duration::from_millis(500)).await;
        let err = publish(&args, &messages()).await.unwrap_err();
        assert!(
            matches!(err, Error::Timeout { acknowledged: 0, total: 3, .. }),
            "unexpected error: {err:?}"
        );
        assert_eq!(err.to_string(), "the broker acknowledged only 0 of 3 messages within 500ms");
        let (topics, last) = broker.await.unwrap();
        assert_eq!(topics.len(), 3);
        assert_ne!(last, Some(DISCONNECT));
    }
}
