use crate::modbus::{self, Codec, ModbusRTUCodec, ModbusTCPCodec, Operation, Request, Response};
use futures::{SinkExt as _, StreamExt as _};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_serial::{SerialPortBuilderExt as _, SerialStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace};

const DEFAULT_TCP_PORT: u16 = 502;
const DEFAULT_TCP_READ_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_RTU_READ_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("could not connect to `{address}` within {}", humantime::format_duration(*.timeout))]
    ConnectTimeout { address: String, timeout: Duration },
    #[error("could not open serial device {1:?}")]
    OpenDevice(#[source] tokio_serial::Error, PathBuf),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("the connection was closed before a response arrived")]
    Closed,
    #[error("no response within {}", humantime::format_duration(*.0))]
    Timeout(Duration),
    #[error("response came from device {got}, but the request was sent to {expected}")]
    WrongDevice { expected: u8, got: u8 },
    #[error("device responded with exception {code} ({})", modbus::exception_name(*.code))]
    Exception { code: u8 },
    #[error("requested {expected} registers, but the response contains {got} bytes")]
    UnexpectedLength { expected: u16, got: usize },
}

/// Something that can read a run of input registers.
#[allow(async_fn_in_trait)]
pub trait ReadRegisters {
    /// Read `count` input registers starting at the 1-based register number `address`.
    async fn read_input_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, Error>;
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "connection::Args")]
pub struct Args {
    #[clap(flatten)]
    how: ConnectionGroup,

    /// The modbus device ID (unit address) of the Swegon unit.
    #[arg(long, short = 'i', default_value = "16")]
    device_id: u8,

    /// Consider the request failed if the response isn't received in this amount of time plus
    /// the time it takes to transfer the response over the serial line.
    ///
    /// Also bounds establishing the TCP connection. Defaults to 3s with `--tcp` and 1s with
    /// `--rtu`.
    #[arg(long)]
    read_timeout: Option<humantime::Duration>,

    /// The baudrate of the serial line.
    ///
    /// Only used with `--rtu`.
    #[arg(long, short = 'B', default_value = "38400")]
    baudrate: u32,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(required = true, multiple = false)]
pub struct ConnectionGroup {
    /// Connect to the Swegon unit over Modbus TCP (`HOST[:PORT]`, port defaults to 502.)
    #[arg(long)]
    tcp: Option<String>,
    /// Connect to the Swegon unit over Modbus RTU.
    ///
    /// Specify the path to the serial device, e.g. `/dev/ttyUSB0`.
    #[arg(long)]
    rtu: Option<PathBuf>,
}

enum Transport {
    Tcp(Framed<TcpStream, ModbusTCPCodec>),
    Rtu(Framed<SerialStream, ModbusRTUCodec>),
}

pub struct Connection {
    io: Transport,
    args: Args,
    next_transaction_id: u16,
}

impl Args {
    pub fn read_timeout(&self) -> Duration {
        match (&self.read_timeout, &self.how.tcp) {
            (Some(timeout), _) => **timeout,
            (None, Some(_)) => DEFAULT_TCP_READ_TIMEOUT,
            (None, None) => DEFAULT_RTU_READ_TIMEOUT,
        }
    }
}

impl Connection {
    pub async fn new(args: Args) -> Result<Connection, Error> {
        let io = if let Some(address) = &args.how.tcp {
            Transport::Tcp(connect_tcp(address, args.read_timeout()).await?)
        } else if let Some(path) = &args.how.rtu {
            Transport::Rtu(open_rtu(path, args.baudrate)?)
        } else {
            unreachable!("clap requires either `--tcp` or `--rtu`");
        };
        Ok(Self { io, args, next_transaction_id: 0 })
    }

    pub fn new_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        id
    }

    fn response_timeout(&self, request: &Request) -> Duration {
        match self.io {
            Transport::Tcp(_) => self.args.read_timeout(),
            Transport::Rtu(_) => {
                // 10 bits per byte with start and stop bits.
                let resp_len = u64::from(request.expected_response_length());
                let response_duration = Duration::from_secs(resp_len) / (self.args.baudrate / 10).max(1);
                response_duration + self.args.read_timeout()
            }
        }
    }

    pub async fn send(&mut self, operation: Operation) -> Result<Response, Error> {
        let transaction_id = self.new_transaction_id();
        let request = Request { device_id: self.args.device_id, transaction_id, operation };
        let timeout = self.response_timeout(&request);
        match &mut self.io {
            Transport::Tcp(io) => exchange(io, &request, timeout).await,
            Transport::Rtu(io) => {
                // Anything still buffered is a late response to an earlier, timed out request.
                io.read_buffer_mut().clear();
                exchange(io, &request, timeout).await
            }
        }
    }
}

impl ReadRegisters for Connection {
    async fn read_input_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, Error> {
        debug_assert!(count <= modbus::MAX_SAFE_READ_COUNT);
        let response = self.send(Operation::ReadInputRegisters { address, count }).await?;
        input_registers(response, count)
    }
}

/// Extract `count` registers from a response, turning exceptions into errors.
fn input_registers(response: Response, count: u16) -> Result<Vec<u16>, Error> {
    match response.kind {
        modbus::ResponseKind::ErrorCode(code) => Err(Error::Exception { code }),
        modbus::ResponseKind::InputRegisters { values } => {
            if values.len() != 2 * usize::from(count) {
                return Err(Error::UnexpectedLength { expected: count, got: values.len() });
            }
            Ok(modbus::words(&values))
        }
    }
}

/// Append the default Modbus port unless `address` already names one.
///
/// IPv6 addresses with a port must be bracketed (`[::1]:502`.)
fn with_default_port(address: &str) -> String {
    if let Ok(ip) = address.parse::<std::net::IpAddr>() {
        return std::net::SocketAddr::new(ip, DEFAULT_TCP_PORT).to_string();
    }
    if address.starts_with('[') && address.ends_with(']') {
        return format!("{address}:{DEFAULT_TCP_PORT}");
    }
    if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:{DEFAULT_TCP_PORT}")
    }
}

async fn connect_tcp(
    address: &str,
    timeout: Duration,
) -> Result<Framed<TcpStream, ModbusTCPCodec>, Error> {
    let address = with_default_port(address);
    info!(message = "connecting...", address);
    let addresses = tokio::net::lookup_host(&address)
        .await
        .map_err(|e| Error::LookupHost(e, address.clone()))?
        .collect::<Vec<_>>();
    debug!(message = "resolved", ?addresses);
    let socket = tokio::time::timeout(timeout, TcpStream::connect(&*addresses))
        .await
        .map_err(|_| Error::ConnectTimeout { address: address.clone(), timeout })?
        .map_err(|e| Error::Connect(e, address.clone()))?;
    let nodelay_result = socket.set_nodelay(true);
    trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
    info!(message = "connected");
    Ok(Framed::new(socket, ModbusTCPCodec {}))
}

fn open_rtu(path: &Path, baudrate: u32) -> Result<Framed<SerialStream, ModbusRTUCodec>, Error> {
    info!(message = "opening serial device", ?path, baudrate);
    let port = tokio_serial::new(path.to_string_lossy(), baudrate)
        .open_native_async()
        .map_err(|e| Error::OpenDevice(e, path.to_path_buf()))?;
    Ok(Framed::new(port, ModbusRTUCodec::default()))
}

async fn exchange<T, C>(
    io: &mut Framed<T, C>,
    request: &Request,
    timeout: Duration,
) -> Result<Response, Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
    C: Codec + Unpin,
{
    io.send(request).await.map_err(Error::Send)?;
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let next = tokio::time::timeout_at(deadline, io.next()).await;
        let response = match next {
            Err(_) => return Err(Error::Timeout(timeout)),
            Ok(None) => return Err(Error::Closed),
            Ok(Some(response)) => response.map_err(Error::Receive)?,
        };
        trace!(message = "decoded a response", transaction = response.transaction_id);
        if response.transaction_id != request.transaction_id {
            debug!(
                message = "a response we were not expecting",
                transaction = response.transaction_id
            );
            continue;
        }
        if response.device_id != request.device_id {
            return Err(Error::WrongDevice { expected: request.device_id, got: response.device_id });
        }
        return Ok(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser as _;
    use tokio::io::AsyncWriteExt as _;

    fn request(transaction_id: u16) -> Request {
        Request {
            device_id: 16,
            transaction_id,
            operation: Operation::ReadInputRegisters { address: 6201, count: 1 },
        }
    }

    /// An MBAP framed response carrying a single register.
    fn tcp_response(transaction_id: u16, device_id: u8, value: u16) -> Vec<u8> {
        let mut frame = transaction_id.to_be_bytes().to_vec();
        frame.extend([0, 0, 0, 5, device_id, 4, 2]);
        frame.extend(value.to_be_bytes());
        frame
    }

    #[tokio::test(start_paused = true)]
    async fn exchange_over_tcp() {
        let (client, mut device) = tokio::io::duplex(1024);
        let mut io = Framed::new(client, ModbusTCPCodec {});
        let timeout = Duration::from_millis(50);

        // A late response to an earlier request is skipped.
        device.write_all(&tcp_response(4, 16, 1)).await.unwrap();
        device.write_all(&tcp_response(5, 16, 250)).await.unwrap();
        let response = exchange(&mut io, &request(5), timeout).await.unwrap();
        assert_eq!(response.transaction_id, 5);
        assert_eq!(input_registers(response, 1).unwrap(), [250]);

        device.write_all(&tcp_response(6, 17, 250)).await.unwrap();
        let err = exchange(&mut io, &request(6), timeout).await.unwrap_err();
        assert!(matches!(err, Error::WrongDevice { expected: 16, got: 17 }));
        assert_eq!(err.to_string(), "response came from device 17, but the request was sent to 16");

        let err = exchange(&mut io, &request(7), timeout).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(t) if t == timeout));
        assert_eq!(err.to_string(), "no response within 50ms");

        drop(device);
        let err = exchange(&mut io, &request(8), timeout).await.unwrap_err();
        assert!(matches!(err, Error::Send(_) | Error::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn exception_response_over_tcp() {
        let (client, mut device) = tokio::io::duplex(1024);
        let mut io = Framed::new(client, ModbusTCPCodec {});
        device.write_all(&[0, 3, 0, 0, 0, 3, 16, 0x84, 2]).await.unwrap();
        let response = exchange(&mut io, &request(3), Duration::from_secs(1)).await.unwrap();
        let err = input_registers(response, 1).unwrap_err();
        assert!(matches!(err, Error::Exception { code: 2 }));
        assert_eq!(err.to_string(), "device responded with exception 2 (illegal data address)");
    }

    #[test]
    fn register_count_must_match() {
        let response = |values: Vec<u8>| Response {
            device_id: 16,
            transaction_id: 0,
            kind: modbus::ResponseKind::InputRegisters { values },
        };
        assert_eq!(input_registers(response(vec![0, 1, 0, 2]), 2).unwrap(), [1, 2]);
        assert!(matches!(
            input_registers(response(vec![0, 1]), 2),
            Err(Error::UnexpectedLength { expected: 2, got: 2 })
        ));
        assert!(matches!(
            input_registers(response(vec![0; 6]), 2),
            Err(Error::UnexpectedLength { expected: 2, got: 6 })
        ));
    }

    #[test]
    fn default_port() {
        assert_eq!(with_default_port("swegon.lan"), "swegon.lan:502");
        assert_eq!(with_default_port("swegon.lan:1502"), "swegon.lan:1502");
        assert_eq!(with_default_port("192.168.1.20"), "192.168.1.20:502");
        assert_eq!(with_default_port("::1"), "[::1]:502");
        assert_eq!(with_default_port("[fe80::1]"), "[fe80::1]:502");
        assert_eq!(with_default_port("[fe80::1]:1502"), "[fe80::1]:1502");
    }

    #[test]
    fn read_timeout_depends_on_transport() {
        let args = |cli: &[&str]| {
            Args::parse_from(std::iter::once("read").chain(cli.iter().copied()))
        };
        assert_eq!(args(&["--tcp", "swegon.lan"]).read_timeout(), Duration::from_secs(3));
        assert_eq!(args(&["--rtu", "/dev/ttyUSB0"]).read_timeout(), Duration::from_secs(1));
        assert_eq!(
            args(&["--tcp", "swegon.lan", "--read-timeout", "500ms"]).read_timeout(),
            Duration::from_millis(500)
        );
    }

    #[tokio::test]
    async fn connects_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        connect_tcp(&address, Duration::from_secs(1)).await.unwrap();
        accept.await.unwrap().unwrap();
    }
}
