//! li-gen LiFePO4 BMS.
//!
//! The BMS speaks a Modbus-like request/response protocol over the Nordic
//! UART BLE service. A poll sends two fixed requests (state of charge, then
//! voltages); the frame handed to [`LigenDriver::decode`] is both responses
//! back to back.
//!
//! Response layout:
//!
//! | Bytes     | Meaning                                    |
//! |-----------|--------------------------------------------|
//! | 0..2      | header `01 03`                             |
//! | 2         | payload length `n`                         |
//! | 3..3+n    | payload, big-endian u16 words              |
//! | 3+n..5+n  | CRC-16/MODBUS over everything before it    |

use async_trait::async_trait;
use crc16::{MODBUS, State};

use super::{Connection, Driver, DriverKind};
use crate::config::DeviceSpec;
use crate::error::{LinkError, ProtocolError};
use crate::sample::{CELL_VOLTAGES, Reading};

#[cfg(feature = "ble")]
use {super::Frame, crate::error::PollError};

/// Requests state of charge, residual capacity and cycles.
pub const REQ_SOC: [u8; 8] = [0x01, 0x03, 0xd0, 0x26, 0x00, 0x19, 0x5d, 0x0b];
/// Requests cell and battery voltages.
pub const REQ_VOLTAGES: [u8; 8] = [0x01, 0x03, 0xd0, 0x00, 0x00, 0x26, 0xfc, 0xd0];

const MSG_HEADER: [u8; 2] = [0x01, 0x03];
const CELL_VOLTAGE_NA: u16 = 61001;
const MAX_CELLS: usize = 32;

// word offsets
const SOC_PCT: usize = 14;
const RESIDUAL_CAH: usize = 16;
const CYCLES: usize = 19;
const BATTERY_CV: usize = 37;

/// Result of trying to parse one response.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Payload of a complete, valid message.
    Complete(Vec<u8>),
    /// More bytes are needed.
    Incomplete,
    Invalid(&'static str),
}

/// Parse a single response, returning its payload.
pub fn try_parse_msg(buffer: &[u8]) -> ParseOutcome {
    if buffer.len() < 3 {
        return ParseOutcome::Incomplete;
    }

    if buffer[0..2] != MSG_HEADER {
        return ParseOutcome::Invalid("Unexpected header");
    }

    let expected_len = buffer[2] as usize + 5;
    if buffer.len() < expected_len {
        return ParseOutcome::Incomplete;
    }
    if buffer.len() > expected_len {
        return ParseOutcome::Invalid("Too long");
    }

    let (body, crc_actual) = buffer.split_at(buffer.len() - 2);
    if crc_actual != crc(body) {
        return ParseOutcome::Invalid("CRC check failed");
    }

    ParseOutcome::Complete(buffer[3..buffer.len() - 2].to_vec())
}

/// CRC-16/MODBUS, little-endian as sent on the wire.
pub fn crc(data: &[u8]) -> [u8; 2] {
    State::<MODBUS>::calculate(data).to_le_bytes()
}

/// Split the first message off a buffer holding several.
fn split_message(buffer: &[u8]) -> Result<(&[u8], &[u8]), ProtocolError> {
    if buffer.len() < 3 {
        return Err(ProtocolError::Incomplete(hex::encode(buffer)));
    }
    let len = buffer[2] as usize + 5;
    if buffer.len() < len {
        return Err(ProtocolError::Incomplete(hex::encode(buffer)));
    }
    Ok(buffer.split_at(len))
}

fn payload(message: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    match try_parse_msg(message) {
        ParseOutcome::Complete(payload) => Ok(payload),
        ParseOutcome::Incomplete => Err(ProtocolError::Incomplete(hex::encode(message))),
        ParseOutcome::Invalid(reason) => Err(ProtocolError::Invalid {
            reason,
            frame: hex::encode(message),
        }),
    }
}

fn words(payload: &[u8], min_words: usize) -> Result<Vec<u16>, ProtocolError> {
    if payload.len() < min_words * 2 {
        return Err(ProtocolError::TooShort {
            expected: min_words * 2,
            actual: payload.len(),
        });
    }
    Ok(payload
        .chunks_exact(2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .collect())
}

/// Decode a state-of-charge response payload.
fn decode_soc(payload: &[u8], readings: &mut Vec<Reading>) -> Result<(), ProtocolError> {
    let nums = words(payload, CYCLES + 1)?;
    readings.push(Reading::new("soc", f64::from(nums[SOC_PCT])).with_unit("%"));
    readings.push(Reading::new("charge", f64::from(nums[RESIDUAL_CAH]) / 100.0).with_unit("Ah"));
    readings.push(Reading::new("num_cycles", u64::from(nums[CYCLES])));
    Ok(())
}

/// Decode a voltages response payload.
fn decode_voltages(payload: &[u8], readings: &mut Vec<Reading>) -> Result<(), ProtocolError> {
    let nums = words(payload, BATTERY_CV + 1)?;
    let cells = nums[..MAX_CELLS].iter().filter(|&&mv| mv != CELL_VOLTAGE_NA);
    for (i, mv) in cells.enumerate() {
        readings.push(
            Reading::new(format!("{CELL_VOLTAGES}/{}", i + 1), f64::from(*mv) / 1000.0)
                .with_unit("V"),
        );
    }
    readings.push(Reading::new("voltage", f64::from(nums[BATTERY_CV]) / 100.0).with_unit("V"));
    Ok(())
}

/// Driver for li-gen batteries.
#[derive(Debug, Default)]
pub struct LigenDriver;

impl LigenDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for LigenDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Ligen
    }

    #[cfg(feature = "ble")]
    async fn connect(&self, device: &DeviceSpec) -> Result<Box<dyn Connection>, LinkError> {
        let link = ble::BleLink::connect(&device.address).await?;
        tracing::debug!(device = %device.name(), "BLE link established");
        Ok(Box::new(LigenConnection {
            link,
            debug: device.debug,
        }))
    }

    #[cfg(not(feature = "ble"))]
    async fn connect(&self, device: &DeviceSpec) -> Result<Box<dyn Connection>, LinkError> {
        Err(LinkError::Unsupported(format!(
            "{}: built without the `ble` feature",
            device.address
        )))
    }

    fn decode(&self, device: &DeviceSpec, frame: &[u8]) -> Result<Vec<Reading>, ProtocolError> {
        if device.debug {
            tracing::debug!(device = %device.name(), frame = %hex::encode(frame), "Decoding frame");
        }

        let (soc_msg, rest) = split_message(frame)?;
        let (voltages_msg, rest) = split_message(rest)?;
        if !rest.is_empty() {
            return Err(ProtocolError::Invalid {
                reason: "Trailing bytes",
                frame: hex::encode(frame),
            });
        }

        let mut readings = Vec::new();
        decode_soc(&payload(soc_msg)?, &mut readings)?;
        decode_voltages(&payload(voltages_msg)?, &mut readings)?;
        Ok(readings)
    }
}

#[cfg(feature = "ble")]
struct LigenConnection {
    link: ble::BleLink,
    debug: bool,
}

#[cfg(feature = "ble")]
#[async_trait]
impl Connection for LigenConnection {
    async fn read_frame(&mut self) -> Result<Frame, PollError> {
        let mut frame = self.link.request(&REQ_SOC).await?;
        frame.extend(self.link.request(&REQ_VOLTAGES).await?);
        if self.debug {
            tracing::debug!(rx = %hex::encode(&frame), "Frame received");
        }
        Ok(frame)
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        self.link.disconnect().await
    }

    async fn is_alive(&self) -> bool {
        self.link.is_connected().await
    }
}

#[cfg(feature = "ble")]
mod ble {
    use std::time::Duration;

    use bluest::{Adapter, Characteristic, Device, Uuid};
    use futures_util::StreamExt;
    use tokio::time::timeout;

    use super::{ParseOutcome, try_parse_msg};
    use crate::error::LinkError;

    const NORDIC_UART_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
    const NORDIC_UART_WRITE: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
    const NORDIC_UART_NOTIFY: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

    const SCAN_TIMEOUT: Duration = Duration::from_secs(30);
    /// Silence after which a response counts as fully received.
    const NOTIFICATION_QUIET: Duration = Duration::from_secs(5);

    fn link_err(e: bluest::Error) -> LinkError {
        LinkError::Lost(e.to_string())
    }

    pub(super) struct BleLink {
        adapter: Adapter,
        device: Device,
        write: Characteristic,
        notify: Characteristic,
    }

    impl BleLink {
        pub(super) async fn connect(address: &str) -> Result<Self, LinkError> {
            let adapter = Adapter::default()
                .await
                .ok_or_else(|| LinkError::Adapter("default adapter not found".into()))?;
            adapter
                .wait_available()
                .await
                .map_err(|e| LinkError::Adapter(e.to_string()))?;

            let device = timeout(SCAN_TIMEOUT, discover(&adapter, address))
                .await
                .map_err(|_| LinkError::NotFound(address.to_string()))??;

            adapter
                .connect_device(&device)
                .await
                .map_err(|e| LinkError::Connect(e.to_string()))?;

            let service = device
                .discover_services_with_uuid(NORDIC_UART_SERVICE)
                .await
                .map_err(link_err)?
                .first()
                .cloned()
                .ok_or_else(|| LinkError::Connect("no Nordic UART service".into()))?;
            let write = first_characteristic(&service, NORDIC_UART_WRITE).await?;
            let notify = first_characteristic(&service, NORDIC_UART_NOTIFY).await?;

            Ok(Self {
                adapter,
                device,
                write,
                notify,
            })
        }

        /// Send a request and collect the notifications that answer it.
        ///
        /// Responses arrive split over several notifications, sometimes
        /// duplicated, so reading stops once a complete message parses or the
        /// link stays quiet. Validation happens in decode.
        pub(super) async fn request(&self, rq: &[u8]) -> Result<Vec<u8>, LinkError> {
            let reader = self.notify.notify().await.map_err(link_err)?;
            futures_util::pin_mut!(reader);

            tracing::trace!(tx = %hex::encode(rq), "BLE request");
            self.write.write(rq).await.map_err(link_err)?;

            let mut msg = Vec::new();
            loop {
                match timeout(NOTIFICATION_QUIET, reader.next()).await {
                    Err(_) => break,
                    Ok(None) => return Err(LinkError::Lost("notification stream ended".into())),
                    Ok(Some(Err(e))) => return Err(link_err(e)),
                    Ok(Some(Ok(data))) => {
                        msg.extend_from_slice(&data);
                        if matches!(try_parse_msg(&msg), ParseOutcome::Complete(_)) {
                            break;
                        }
                    }
                }
            }

            if msg.is_empty() {
                return Err(LinkError::Lost("no response".into()));
            }
            Ok(msg)
        }

        pub(super) async fn disconnect(&self) -> Result<(), LinkError> {
            self.adapter
                .disconnect_device(&self.device)
                .await
                .map_err(link_err)
        }

        pub(super) async fn is_connected(&self) -> bool {
            self.device.is_connected().await
        }
    }

    async fn discover(adapter: &Adapter, address: &str) -> Result<Device, LinkError> {
        let wanted = address.to_uppercase();
        let events = adapter
            .scan(&[NORDIC_UART_SERVICE])
            .await
            .map_err(|e| LinkError::Adapter(e.to_string()))?;
        futures_util::pin_mut!(events);

        while let Some(found) = events.next().await {
            let id = format!("{:?}", found.device.id()).to_uppercase();
            let name = found.device.name_async().await.unwrap_or_default();
            if id.contains(&wanted) || name.eq_ignore_ascii_case(address) {
                return Ok(found.device);
            }
        }

        Err(LinkError::NotFound(address.to_string()))
    }

    async fn first_characteristic(
        service: &bluest::Service,
        uuid: Uuid,
    ) -> Result<Characteristic, LinkError> {
        service
            .discover_characteristics_with_uuid(uuid)
            .await
            .map_err(link_err)?
            .first()
            .cloned()
            .ok_or_else(|| LinkError::Connect(format!("missing characteristic {uuid}")))
    }
}
