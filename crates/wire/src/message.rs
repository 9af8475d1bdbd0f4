//! Typed messages and their binary codec
//!
//! # Design
//!
//! - `Envelope` = sequence / ack numbers + a `Message`
//! - Encoding writes through `byteorder::WriteBytesExt` into any `Write`
//! - Decoding reads a borrowed slice and rejects trailing bytes
//! - Every message is heap-allocated; small-message stack buffers are not
//!   reproduced

use crate::error::{Result, WireError};
use crate::msg_type::MsgType;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sspps_core::{ClientId, Clock, RowId, TableId, TableInfo};
use std::io::{Read, Write};

/// Bytes of `[msg_type][seq_num][ack_num]`
pub const HEADER_SIZE: usize = 4 + 4 + 4;

/// A message body
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Client process announces itself
    ClientConnect {
        /// Client id
        client_id: ClientId,
    },
    /// Server announces itself
    ServerConnect,
    /// App thread registers with its bg worker
    AppConnect,
    /// App asks a bg worker to create a table
    BgCreateTable {
        /// Table id
        table_id: TableId,
        /// Table configuration
        info: TableInfo,
    },
    /// Bg worker asks servers to create a table
    CreateTable {
        /// Table id
        table_id: TableId,
        /// Table configuration
        info: TableInfo,
    },
    /// Table created
    CreateTableReply {
        /// Table id
        table_id: TableId,
    },
    /// Every table has been created
    CreatedAllTables,
    /// Fetch a row no staler than `clock`
    RowRequest {
        /// Table id
        table_id: TableId,
        /// Row id
        row_id: RowId,
        /// Minimum clock the reply must reflect
        clock: Clock,
        /// Bypass the local cache
        forced: bool,
    },
    /// Bg worker tells an app thread its row arrived
    RowRequestReply,
    /// Server sends a requested row
    ServerRowRequestReply {
        /// Table id
        table_id: TableId,
        /// Row id
        row_id: RowId,
        /// Server clock of the row data
        clock: Clock,
        /// Last oplog version applied from the requester
        version: u32,
        /// Serialized row
        row_data: Vec<u8>,
    },
    /// App thread advanced its clock
    BgClock,
    /// App thread asks its bg worker to flush
    BgSendOpLog,
    /// Oplog payload from a bg worker
    ClientSendOpLog {
        /// Whether this message closes a clock
        is_clock: bool,
        /// Sending client
        client_id: ClientId,
        /// Per-bg message version, consecutive from 0
        version: u32,
        /// Bg worker clock at send time
        bg_clock: Clock,
        /// Serialized oplog (see `sspps_oplog::serializer`)
        payload: Vec<u8>,
    },
    /// Bg worker connects to a server thread
    ConnectServer,
    /// Client may start
    ClientStart,
    /// App thread leaves
    AppThreadDereg,
    /// Client is shutting down
    ClientShutDown,
    /// Server acknowledges shutdown
    ServerShutDownAck,
    /// Rows pushed by a server
    ServerPushRow {
        /// Server min clock the rows reflect
        clock: Clock,
        /// Last oplog version applied from the receiver
        version: u32,
        /// Full push at a clock boundary (as opposed to an idle partial push)
        is_clock: bool,
        /// Serialized tables of rows
        payload: Vec<u8>,
    },
    /// Server acknowledges oplog messages up to `ack_version`
    ServerOpLogAck {
        /// Highest acknowledged version
        ack_version: u32,
    },
    /// Bg worker acknowledges row pushes up to `ack_version`
    BgServerPushRowAck {
        /// Highest acknowledged version
        ack_version: u32,
    },
    /// Enable early communication
    EarlyCommOn,
    /// Disable early communication
    EarlyCommOff,
    /// Ask a lagging bg worker to lower its suppression level
    AdjustSuppressionLevel,
}

impl Message {
    /// Tag of this message
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::ClientConnect { .. } => MsgType::ClientConnect,
            Message::ServerConnect => MsgType::ServerConnect,
            Message::AppConnect => MsgType::AppConnect,
            Message::BgCreateTable { .. } => MsgType::BgCreateTable,
            Message::CreateTable { .. } => MsgType::CreateTable,
            Message::CreateTableReply { .. } => MsgType::CreateTableReply,
            Message::CreatedAllTables => MsgType::CreatedAllTables,
            Message::RowRequest { .. } => MsgType::RowRequest,
            Message::RowRequestReply => MsgType::RowRequestReply,
            Message::ServerRowRequestReply { .. } => MsgType::ServerRowRequestReply,
            Message::BgClock => MsgType::BgClock,
            Message::BgSendOpLog => MsgType::BgSendOpLog,
            Message::ClientSendOpLog { .. } => MsgType::ClientSendOpLog,
            Message::ConnectServer => MsgType::ConnectServer,
            Message::ClientStart => MsgType::ClientStart,
            Message::AppThreadDereg => MsgType::AppThreadDereg,
            Message::ClientShutDown => MsgType::ClientShutDown,
            Message::ServerShutDownAck => MsgType::ServerShutDownAck,
            Message::ServerPushRow { .. } => MsgType::ServerPushRow,
            Message::ServerOpLogAck { .. } => MsgType::ServerOpLogAck,
            Message::BgServerPushRowAck { .. } => MsgType::BgServerPushRowAck,
            Message::EarlyCommOn => MsgType::EarlyCommOn,
            Message::EarlyCommOff => MsgType::EarlyCommOff,
            Message::AdjustSuppressionLevel => MsgType::AdjustSuppressionLevel,
        }
    }

    /// Payload bytes of variable-size messages
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Message::ServerRowRequestReply { row_data, .. } => Some(row_data),
            Message::ClientSendOpLog { payload, .. } | Message::ServerPushRow { payload, .. } => {
                Some(payload)
            }
            _ => None,
        }
    }
}

/// A framed message with its delivery bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Sender-assigned sequence number
    pub seq_num: u32,
    /// Highest sequence number the sender has received from the peer
    pub ack_num: u32,
    /// Body
    pub message: Message,
}

impl Envelope {
    /// Wrap a message with zero bookkeeping
    pub fn new(message: Message) -> Self {
        Self {
            seq_num: 0,
            ack_num: 0,
            message,
        }
    }

    /// Tag of the body
    pub fn msg_type(&self) -> MsgType {
        self.message.msg_type()
    }

    /// Encode into a fresh buffer
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + 32);
        MessageEncoder::new(&mut buf).encode(self)?;
        Ok(buf)
    }

    /// Decode one whole frame
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut decoder = MessageDecoder::new(bytes);
        let envelope = decoder.decode()?;
        match decoder.reader.len() {
            0 => Ok(envelope),
            n => Err(WireError::TrailingBytes(n)),
        }
    }
}

/// Writes frames to any `Write`
pub struct MessageEncoder<W: Write> {
    writer: W,
}

impl<W: Write> MessageEncoder<W> {
    /// Encoder over `writer`
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    fn i32(&mut self, field: &'static str, v: i32) -> Result<()> {
        self.writer
            .write_i32::<LittleEndian>(v)
            .map_err(|e| WireError::Encode(field, e))
    }

    fn u32(&mut self, field: &'static str, v: u32) -> Result<()> {
        self.writer
            .write_u32::<LittleEndian>(v)
            .map_err(|e| WireError::Encode(field, e))
    }

    fn bool(&mut self, field: &'static str, v: bool) -> Result<()> {
        self.writer
            .write_u8(u8::from(v))
            .map_err(|e| WireError::Encode(field, e))
    }

    fn bytes(&mut self, field: &'static str, v: &[u8]) -> Result<()> {
        self.writer
            .write_u64::<LittleEndian>(v.len() as u64)
            .and_then(|_| self.writer.write_all(v))
            .map_err(|e| WireError::Encode(field, e))
    }

    /// Write one frame
    pub fn encode(&mut self, envelope: &Envelope) -> Result<()> {
        self.i32("msg_type", envelope.msg_type() as i32)?;
        self.u32("seq_num", envelope.seq_num)?;
        self.u32("ack_num", envelope.ack_num)?;

        match &envelope.message {
            Message::ClientConnect { client_id } => self.i32("client_id", *client_id)?,
            Message::BgCreateTable { table_id, info } | Message::CreateTable { table_id, info } => {
                self.i32("table_id", *table_id)?;
                self.bytes("table_info", &info.to_bytes()?)?;
            }
            Message::CreateTableReply { table_id } => self.i32("table_id", *table_id)?,
            Message::RowRequest {
                table_id,
                row_id,
                clock,
                forced,
            } => {
                self.i32("table_id", *table_id)?;
                self.i32("row_id", *row_id)?;
                self.i32("clock", *clock)?;
                self.bool("forced", *forced)?;
            }
            Message::ServerRowRequestReply {
                table_id,
                row_id,
                clock,
                version,
                row_data,
            } => {
                self.i32("table_id", *table_id)?;
                self.i32("row_id", *row_id)?;
                self.i32("clock", *clock)?;
                self.u32("version", *version)?;
                self.bytes("row_data", row_data)?;
            }
            Message::ClientSendOpLog {
                is_clock,
                client_id,
                version,
                bg_clock,
                payload,
            } => {
                self.bool("is_clock", *is_clock)?;
                self.i32("client_id", *client_id)?;
                self.u32("version", *version)?;
                self.i32("bg_clock", *bg_clock)?;
                self.bytes("oplog", payload)?;
            }
            Message::ServerPushRow {
                clock,
                version,
                is_clock,
                payload,
            } => {
                self.i32("clock", *clock)?;
                self.u32("version", *version)?;
                self.bool("is_clock", *is_clock)?;
                self.bytes("rows", payload)?;
            }
            Message::ServerOpLogAck { ack_version }
            | Message::BgServerPushRowAck { ack_version } => {
                self.u32("ack_version", *ack_version)?
            }
            Message::ServerConnect
            | Message::AppConnect
            | Message::CreatedAllTables
            | Message::RowRequestReply
            | Message::BgClock
            | Message::BgSendOpLog
            | Message::ConnectServer
            | Message::ClientStart
            | Message::AppThreadDereg
            | Message::ClientShutDown
            | Message::ServerShutDownAck
            | Message::EarlyCommOn
            | Message::EarlyCommOff
            | Message::AdjustSuppressionLevel => {}
        }
        Ok(())
    }
}

/// Reads frames from a byte slice
pub struct MessageDecoder<'a> {
    reader: &'a [u8],
}

impl<'a> MessageDecoder<'a> {
    /// Decoder over `bytes`
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { reader: bytes }
    }

    fn i32(&mut self, field: &'static str) -> Result<i32> {
        self.reader
            .read_i32::<LittleEndian>()
            .map_err(|e| WireError::Decode(field, e))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32> {
        self.reader
            .read_u32::<LittleEndian>()
            .map_err(|e| WireError::Decode(field, e))
    }

    fn bool(&mut self, field: &'static str) -> Result<bool> {
        self.reader
            .read_u8()
            .map(|b| b != 0)
            .map_err(|e| WireError::Decode(field, e))
    }

    fn bytes(&mut self, field: &'static str) -> Result<Vec<u8>> {
        let len = self
            .reader
            .read_u64::<LittleEndian>()
            .map_err(|e| WireError::Decode(field, e))?;
        let len = usize::try_from(len).map_err(|_| {
            WireError::Decode(
                field,
                std::io::Error::new(std::io::ErrorKind::InvalidData, "length overflows usize"),
            )
        })?;
        if len > self.reader.len() {
            return Err(WireError::Decode(
                field,
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "payload truncated"),
            ));
        }
        let mut out = vec![0u8; len];
        self.reader
            .read_exact(&mut out)
            .map_err(|e| WireError::Decode(field, e))?;
        Ok(out)
    }

    /// Read one frame
    pub fn decode(&mut self) -> Result<Envelope> {
        let msg_type = MsgType::try_from(self.i32("msg_type")?)?;
        let seq_num = self.u32("seq_num")?;
        let ack_num = self.u32("ack_num")?;

        let message = match msg_type {
            MsgType::ClientConnect => Message::ClientConnect {
                client_id: self.i32("client_id")?,
            },
            MsgType::ServerConnect => Message::ServerConnect,
            MsgType::AppConnect => Message::AppConnect,
            MsgType::BgCreateTable => Message::BgCreateTable {
                table_id: self.i32("table_id")?,
                info: TableInfo::from_bytes(&self.bytes("table_info")?)?,
            },
            MsgType::CreateTable => Message::CreateTable {
                table_id: self.i32("table_id")?,
                info: TableInfo::from_bytes(&self.bytes("table_info")?)?,
            },
            MsgType::CreateTableReply => Message::CreateTableReply {
                table_id: self.i32("table_id")?,
            },
            MsgType::CreatedAllTables => Message::CreatedAllTables,
            MsgType::RowRequest => Message::RowRequest {
                table_id: self.i32("table_id")?,
                row_id: self.i32("row_id")?,
                clock: self.i32("clock")?,
                forced: self.bool("forced")?,
            },
            MsgType::RowRequestReply => Message::RowRequestReply,
            MsgType::ServerRowRequestReply => Message::ServerRowRequestReply {
                table_id: self.i32("table_id")?,
                row_id: self.i32("row_id")?,
                clock: self.i32("clock")?,
                version: self.u32("version")?,
                row_data: self.bytes("row_data")?,
            },
            MsgType::BgClock => Message::BgClock,
            MsgType::BgSendOpLog => Message::BgSendOpLog,
            MsgType::ClientSendOpLog => Message::ClientSendOpLog {
                is_clock: self.bool("is_clock")?,
                client_id: self.i32("client_id")?,
                version: self.u32("version")?,
                bg_clock: self.i32("bg_clock")?,
                payload: self.bytes("oplog")?,
            },
            MsgType::ConnectServer => Message::ConnectServer,
            MsgType::ClientStart => Message::ClientStart,
            MsgType::AppThreadDereg => Message::AppThreadDereg,
            MsgType::ClientShutDown => Message::ClientShutDown,
            MsgType::ServerShutDownAck => Message::ServerShutDownAck,
            MsgType::ServerPushRow => Message::ServerPushRow {
                clock: self.i32("clock")?,
                version: self.u32("version")?,
                is_clock: self.bool("is_clock")?,
                payload: self.bytes("rows")?,
            },
            MsgType::ServerOpLogAck => Message::ServerOpLogAck {
                ack_version: self.u32("ack_version")?,
            },
            MsgType::BgServerPushRowAck => Message::BgServerPushRowAck {
                ack_version: self.u32("ack_version")?,
            },
            MsgType::EarlyCommOn => Message::EarlyCommOn,
            MsgType::EarlyCommOff => Message::EarlyCommOff,
            MsgType::AdjustSuppressionLevel => Message::AdjustSuppressionLevel,
        };

        Ok(Envelope {
            seq_num,
            ack_num,
            message,
        })
    }
}
