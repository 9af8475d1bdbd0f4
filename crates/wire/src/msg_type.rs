//! Message type tags

use crate::error::WireError;

/// Numeric tag leading every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MsgType {
    /// Client process announces itself to the name node / servers
    ClientConnect = 0,
    /// Server announces itself
    ServerConnect = 1,
    /// Application thread registers with its bg worker
    AppConnect = 2,
    /// Application asks a bg worker to create a table
    BgCreateTable = 3,
    /// Bg worker asks servers to create a table
    CreateTable = 4,
    /// Table created
    CreateTableReply = 5,
    /// Every table has been created
    CreatedAllTables = 6,
    /// Fetch a row at a minimum clock
    RowRequest = 7,
    /// Bg worker tells an app thread its row arrived
    RowRequestReply = 8,
    /// Server sends a requested row
    ServerRowRequestReply = 9,
    /// App thread advanced its clock
    BgClock = 10,
    /// App thread asks its bg worker to flush
    BgSendOpLog = 11,
    /// Oplog payload from a bg worker
    ClientSendOpLog = 12,
    /// Bg worker connects to a server thread
    ConnectServer = 13,
    /// Client may start
    ClientStart = 14,
    /// App thread leaves
    AppThreadDereg = 15,
    /// Client is shutting down
    ClientShutDown = 16,
    /// Server acknowledges shutdown
    ServerShutDownAck = 17,
    /// Rows pushed by a server
    ServerPushRow = 18,
    /// Server acknowledges an oplog message
    ServerOpLogAck = 19,
    /// Bg worker acknowledges a row push
    BgServerPushRowAck = 20,
    /// Enable early communication
    EarlyCommOn = 21,
    /// Disable early communication
    EarlyCommOff = 22,
    /// Server asks a lagging bg worker to lower its suppression level
    AdjustSuppressionLevel = 23,
}

impl TryFrom<i32> for MsgType {
    type Error = WireError;

    fn try_from(value: i32) -> Result<Self, WireError> {
        use MsgType::*;
        Ok(match value {
            0 => ClientConnect,
            1 => ServerConnect,
            2 => AppConnect,
            3 => BgCreateTable,
            4 => CreateTable,
            5 => CreateTableReply,
            6 => CreatedAllTables,
            7 => RowRequest,
            8 => RowRequestReply,
            9 => ServerRowRequestReply,
            10 => BgClock,
            11 => BgSendOpLog,
            12 => ClientSendOpLog,
            13 => ConnectServer,
            14 => ClientStart,
            15 => AppThreadDereg,
            16 => ClientShutDown,
            17 => ServerShutDownAck,
            18 => ServerPushRow,
            19 => ServerOpLogAck,
            20 => BgServerPushRowAck,
            21 => EarlyCommOn,
            22 => EarlyCommOff,
            23 => AdjustSuppressionLevel,
            other => return Err(WireError::UnknownMsgType(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_stable() {
        for tag in 0..=23 {
            let ty = MsgType::try_from(tag).unwrap();
            assert_eq!(ty as i32, tag);
        }
        assert!(matches!(
            MsgType::try_from(24),
            Err(WireError::UnknownMsgType(24))
        ));
    }
}
